//! Distributor bucket database crate.
//!
//! This crate keeps a distributor's view of bucket replicas consistent with the
//! cluster state. Higher layers supply a `Distribution`, a `Clock` and a
//! `MessageSender`, then feed inbound storage messages through
//! `BucketDbUpdater` (directly, or through the `UpdaterService` task loop).

pub mod updater;
