//! Single-owner task loop around `BucketDbUpdater`.
//!
//! The updater is moved into one tokio task; callers talk to it through a
//! cloneable `UpdaterHandle` that sends `UpdaterRequest`s over a channel and
//! awaits the handler's answer on a oneshot. The same loop ticks
//! `resend_delayed_messages` on a fixed interval.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use super::distribution::Distribution;
use super::messages::{
    ActivateClusterStateVersionCommand, MergeBucketReply, NotifyBucketChangeCommand,
    RequestBucketInfoReply, SetSystemStateCommand,
};
use super::types::{Bucket, BucketSpace, NodeIndex};
use super::updater_core::BucketDbUpdater;

const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// Everything the service loop accepts.
pub enum UpdaterRequest {
    SetSystemState(SetSystemStateCommand, oneshot::Sender<bool>),
    ActivateClusterStateVersion(ActivateClusterStateVersionCommand, oneshot::Sender<bool>),
    RequestBucketInfoReply(RequestBucketInfoReply, oneshot::Sender<bool>),
    NotifyBucketChange(NotifyBucketChangeCommand, oneshot::Sender<bool>),
    MergeBucketReply(MergeBucketReply, oneshot::Sender<bool>),
    StorageDistributionChanged(
        BTreeMap<BucketSpace, Arc<dyn Distribution>>,
        oneshot::Sender<()>,
    ),
    RecheckBucketInfo(NodeIndex, Bucket),
    Status(oneshot::Sender<String>),
    Stats(oneshot::Sender<UpdaterStats>),
    /// Flush and stop the loop.
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time counters read from the updater.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdaterStats {
    pub active_version: u32,
    pub pending_transition: bool,
    pub outstanding_requests: usize,
    pub delayed_requests: usize,
    pub open_merge_guards: usize,
    pub removed_buckets: u64,
    pub history_entries: usize,
}

impl UpdaterStats {
    fn collect(updater: &BucketDbUpdater) -> Self {
        Self {
            active_version: updater.active_bundle().version(),
            pending_transition: updater.has_pending_cluster_state(),
            outstanding_requests: updater.sent_message_count(),
            delayed_requests: updater.delayed_message_count(),
            open_merge_guards: updater.open_merge_guards(),
            removed_buckets: updater.removed_buckets(),
            history_entries: updater.history().count(),
        }
    }
}

#[derive(Clone)]
pub struct UpdaterHandle {
    tx: mpsc::Sender<UpdaterRequest>,
}

impl UpdaterHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> UpdaterRequest,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("bucket db updater stopped"))?;
        rx.await.context("bucket db updater dropped request")
    }

    pub async fn set_system_state(&self, cmd: SetSystemStateCommand) -> anyhow::Result<bool> {
        self.call(|tx| UpdaterRequest::SetSystemState(cmd, tx)).await
    }

    pub async fn activate_cluster_state_version(
        &self,
        cmd: ActivateClusterStateVersionCommand,
    ) -> anyhow::Result<bool> {
        self.call(|tx| UpdaterRequest::ActivateClusterStateVersion(cmd, tx))
            .await
    }

    pub async fn request_bucket_info_reply(
        &self,
        reply: RequestBucketInfoReply,
    ) -> anyhow::Result<bool> {
        self.call(|tx| UpdaterRequest::RequestBucketInfoReply(reply, tx))
            .await
    }

    pub async fn notify_bucket_change(
        &self,
        cmd: NotifyBucketChangeCommand,
    ) -> anyhow::Result<bool> {
        self.call(|tx| UpdaterRequest::NotifyBucketChange(cmd, tx))
            .await
    }

    pub async fn merge_bucket_reply(&self, reply: MergeBucketReply) -> anyhow::Result<bool> {
        self.call(|tx| UpdaterRequest::MergeBucketReply(reply, tx))
            .await
    }

    pub async fn storage_distribution_changed(
        &self,
        distributions: BTreeMap<BucketSpace, Arc<dyn Distribution>>,
    ) -> anyhow::Result<()> {
        self.call(|tx| UpdaterRequest::StorageDistributionChanged(distributions, tx))
            .await
    }

    pub async fn recheck_bucket_info(&self, node: NodeIndex, bucket: Bucket) -> anyhow::Result<()> {
        self.tx
            .send(UpdaterRequest::RecheckBucketInfo(node, bucket))
            .await
            .map_err(|_| anyhow::anyhow!("bucket db updater stopped"))
    }

    /// XML status page.
    pub async fn status(&self) -> anyhow::Result<String> {
        self.call(UpdaterRequest::Status).await
    }

    pub async fn stats(&self) -> anyhow::Result<UpdaterStats> {
        self.call(UpdaterRequest::Stats).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.call(UpdaterRequest::Shutdown).await
    }
}

pub struct UpdaterService;

impl UpdaterService {
    /// Move `updater` into its own task and return a handle to it.
    pub fn spawn(updater: BucketDbUpdater) -> UpdaterHandle {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        tokio::spawn(run(updater, rx));
        UpdaterHandle { tx }
    }
}

async fn run(mut updater: BucketDbUpdater, mut rx: mpsc::Receiver<UpdaterRequest>) {
    let mut ticker = time::interval(updater.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else {
                    tracing::debug!("all updater handles dropped; flushing");
                    updater.flush();
                    return;
                };
                if let Some(done) = handle_request(&mut updater, request) {
                    updater.flush();
                    let _ = done.send(());
                    tracing::debug!("bucket db updater stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                updater.resend_delayed_messages();
            }
        }
    }
}

/// Dispatch one request. Returns the shutdown acknowledgement when the loop
/// should stop.
fn handle_request(
    updater: &mut BucketDbUpdater,
    request: UpdaterRequest,
) -> Option<oneshot::Sender<()>> {
    // A dropped receiver only means the caller stopped waiting.
    match request {
        UpdaterRequest::SetSystemState(cmd, tx) => {
            let _ = tx.send(updater.on_set_system_state(cmd));
        }
        UpdaterRequest::ActivateClusterStateVersion(cmd, tx) => {
            let _ = tx.send(updater.on_activate_cluster_state_version(&cmd));
        }
        UpdaterRequest::RequestBucketInfoReply(reply, tx) => {
            let _ = tx.send(updater.on_request_bucket_info_reply(&reply));
        }
        UpdaterRequest::NotifyBucketChange(cmd, tx) => {
            let _ = tx.send(updater.on_notify_bucket_change(&cmd));
        }
        UpdaterRequest::MergeBucketReply(reply, tx) => {
            let _ = tx.send(updater.on_merge_bucket_reply(reply));
        }
        UpdaterRequest::StorageDistributionChanged(distributions, tx) => {
            updater.storage_distribution_changed(distributions);
            let _ = tx.send(());
        }
        UpdaterRequest::RecheckBucketInfo(node, bucket) => {
            updater.recheck_bucket_info(node, bucket);
        }
        UpdaterRequest::Status(tx) => {
            let _ = tx.send(updater.report_status());
        }
        UpdaterRequest::Stats(tx) => {
            let _ = tx.send(UpdaterStats::collect(updater));
        }
        UpdaterRequest::Shutdown(tx) => return Some(tx),
    }
    None
}
