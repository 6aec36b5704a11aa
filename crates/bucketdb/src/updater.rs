//! Bucket database updater wiring.
//!
//! `types` and `messages` define the shared value and message contracts,
//! `cluster_state` and `distribution` describe topology and ownership,
//! `bucket_db`/`bucket_space` hold replica metadata, `merger`,
//! `node_remover` and `prune_elision` implement reconciliation, `pending`
//! tracks one in-flight transition and `updater_core` orchestrates it all.
//! `service` runs the updater as a single-owner tokio task.

mod bucket_db;
mod bucket_space;
mod clock;
mod cluster_state;
mod config;
mod distribution;
mod merger;
mod messages;
mod node_remover;
mod pending;
mod prune_elision;
mod service;
mod status;
mod types;
mod updater_core;

pub use bucket_db::{BucketDatabase, Entry, MergeResult};
pub use bucket_space::{BucketSpaceRepo, DistributorBucketSpace};
pub use clock::{Clock, ManualClock, SystemClock, UniqueTimestamps};
pub use cluster_state::{ClusterState, ClusterStateBundle, NodeType, State, UpStates};
pub use config::UpdaterConfig;
pub use distribution::{
    Distribution, DistributionError, RendezvousDistribution, DISTRIBUTOR_UP_STATES,
};
pub use merger::{sort_bucket_list, BucketEntry, BucketListMerger};
pub use messages::{
    ActivateClusterStateVersionCommand, ActivateClusterStateVersionReply, MergeBucketReply,
    MergeNode, MessageIdGenerator, MessageSender, NotifyBucketChangeCommand,
    NotifyBucketChangeReply, Outbound, RequestBucketInfoCommand, RequestBucketInfoReply,
    ResultCode, SetSystemStateCommand, SetSystemStateReply,
};
pub use node_remover::{MergingNodeRemover, PruneOutcome};
pub use pending::{
    ClusterInformation, OutdatedNodesMap, PendingClusterState, PendingPhase, TransitionContext,
    TransitionSummary,
};
pub use prune_elision::db_pruning_may_be_elided;
pub use service::{UpdaterHandle, UpdaterRequest, UpdaterService, UpdaterStats};
pub use status::{XmlWriter, STATUS_CONTENT_TYPE};
pub use types::{Bucket, BucketCopy, BucketId, BucketInfo, BucketSpace, MessageId, NodeIndex};
pub use updater_core::{BucketDbUpdater, BucketOwnership, BucketRequest};
