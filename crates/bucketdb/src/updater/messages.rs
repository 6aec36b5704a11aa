//! Storage-API messages consumed and produced by the updater.
//!
//! Wire serialization is out of scope; these are the in-process shapes the
//! surrounding distributor hands to the updater and receives back through a
//! `MessageSender`.

use std::sync::Arc;

use super::cluster_state::{ClusterState, ClusterStateBundle};
use super::types::{Bucket, BucketId, BucketInfo, BucketSpace, MessageId, NodeIndex};

/// Result code carried by storage replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    NotConnected,
    Busy,
    Timeout,
    Aborted,
    Internal,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

/// Hands out distributor-local, monotonically increasing message ids.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: MessageId,
}

impl MessageIdGenerator {
    pub fn new(start: MessageId) -> Self {
        Self { next: start.max(1) }
    }

    pub fn next_id(&mut self) -> MessageId {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Clone, Debug)]
pub struct SetSystemStateCommand {
    pub msg_id: MessageId,
    pub bundle: Arc<ClusterStateBundle>,
}

impl SetSystemStateCommand {
    pub fn new(msg_id: MessageId, bundle: ClusterStateBundle) -> Self {
        Self {
            msg_id,
            bundle: Arc::new(bundle),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetSystemStateReply {
    pub msg_id: MessageId,
    pub version: u32,
}

impl SetSystemStateReply {
    pub fn for_command(cmd: &SetSystemStateCommand) -> Self {
        Self {
            msg_id: cmd.msg_id,
            version: cmd.bundle.version(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActivateClusterStateVersionCommand {
    pub msg_id: MessageId,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivateClusterStateVersionReply {
    pub msg_id: MessageId,
    pub version: u32,
    /// Version actually pending; 0 means "not ready yet, resend".
    pub actual_version: u32,
}

/// Bucket-info request to one storage node. An empty `buckets` list asks for
/// every bucket the requesting distributor owns under `cluster_state`.
#[derive(Clone, Debug)]
pub struct RequestBucketInfoCommand {
    pub msg_id: MessageId,
    pub space: BucketSpace,
    pub target_node: NodeIndex,
    pub buckets: Vec<BucketId>,
    pub distributor: NodeIndex,
    pub cluster_state: Option<Arc<ClusterState>>,
}

impl RequestBucketInfoCommand {
    pub fn is_full_listing(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct RequestBucketInfoReply {
    pub msg_id: MessageId,
    pub target_node: NodeIndex,
    pub result: ResultCode,
    pub buckets: Vec<(BucketId, BucketInfo)>,
}

impl RequestBucketInfoReply {
    pub fn ok(cmd: &RequestBucketInfoCommand, buckets: Vec<(BucketId, BucketInfo)>) -> Self {
        Self {
            msg_id: cmd.msg_id,
            target_node: cmd.target_node,
            result: ResultCode::Ok,
            buckets,
        }
    }

    pub fn failed(cmd: &RequestBucketInfoCommand, result: ResultCode) -> Self {
        Self {
            msg_id: cmd.msg_id,
            target_node: cmd.target_node,
            result,
            buckets: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotifyBucketChangeCommand {
    pub msg_id: MessageId,
    pub source_node: NodeIndex,
    pub bucket: Bucket,
    pub info: BucketInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyBucketChangeReply {
    pub msg_id: MessageId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeNode {
    pub index: NodeIndex,
    pub source_only: bool,
}

#[derive(Clone, Debug)]
pub struct MergeBucketReply {
    pub msg_id: MessageId,
    pub bucket: Bucket,
    pub nodes: Vec<MergeNode>,
    pub result: ResultCode,
}

/// Everything the updater emits.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// Command to a storage node.
    RequestBucketInfo(RequestBucketInfoCommand),
    /// Reply to a superseded set-system-state command.
    SetSystemStateReply(SetSystemStateReply),
    ActivateClusterStateVersionReply(ActivateClusterStateVersionReply),
    NotifyBucketChangeReply(NotifyBucketChangeReply),
    /// Set-system-state command passed on to the next component once this
    /// updater has finished (or deferred) processing it.
    SetSystemStateForwarded(SetSystemStateCommand),
    /// A versioned transition was activated.
    ClusterStateEnabled(Arc<ClusterStateBundle>),
    /// An unversioned distribution-config transition was activated.
    DistributionChangeEnabled,
    /// All rechecks for a merge resolved; hand the merge reply back to its owner.
    MergeCompleted(MergeBucketReply),
}

/// Outbound path of the updater. Sending never blocks.
pub trait MessageSender: Send + 'static {
    fn send_message(&mut self, msg: Outbound);
}

impl MessageSender for tokio::sync::mpsc::UnboundedSender<Outbound> {
    fn send_message(&mut self, msg: Outbound) {
        if self.send(msg).is_err() {
            tracing::debug!("outbound channel closed; dropping message");
        }
    }
}
