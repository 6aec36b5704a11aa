//! One in-flight cluster-state or distribution transition.
//!
//! A `PendingClusterState` fans out full bucket-info requests to the storage
//! nodes whose view may have changed, accumulates their replies, and once
//! every request is answered merges the replies into the bucket databases.
//!
//! Lifecycle: `Created -> AwaitingReplies -> Complete`. Failed requests are
//! resent after a fixed delay measured from the failure. A superseded pending
//! state is simply dropped; replies to its requests no longer match any
//! tracked message id.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use super::bucket_space::BucketSpaceRepo;
use super::clock::Clock;
use super::cluster_state::{ClusterState, ClusterStateBundle, NodeType, UpStates};
use super::distribution::{Distribution, DISTRIBUTOR_UP_STATES};
use super::merger::{sort_bucket_list, BucketEntry, BucketListMerger};
use super::messages::{
    MessageIdGenerator, MessageSender, Outbound, RequestBucketInfoCommand,
    RequestBucketInfoReply, SetSystemStateCommand,
};
use super::status::XmlWriter;
use super::types::{BucketId, BucketSpace, MessageId, NodeIndex};

/// Per bucket space, storage nodes whose database view cannot be trusted.
pub type OutdatedNodesMap = BTreeMap<BucketSpace, BTreeSet<NodeIndex>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingPhase {
    Created,
    AwaitingReplies,
    Complete,
}

/// History record of a completed versioned transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionSummary {
    pub prev_cluster_state: String,
    pub new_cluster_state: String,
    pub processing_time_ms: u64,
}

/// What the pending state needs to know about the distributor at creation.
#[derive(Clone, Debug)]
pub struct ClusterInformation {
    pub distributor_index: NodeIndex,
    pub current: Arc<ClusterStateBundle>,
    pub up_states: UpStates,
    pub retry_delay_ms: u64,
}

/// Borrowed collaborators used while issuing requests.
pub struct TransitionContext<'a> {
    pub clock: &'a dyn Clock,
    pub sender: &'a mut dyn MessageSender,
    pub ids: &'a mut MessageIdGenerator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeRequest {
    space: BucketSpace,
    node: NodeIndex,
}

struct SpaceTransition {
    new_state: Arc<ClusterState>,
    distribution: Arc<dyn Distribution>,
    /// Nodes asked for a full listing in this transition.
    requested: BTreeSet<NodeIndex>,
    /// Nodes available before but not after; their replicas were pruned.
    pruned: BTreeSet<NodeIndex>,
    replies: BTreeMap<NodeIndex, Vec<BucketEntry>>,
}

pub struct PendingClusterState {
    old_bundle: Arc<ClusterStateBundle>,
    new_bundle: Arc<ClusterStateBundle>,
    cmd: Option<SetSystemStateCommand>,
    versioned: bool,
    deferred: bool,
    distributor_index: NodeIndex,
    up_states: UpStates,
    retry_delay_ms: u64,
    creation_timestamp: u64,
    started_at_ms: u64,
    spaces: BTreeMap<BucketSpace, SpaceTransition>,
    sent_messages: BTreeMap<MessageId, NodeRequest>,
    /// Failed requests with their resend deadline, in deadline order.
    delayed: VecDeque<(u64, NodeRequest)>,
    phase: PendingPhase,
}

fn distributor_availability_changed(old: &ClusterState, new: &ClusterState) -> bool {
    let count = old
        .node_count(NodeType::Distributor)
        .max(new.node_count(NodeType::Distributor));
    (0..count).any(|idx| {
        old.node_is_up(NodeType::Distributor, idx, DISTRIBUTOR_UP_STATES)
            != new.node_is_up(NodeType::Distributor, idx, DISTRIBUTOR_UP_STATES)
    })
}

/// Nodes that must report in for `new` to be trusted, given the previously
/// active `old` state and nodes left outdated by a superseded transition.
fn nodes_to_request(
    old: &ClusterState,
    new: &ClusterState,
    up_states: UpStates,
    outdated: Option<&BTreeSet<NodeIndex>>,
) -> BTreeSet<NodeIndex> {
    let new_up = new.up_storage_nodes(up_states);
    if old.distribution_bits != new.distribution_bits || distributor_availability_changed(old, new)
    {
        return new_up;
    }
    new_up
        .into_iter()
        .filter(|node| {
            !old.node_is_up(NodeType::Storage, *node, up_states)
                || outdated.is_some_and(|o| o.contains(node))
        })
        .collect()
}

impl PendingClusterState {
    fn new(
        info: &ClusterInformation,
        new_bundle: Arc<ClusterStateBundle>,
        cmd: Option<SetSystemStateCommand>,
        versioned: bool,
        creation_timestamp: u64,
        now_ms: u64,
    ) -> Self {
        let deferred = versioned && new_bundle.deferred_activation;
        Self {
            old_bundle: info.current.clone(),
            new_bundle,
            cmd,
            versioned,
            deferred,
            distributor_index: info.distributor_index,
            up_states: info.up_states,
            retry_delay_ms: info.retry_delay_ms,
            creation_timestamp,
            started_at_ms: now_ms,
            spaces: BTreeMap::new(),
            sent_messages: BTreeMap::new(),
            delayed: VecDeque::new(),
            phase: PendingPhase::Created,
        }
    }

    /// Transition to the bundle carried by `cmd`. Only nodes whose
    /// availability changed (or all nodes, when ownership may move) are
    /// queried.
    pub fn create_for_cluster_state_change(
        ctx: TransitionContext<'_>,
        repo: &BucketSpaceRepo,
        info: &ClusterInformation,
        cmd: SetSystemStateCommand,
        outdated_nodes: &OutdatedNodesMap,
        creation_timestamp: u64,
    ) -> Self {
        let new_bundle = cmd.bundle.clone();
        let mut pending = Self::new(
            info,
            new_bundle.clone(),
            Some(cmd),
            true,
            creation_timestamp,
            ctx.clock.now_ms(),
        );
        for (space, bucket_space) in repo.iter() {
            let old_state = info.current.derived_state(*space);
            let new_state = new_bundle.derived_state(*space);
            let requested = nodes_to_request(
                &old_state,
                &new_state,
                info.up_states,
                outdated_nodes.get(space),
            );
            let pruned = old_state
                .up_storage_nodes(info.up_states)
                .difference(&new_state.up_storage_nodes(info.up_states))
                .copied()
                .collect();
            pending.spaces.insert(
                *space,
                SpaceTransition {
                    new_state,
                    distribution: bucket_space.distribution().clone(),
                    requested,
                    pruned,
                    replies: BTreeMap::new(),
                },
            );
        }
        pending.request_nodes(ctx);
        pending
    }

    /// Unversioned transition after a distribution config change: ideal
    /// placement may change for every bucket, so every up node is queried.
    pub fn create_for_distribution_change(
        ctx: TransitionContext<'_>,
        repo: &BucketSpaceRepo,
        info: &ClusterInformation,
        creation_timestamp: u64,
    ) -> Self {
        let mut pending = Self::new(
            info,
            info.current.clone(),
            None,
            false,
            creation_timestamp,
            ctx.clock.now_ms(),
        );
        for (space, bucket_space) in repo.iter() {
            let state = info.current.derived_state(*space);
            let requested = state.up_storage_nodes(info.up_states);
            pending.spaces.insert(
                *space,
                SpaceTransition {
                    new_state: state,
                    distribution: bucket_space.distribution().clone(),
                    requested,
                    pruned: BTreeSet::new(),
                    replies: BTreeMap::new(),
                },
            );
        }
        pending.request_nodes(ctx);
        pending
    }

    fn request_nodes(&mut self, mut ctx: TransitionContext<'_>) {
        let requests: Vec<NodeRequest> = self
            .spaces
            .iter()
            .flat_map(|(space, t)| {
                t.requested.iter().map(|node| NodeRequest {
                    space: *space,
                    node: *node,
                })
            })
            .collect();
        for req in requests {
            self.send_request(&mut ctx, req);
        }
        self.phase = if self.done() {
            PendingPhase::Complete
        } else {
            PendingPhase::AwaitingReplies
        };
        tracing::debug!(
            version = self.cluster_state_version(),
            versioned = self.versioned,
            requests = self.sent_messages.len(),
            "created pending cluster state"
        );
    }

    fn send_request(&mut self, ctx: &mut TransitionContext<'_>, req: NodeRequest) {
        let Some(transition) = self.spaces.get(&req.space) else {
            return;
        };
        let msg_id = ctx.ids.next_id();
        let cmd = RequestBucketInfoCommand {
            msg_id,
            space: req.space,
            target_node: req.node,
            buckets: Vec::new(),
            distributor: self.distributor_index,
            cluster_state: Some(transition.new_state.clone()),
        };
        tracing::debug!(
            msg_id,
            node = req.node,
            space = %req.space,
            "requesting full bucket info"
        );
        self.sent_messages.insert(msg_id, req);
        ctx.sender.send_message(Outbound::RequestBucketInfo(cmd));
    }

    /// Returns false when `reply` does not answer a request of this
    /// transition. Failed replies are scheduled for a delayed resend.
    pub fn on_request_bucket_info_reply(
        &mut self,
        reply: &RequestBucketInfoReply,
        now_ms: u64,
    ) -> bool {
        let Some(req) = self.sent_messages.remove(&reply.msg_id) else {
            return false;
        };
        if !reply.result.is_ok() {
            tracing::debug!(
                msg_id = reply.msg_id,
                node = req.node,
                result = ?reply.result,
                "bucket info request failed; resending after delay"
            );
            self.delayed
                .push_back((now_ms.saturating_add(self.retry_delay_ms), req));
            return true;
        }
        if let Some(transition) = self.spaces.get_mut(&req.space) {
            transition.replies.insert(req.node, reply.buckets.clone());
        }
        if self.done() {
            self.phase = PendingPhase::Complete;
        }
        true
    }

    /// Resend failed requests whose delay has elapsed.
    pub fn resend_delayed_messages(&mut self, mut ctx: TransitionContext<'_>) {
        let now = ctx.clock.now_ms();
        while self.delayed.front().is_some_and(|(deadline, _)| *deadline <= now) {
            let Some((_, req)) = self.delayed.pop_front() else {
                break;
            };
            self.send_request(&mut ctx, req);
        }
    }

    pub fn done(&self) -> bool {
        self.sent_messages.is_empty() && self.delayed.is_empty()
    }

    pub fn phase(&self) -> PendingPhase {
        self.phase
    }

    /// Nodes to re-query if this transition is superseded: everything it
    /// asked (its replies are discarded) and everything it pruned.
    pub fn outdated_nodes_map(&self) -> OutdatedNodesMap {
        self.spaces
            .iter()
            .map(|(space, t)| (*space, t.requested.union(&t.pruned).copied().collect()))
            .filter(|(_, nodes): &(BucketSpace, BTreeSet<NodeIndex>)| !nodes.is_empty())
            .collect()
    }

    /// Merge every accumulated reply into the databases of `repo`. Only
    /// buckets owned by this distributor under the new state are added; new
    /// copies carry the transition's creation timestamp.
    pub fn merge_into_bucket_databases(&self, repo: &BucketSpaceRepo) {
        let timestamp = self.creation_timestamp;
        for (space, transition) in &self.spaces {
            if transition.replies.is_empty() {
                continue;
            }
            let Some(bucket_space) = repo.get(*space) else {
                continue;
            };
            let db = bucket_space.bucket_database();

            // The database iterates in key order, so these come out sorted.
            let mut existing: BTreeMap<NodeIndex, Vec<BucketEntry>> = transition
                .replies
                .keys()
                .map(|node| (*node, Vec::new()))
                .collect();
            db.for_each(|entry| {
                for copy in entry.copies() {
                    if let Some(list) = existing.get_mut(&copy.node) {
                        list.push((entry.bucket(), copy.info));
                    }
                }
            });

            let mut owned_superbuckets: HashMap<u64, bool> = HashMap::new();
            let mut owns = |bucket: BucketId| -> bool {
                if u16::from(bucket.used_bits()) < transition.new_state.distribution_bits {
                    return false;
                }
                *owned_superbuckets
                    .entry(bucket.superbucket(transition.new_state.distribution_bits))
                    .or_insert_with(|| {
                        transition
                            .distribution
                            .ideal_distributor(&transition.new_state, bucket)
                            .is_ok_and(|d| d == self.distributor_index)
                    })
            };

            for (node, reported) in &transition.replies {
                let mut reported: Vec<BucketEntry> = reported
                    .iter()
                    .filter(|(bucket, _)| owns(*bucket))
                    .copied()
                    .collect();
                sort_bucket_list(&mut reported);
                let known = existing.remove(node).unwrap_or_default();
                let merger = BucketListMerger::new(&reported, &known, timestamp);
                merger.apply_to(db, *node, |bucket| {
                    transition.distribution.ideal_storage_nodes(
                        &transition.new_state,
                        bucket,
                        self.up_states,
                    )
                });
                tracing::debug!(
                    node = *node,
                    space = %space,
                    added = merger.added_entries().len(),
                    removed = merger.removed_entries().len(),
                    "merged node bucket list into database"
                );
            }
        }
    }

    pub fn is_versioned_transition(&self) -> bool {
        self.versioned
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn cluster_state_version(&self) -> u32 {
        self.new_bundle.version()
    }

    pub fn new_bundle(&self) -> &Arc<ClusterStateBundle> {
        &self.new_bundle
    }

    pub fn old_bundle(&self) -> &Arc<ClusterStateBundle> {
        &self.old_bundle
    }

    pub fn take_command(&mut self) -> Option<SetSystemStateCommand> {
        self.cmd.take()
    }

    pub fn summary(&self, now_ms: u64) -> TransitionSummary {
        TransitionSummary {
            prev_cluster_state: self.old_bundle.baseline.to_string(),
            new_cluster_state: self.new_bundle.baseline.to_string(),
            processing_time_ms: now_ms.saturating_sub(self.started_at_ms),
        }
    }

    pub fn write_xml(&self, xml: &mut XmlWriter, now_ms: u64) {
        xml.tag("systemstate_pending")
            .attr("state", &self.new_bundle.baseline)
            .attr("versioned", self.versioned)
            .attr("deferred", self.deferred)
            .attr("processingtime", now_ms.saturating_sub(self.started_at_ms));
        for (msg_id, req) in &self.sent_messages {
            xml.tag("pending")
                .attr("msgid", msg_id)
                .attr("node", req.node)
                .attr("bucketspace", format!("{:#x}", req.space.0))
                .end();
        }
        for (deadline, req) in &self.delayed {
            xml.tag("delayed")
                .attr("node", req.node)
                .attr("bucketspace", format!("{:#x}", req.space.0))
                .attr("resendtimestamp", deadline)
                .end();
        }
        xml.end();
    }
}

impl std::fmt::Debug for PendingClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingClusterState")
            .field("new_state", &self.new_bundle.to_string())
            .field("versioned", &self.versioned)
            .field("deferred", &self.deferred)
            .field("phase", &self.phase)
            .field("sent_messages", &self.sent_messages.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}
