//! The bucket database updater.
//!
//! `BucketDbUpdater` owns at most one `PendingClusterState`, the map of
//! in-flight single-bucket requests, their delayed-retry queue and a bounded
//! transition history. Every inbound command has one handler returning
//! whether the command was consumed.
//!
//! Design: the updater is single-owner and never locks its own state; the
//! bucket databases it mutates are shared and synchronize internally. See
//! `service` for the task loop that owns it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use super::bucket_space::BucketSpaceRepo;
use super::clock::{Clock, UniqueTimestamps};
use super::cluster_state::{ClusterState, ClusterStateBundle, NodeType};
use super::config::UpdaterConfig;
use super::distribution::Distribution;
use super::merger::{sort_bucket_list, BucketEntry, BucketListMerger};
use super::messages::{
    ActivateClusterStateVersionCommand, ActivateClusterStateVersionReply, MergeBucketReply,
    MessageIdGenerator, MessageSender, NotifyBucketChangeCommand, NotifyBucketChangeReply,
    Outbound, RequestBucketInfoCommand, RequestBucketInfoReply, SetSystemStateCommand,
    SetSystemStateReply,
};
use super::node_remover::MergingNodeRemover;
use super::pending::{
    ClusterInformation, OutdatedNodesMap, PendingClusterState, TransitionContext,
    TransitionSummary,
};
use super::prune_elision::db_pruning_may_be_elided;
use super::status::{XmlWriter, STATUS_CONTENT_TYPE};
use super::types::{Bucket, BucketId, BucketSpace, MessageId, NodeIndex};

type MergeGuardId = u64;

/// One outstanding single-bucket info request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRequest {
    pub target_node: NodeIndex,
    pub bucket: Bucket,
    pub sent_at_ms: u64,
    merge_guard: Option<MergeGuardId>,
}

/// Answer of `check_ownership_in_pending_state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketOwnership {
    Owned,
    /// Not owned by this distributor under the carried pending state.
    NotOwnedInPendingState(Arc<ClusterState>),
}

/// Counted completion token for one merge reply. The reply is forwarded
/// exactly once, when the last recheck holding the token resolves.
#[derive(Debug)]
struct MergeReplyGuard {
    reply: MergeBucketReply,
    outstanding: usize,
}

pub struct BucketDbUpdater {
    config: UpdaterConfig,
    repo: BucketSpaceRepo,
    read_only_repo: BucketSpaceRepo,
    active_bundle: Arc<ClusterStateBundle>,
    pending: Option<PendingClusterState>,
    outdated_nodes: OutdatedNodesMap,
    sent_messages: BTreeMap<MessageId, BucketRequest>,
    /// Failed single-bucket requests with their resend deadline, in deadline
    /// order.
    delayed_requests: VecDeque<(u64, BucketRequest)>,
    enqueued_rechecks: BTreeSet<(NodeIndex, Bucket)>,
    merge_guards: HashMap<MergeGuardId, MergeReplyGuard>,
    next_guard_id: MergeGuardId,
    history: VecDeque<TransitionSummary>,
    transition_started_at_ms: Option<u64>,
    last_transition_ms: Option<u64>,
    removed_buckets: u64,
    sender: Box<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    ids: MessageIdGenerator,
    timestamps: UniqueTimestamps,
}

impl BucketDbUpdater {
    pub fn new(
        config: UpdaterConfig,
        repo: BucketSpaceRepo,
        sender: Box<dyn MessageSender>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let read_only_repo = repo.read_only_mirror();
        Ok(Self {
            config,
            repo,
            read_only_repo,
            active_bundle: Arc::new(ClusterStateBundle::default()),
            pending: None,
            outdated_nodes: OutdatedNodesMap::new(),
            sent_messages: BTreeMap::new(),
            delayed_requests: VecDeque::new(),
            enqueued_rechecks: BTreeSet::new(),
            merge_guards: HashMap::new(),
            next_guard_id: 1,
            history: VecDeque::new(),
            transition_started_at_ms: None,
            last_transition_ms: None,
            removed_buckets: 0,
            sender,
            clock,
            ids: MessageIdGenerator::default(),
            timestamps: UniqueTimestamps::default(),
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn bucket_space_repo(&self) -> &BucketSpaceRepo {
        &self.repo
    }

    /// Entries moved away during a deferred transition, kept for reads until
    /// the next activation.
    pub fn read_only_bucket_space_repo(&self) -> &BucketSpaceRepo {
        &self.read_only_repo
    }

    pub fn active_bundle(&self) -> &Arc<ClusterStateBundle> {
        &self.active_bundle
    }

    pub fn has_pending_cluster_state(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingClusterState> {
        self.pending.as_ref()
    }

    /// Completed versioned transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionSummary> {
        self.history.iter()
    }

    pub fn sent_message_count(&self) -> usize {
        self.sent_messages.len()
    }

    pub fn delayed_message_count(&self) -> usize {
        self.delayed_requests.len()
    }

    pub fn open_merge_guards(&self) -> usize {
        self.merge_guards.len()
    }

    pub fn enqueued_recheck_count(&self) -> usize {
        self.enqueued_rechecks.len()
    }

    /// Buckets that lost every replica during pruning, since creation.
    pub fn removed_buckets(&self) -> u64 {
        self.removed_buckets
    }

    /// Duration of the last completed series of overlapping transitions.
    pub fn last_transition_ms(&self) -> Option<u64> {
        self.last_transition_ms
    }

    fn cluster_information(&self) -> ClusterInformation {
        ClusterInformation {
            distributor_index: self.config.distributor_index,
            current: self.active_bundle.clone(),
            up_states: self.config.storage_up_states,
            retry_delay_ms: self.config.retry_delay_ms,
        }
    }

    fn storage_node_is_up(&self, space: BucketSpace, node: NodeIndex) -> bool {
        self.repo.get(space).is_some_and(|bs| {
            bs.cluster_state()
                .node_is_up(NodeType::Storage, node, self.config.storage_up_states)
        })
    }

    fn storage_node_is_up_in_pending(&self, space: BucketSpace, node: NodeIndex) -> bool {
        self.pending_cluster_state(space).map_or(true, |state| {
            state.node_is_up(NodeType::Storage, node, self.config.storage_up_states)
        })
    }

    fn owned_in_state(
        &self,
        state: &ClusterState,
        distribution: &dyn Distribution,
        bucket: BucketId,
    ) -> bool {
        distribution
            .ideal_distributor(state, bucket)
            .is_ok_and(|d| d == self.config.distributor_index)
    }

    /// Handle a new cluster state. Returns false when it is identical to the
    /// active one.
    pub fn on_set_system_state(&mut self, cmd: SetSystemStateCommand) -> bool {
        tracing::debug!(state = %cmd.bundle, msg_id = cmd.msg_id, "received new cluster state");
        if *cmd.bundle == *self.active_bundle {
            tracing::debug!(
                version = cmd.bundle.version(),
                "cluster state is identical to the active one; ignoring"
            );
            return false;
        }

        self.ensure_transition_timer_started();
        let bundle = cmd.bundle.clone();
        self.remove_superfluous_buckets(&bundle, false);
        self.reply_to_previous_pending_cluster_state_if_any();

        let info = self.cluster_information();
        let creation_timestamp = self.timestamps.next(self.clock.as_ref());
        let pending = PendingClusterState::create_for_cluster_state_change(
            TransitionContext {
                clock: self.clock.as_ref(),
                sender: self.sender.as_mut(),
                ids: &mut self.ids,
            },
            &self.repo,
            &info,
            cmd,
            &self.outdated_nodes,
            creation_timestamp,
        );
        self.outdated_nodes = pending.outdated_nodes_map();
        let done = pending.done();
        self.pending = Some(pending);
        if done {
            self.process_completed_pending_cluster_state();
        }
        true
    }

    /// Install new per-space distributions and start an unversioned
    /// transition querying every up node.
    pub fn storage_distribution_changed(
        &mut self,
        distributions: BTreeMap<BucketSpace, Arc<dyn Distribution>>,
    ) {
        for (space, distribution) in distributions {
            if let Some(bucket_space) = self.repo.get_mut(space) {
                bucket_space.set_distribution(distribution.clone());
            }
            if let Some(bucket_space) = self.read_only_repo.get_mut(space) {
                bucket_space.set_distribution(distribution);
            }
        }
        tracing::debug!("storage distribution changed; fetching bucket info from all nodes");

        self.ensure_transition_timer_started();
        let bundle = self.active_bundle.clone();
        self.remove_superfluous_buckets(&bundle, true);
        self.reply_to_previous_pending_cluster_state_if_any();

        let info = self.cluster_information();
        let creation_timestamp = self.timestamps.next(self.clock.as_ref());
        let pending = PendingClusterState::create_for_distribution_change(
            TransitionContext {
                clock: self.clock.as_ref(),
                sender: self.sender.as_mut(),
                ids: &mut self.ids,
            },
            &self.repo,
            &info,
            creation_timestamp,
        );
        self.outdated_nodes = pending.outdated_nodes_map();
        let done = pending.done();
        self.pending = Some(pending);
        if done {
            self.process_completed_pending_cluster_state();
        }
    }

    /// Explicit activation of a deferred transition. Returns false when the
    /// command should continue to the next handler.
    pub fn on_activate_cluster_state_version(
        &mut self,
        cmd: &ActivateClusterStateVersionCommand,
    ) -> bool {
        let pending_version = match self.pending.as_ref() {
            Some(pending) if pending.is_versioned_transition() => {
                Some((pending.cluster_state_version(), pending.done()))
            }
            _ => None,
        };
        match pending_version {
            Some((version, true)) if version == cmd.version => {
                tracing::debug!(version, "activating pending cluster state");
                self.activate_pending_cluster_state();
                false
            }
            Some((version, false)) if version == cmd.version => {
                tracing::error!(
                    version,
                    "received activation for pending cluster state that is not yet complete"
                );
                self.reply_to_activation(cmd, 0);
                true
            }
            Some((version, _)) => {
                tracing::debug!(
                    requested = cmd.version,
                    pending = version,
                    "activation version mismatch"
                );
                self.reply_to_activation(cmd, version);
                true
            }
            None => {
                if self.config.defer_state_activation {
                    tracing::warn!(
                        version = cmd.version,
                        "received cluster state activation without a pending transition"
                    );
                } else {
                    tracing::debug!(
                        version = cmd.version,
                        "received cluster state activation; deferred activation is disabled"
                    );
                }
                false
            }
        }
    }

    fn reply_to_activation(&mut self, cmd: &ActivateClusterStateVersionCommand, actual: u32) {
        self.sender
            .send_message(Outbound::ActivateClusterStateVersionReply(
                ActivateClusterStateVersionReply {
                    msg_id: cmd.msg_id,
                    version: cmd.version,
                    actual_version: actual,
                },
            ));
    }

    /// Always consumes the reply. Stale replies are discarded.
    pub fn on_request_bucket_info_reply(&mut self, reply: &RequestBucketInfoReply) -> bool {
        let now = self.clock.now_ms();
        if let Some(pending) = self.pending.as_mut() {
            if pending.on_request_bucket_info_reply(reply, now) {
                if pending.done() {
                    self.process_completed_pending_cluster_state();
                }
                return true;
            }
        }
        self.handle_single_bucket_info_reply(reply);
        true
    }

    /// Acknowledge a bucket change and recheck the bucket, after the pending
    /// transition if there is one.
    pub fn on_notify_bucket_change(&mut self, cmd: &NotifyBucketChangeCommand) -> bool {
        self.sender
            .send_message(Outbound::NotifyBucketChangeReply(NotifyBucketChangeReply {
                msg_id: cmd.msg_id,
            }));

        if !cmd.info.valid() {
            tracing::error!(
                bucket = %cmd.bucket,
                node = cmd.source_node,
                "notify-bucket-change carried invalid bucket info; ignoring"
            );
        } else if self.pending.is_some() {
            tracing::debug!(
                bucket = %cmd.bucket,
                node = cmd.source_node,
                "transition pending; enqueueing bucket recheck"
            );
            self.enqueued_rechecks.insert((cmd.source_node, cmd.bucket));
        } else {
            self.send_request_bucket_info(cmd.source_node, cmd.bucket, None);
        }
        true
    }

    /// Recheck every node of a finished merge. The merge reply is forwarded
    /// once all rechecks have resolved.
    pub fn on_merge_bucket_reply(&mut self, reply: MergeBucketReply) -> bool {
        let guard = self.next_guard_id;
        self.next_guard_id += 1;
        let bucket = reply.bucket;
        let nodes: Vec<NodeIndex> = reply.nodes.iter().map(|n| n.index).collect();
        // The creator hold keeps the token open while rechecks are issued.
        self.merge_guards.insert(
            guard,
            MergeReplyGuard {
                reply,
                outstanding: 1,
            },
        );
        for node in nodes {
            if self.send_request_bucket_info(node, bucket, Some(guard)) {
                if let Some(g) = self.merge_guards.get_mut(&guard) {
                    g.outstanding += 1;
                }
            }
        }
        self.release_merge_guard(Some(guard));
        true
    }

    /// Ask `node` for fresh info on `bucket`.
    pub fn recheck_bucket_info(&mut self, node: NodeIndex, bucket: Bucket) {
        self.send_request_bucket_info(node, bucket, None);
    }

    /// Resend delayed requests whose retry deadline has passed.
    pub fn resend_delayed_messages(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.resend_delayed_messages(TransitionContext {
                clock: self.clock.as_ref(),
                sender: self.sender.as_mut(),
                ids: &mut self.ids,
            });
        }

        let now = self.clock.now_ms();
        while self
            .delayed_requests
            .front()
            .is_some_and(|(deadline, _)| *deadline <= now)
        {
            let Some((_, req)) = self.delayed_requests.pop_front() else {
                break;
            };
            if !self.send_request_bucket_info(req.target_node, req.bucket, req.merge_guard) {
                self.release_merge_guard(req.merge_guard);
            }
        }
    }

    /// Abandon every single-bucket request and merge guard. Held merge
    /// replies are dropped, not forwarded.
    pub fn flush(&mut self) {
        tracing::debug!(
            sent = self.sent_messages.len(),
            delayed = self.delayed_requests.len(),
            merge_guards = self.merge_guards.len(),
            "flushing bucket db updater"
        );
        self.sent_messages.clear();
        self.delayed_requests.clear();
        self.enqueued_rechecks.clear();
        self.merge_guards.clear();
    }

    pub fn check_ownership_in_pending_state(&self, bucket: Bucket) -> BucketOwnership {
        let Some(pending) = self.pending.as_ref() else {
            return BucketOwnership::Owned;
        };
        let Some(bucket_space) = self.repo.get(bucket.space) else {
            return BucketOwnership::Owned;
        };
        let state = pending.new_bundle().derived_state(bucket.space);
        if self.owned_in_state(&state, bucket_space.distribution().as_ref(), bucket.id) {
            BucketOwnership::Owned
        } else {
            BucketOwnership::NotOwnedInPendingState(state)
        }
    }

    /// State of `space` under the pending transition, if one exists.
    pub fn pending_cluster_state(&self, space: BucketSpace) -> Option<Arc<ClusterState>> {
        self.pending
            .as_ref()
            .map(|pending| pending.new_bundle().derived_state(space))
    }

    fn ensure_transition_timer_started(&mut self) {
        if self.transition_started_at_ms.is_none() {
            self.transition_started_at_ms = Some(self.clock.now_ms());
        }
    }

    fn complete_transition_timer(&mut self) {
        if let Some(started) = self.transition_started_at_ms.take() {
            let elapsed = self.clock.now_ms().saturating_sub(started);
            tracing::debug!(elapsed_ms = elapsed, "cluster state transition complete");
            self.last_transition_ms = Some(elapsed);
        }
    }

    /// Sweep every space for entries invalidated by `bundle`.
    fn remove_superfluous_buckets(
        &mut self,
        bundle: &ClusterStateBundle,
        is_distribution_change: bool,
    ) {
        let move_to_read_only = self.config.defer_state_activation && !is_distribution_change;
        let up_states = self.config.storage_up_states;
        for (space, bucket_space) in self.repo.iter() {
            let old_state = bucket_space.cluster_state();
            let new_state = bundle.derived_state(*space);
            let may_elide = db_pruning_may_be_elided(old_state, &new_state, up_states);
            if !is_distribution_change && may_elide {
                tracing::info!(
                    space = %space,
                    change = %old_state.textual_difference(&new_state),
                    "new cluster state cannot change ownership or availability; \
                     skipping database pruning"
                );
                continue;
            }

            let mut remover = MergingNodeRemover::new(
                old_state,
                &new_state,
                self.config.distributor_index,
                bucket_space.distribution().as_ref(),
                up_states,
                move_to_read_only,
            );
            bucket_space
                .bucket_database()
                .merge(|entry| remover.process(entry));
            let outcome = remover.finish();
            self.removed_buckets += outcome.removed_buckets as u64;

            if let Some(read_only) = self.read_only_repo.get(*space) {
                for entry in outcome.non_owned {
                    read_only.bucket_database().update(entry);
                }
            }
        }
    }

    fn reply_to_previous_pending_cluster_state_if_any(&mut self) {
        let Some(mut previous) = self.pending.take() else {
            return;
        };
        tracing::debug!(
            version = previous.cluster_state_version(),
            "superseding pending cluster state"
        );
        if let Some(cmd) = previous.take_command() {
            self.sender
                .send_message(Outbound::SetSystemStateReply(SetSystemStateReply::for_command(
                    &cmd,
                )));
        }
    }

    fn process_completed_pending_cluster_state(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.is_deferred() {
            if let Some(cmd) = pending.take_command() {
                tracing::debug!(
                    version = cmd.bundle.version(),
                    "pending cluster state complete; awaiting explicit activation"
                );
                self.sender.send_message(Outbound::SetSystemStateForwarded(cmd));
            }
            return;
        }
        self.activate_pending_cluster_state();
    }

    fn activate_pending_cluster_state(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.merge_into_bucket_databases(&self.repo);

        if pending.is_versioned_transition() {
            tracing::debug!(
                version = pending.cluster_state_version(),
                "activating pending cluster state"
            );
            self.enable_cluster_state_bundle(pending.new_bundle().clone());
            if let Some(cmd) = pending.take_command() {
                self.sender.send_message(Outbound::SetSystemStateForwarded(cmd));
            }
            self.add_history_entry(pending.summary(self.clock.now_ms()));
        } else {
            tracing::debug!("activating distribution config change");
            self.sender.send_message(Outbound::DistributionChangeEnabled);
        }

        self.outdated_nodes.clear();
        self.send_all_queued_bucket_rechecks();
        self.complete_transition_timer();
        self.read_only_repo.clear_databases();
    }

    fn enable_cluster_state_bundle(&mut self, bundle: Arc<ClusterStateBundle>) {
        self.repo.enable_cluster_state_bundle(&bundle);
        self.read_only_repo.enable_cluster_state_bundle(&bundle);
        self.active_bundle = bundle.clone();
        self.sender.send_message(Outbound::ClusterStateEnabled(bundle));
    }

    fn add_history_entry(&mut self, summary: TransitionSummary) {
        self.history.push_back(summary);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    fn send_all_queued_bucket_rechecks(&mut self) {
        let rechecks = std::mem::take(&mut self.enqueued_rechecks);
        for (node, bucket) in rechecks {
            self.send_request_bucket_info(node, bucket, None);
        }
    }

    /// Returns false when the node is not up and nothing was sent. The caller
    /// owns the guard accounting.
    fn send_request_bucket_info(
        &mut self,
        node: NodeIndex,
        bucket: Bucket,
        merge_guard: Option<MergeGuardId>,
    ) -> bool {
        if !self.storage_node_is_up(bucket.space, node) {
            tracing::debug!(
                node,
                bucket = %bucket,
                "storage node not up; skipping bucket info request"
            );
            return false;
        }
        let msg_id = self.ids.next_id();
        let now = self.clock.now_ms();
        tracing::debug!(msg_id, node, bucket = %bucket, "requesting bucket info");
        self.sent_messages.insert(
            msg_id,
            BucketRequest {
                target_node: node,
                bucket,
                sent_at_ms: now,
                merge_guard,
            },
        );
        self.sender
            .send_message(Outbound::RequestBucketInfo(RequestBucketInfoCommand {
                msg_id,
                space: bucket.space,
                target_node: node,
                buckets: vec![bucket.id],
                distributor: self.config.distributor_index,
                cluster_state: None,
            }));
        true
    }

    fn release_merge_guard(&mut self, guard: Option<MergeGuardId>) {
        let Some(id) = guard else {
            return;
        };
        let Some(g) = self.merge_guards.get_mut(&id) else {
            return;
        };
        g.outstanding = g.outstanding.saturating_sub(1);
        if g.outstanding == 0 {
            if let Some(g) = self.merge_guards.remove(&id) {
                tracing::debug!(bucket = %g.reply.bucket, "all merge rechecks resolved");
                self.sender.send_message(Outbound::MergeCompleted(g.reply));
            }
        }
    }

    fn handle_single_bucket_info_reply(&mut self, reply: &RequestBucketInfoReply) {
        let Some(req) = self.sent_messages.remove(&reply.msg_id) else {
            tracing::debug!(msg_id = reply.msg_id, "discarding stale bucket info reply");
            return;
        };
        if !self.storage_node_is_up(req.bucket.space, req.target_node) {
            tracing::debug!(
                node = req.target_node,
                bucket = %req.bucket,
                "dropping bucket info reply from node that is no longer up"
            );
            self.release_merge_guard(req.merge_guard);
            return;
        }
        // Activation does not prune again, so a copy merged now would outlive
        // the pending state.
        if !self.storage_node_is_up_in_pending(req.bucket.space, req.target_node) {
            tracing::debug!(
                node = req.target_node,
                bucket = %req.bucket,
                "dropping bucket info reply from node that is down in the pending cluster state"
            );
            self.release_merge_guard(req.merge_guard);
            return;
        }
        if !reply.result.is_ok() {
            if req.bucket.id.is_all() {
                self.release_merge_guard(req.merge_guard);
                return;
            }
            let deadline = self.clock.now_ms().saturating_add(self.config.retry_delay_ms);
            tracing::debug!(
                node = req.target_node,
                bucket = %req.bucket,
                result = ?reply.result,
                resend_at_ms = deadline,
                "bucket info request failed; delaying resend"
            );
            self.delayed_requests.push_back((deadline, req));
            return;
        }
        self.merge_bucket_info_with_database(&req, reply);
        self.release_merge_guard(req.merge_guard);
    }

    /// Merge a single-bucket reply. Buckets not owned in the active or the
    /// pending state are never added.
    fn merge_bucket_info_with_database(&self, req: &BucketRequest, reply: &RequestBucketInfoReply) {
        let Some(bucket_space) = self.repo.get(req.bucket.space) else {
            return;
        };
        let db = bucket_space.bucket_database();
        let distribution = bucket_space.distribution().as_ref();
        let active_state = bucket_space.cluster_state();
        let pending_state = self.pending_cluster_state(req.bucket.space);

        let mut existing: Vec<BucketEntry> = db
            .get_all(req.bucket.id)
            .iter()
            .filter_map(|entry| {
                entry
                    .node(req.target_node)
                    .map(|copy| (entry.bucket(), copy.info))
            })
            .collect();
        sort_bucket_list(&mut existing);

        let mut reported: Vec<BucketEntry> = reply
            .buckets
            .iter()
            .filter(|(bucket, _)| {
                let owned = self.owned_in_state(active_state, distribution, *bucket)
                    && pending_state
                        .as_ref()
                        .map_or(true, |state| self.owned_in_state(state, distribution, *bucket));
                if !owned {
                    tracing::debug!(
                        %bucket,
                        "ignoring reported bucket not owned by this distributor"
                    );
                }
                owned
            })
            .copied()
            .collect();
        sort_bucket_list(&mut reported);

        let timestamp = self.clock.now_ms().saturating_mul(1000);
        let merger = BucketListMerger::new(&reported, &existing, timestamp);
        merger.apply_to(db, req.target_node, |bucket| {
            distribution.ideal_storage_nodes(active_state, bucket, self.config.storage_up_states)
        });
    }

    pub fn report_content_type(&self) -> &'static str {
        STATUS_CONTENT_TYPE
    }

    /// XML status page.
    pub fn report_status(&self) -> String {
        let now = self.clock.now_ms();
        let mut xml = XmlWriter::new();
        xml.tag("status")
            .attr("id", "bucketdb")
            .attr("name", "Bucket Database Updater");
        xml.tag("bucketdb");

        xml.tag("systemstate_active")
            .content(&self.active_bundle.baseline)
            .end();
        if let Some(pending) = &self.pending {
            pending.write_xml(&mut xml, now);
        }

        xml.tag("systemstate_history");
        for entry in self.history.iter().rev() {
            xml.tag("change")
                .attr("from", &entry.prev_cluster_state)
                .attr("to", &entry.new_cluster_state)
                .attr("processingtime", entry.processing_time_ms)
                .end();
        }
        xml.end();

        xml.tag("single_bucket_requests");
        for (msg_id, req) in &self.sent_messages {
            xml.tag("storagenode")
                .attr("index", req.target_node)
                .attr("msgid", msg_id)
                .attr("bucketspace", format!("{:#x}", req.bucket.space.0))
                .attr("bucket", bucket_label(req.bucket.id))
                .attr("sendtimestamp", req.sent_at_ms)
                .end();
        }
        xml.end();

        xml.tag("delayed_single_bucket_requests");
        for (deadline, req) in &self.delayed_requests {
            xml.tag("storagenode")
                .attr("index", req.target_node)
                .attr("bucketspace", format!("{:#x}", req.bucket.space.0))
                .attr("bucket", bucket_label(req.bucket.id))
                .attr("resendtimestamp", deadline)
                .end();
        }
        xml.end();

        xml.finish()
    }
}

fn bucket_label(id: BucketId) -> String {
    if id.is_all() {
        "all".to_string()
    } else {
        format!("0x{:016x}", id.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::bucket_space::DistributorBucketSpace;
    use crate::updater::clock::ManualClock;
    use crate::updater::cluster_state::UpStates;
    use crate::updater::distribution::DistributionError;
    use crate::updater::messages::{MergeNode, ResultCode};
    use crate::updater::types::{BucketCopy, BucketInfo};
    use tokio::sync::mpsc;

    /// Superbucket modulo distributor count picks the owner; every up
    /// storage node is ideal, in index order.
    struct ModuloDistribution;

    impl Distribution for ModuloDistribution {
        fn ideal_distributor(
            &self,
            state: &ClusterState,
            bucket: BucketId,
        ) -> Result<NodeIndex, DistributionError> {
            if u16::from(bucket.used_bits()) < state.distribution_bits {
                return Err(DistributionError::TooFewBucketBitsInUse {
                    bucket,
                    used_bits: bucket.used_bits(),
                    required: state.distribution_bits,
                });
            }
            if state.distributor_count == 0 {
                return Err(DistributionError::NoDistributorsAvailable {
                    version: state.version,
                });
            }
            let superbucket = bucket.superbucket(state.distribution_bits);
            Ok((superbucket % u64::from(state.distributor_count)) as NodeIndex)
        }

        fn ideal_storage_nodes(
            &self,
            state: &ClusterState,
            _bucket: BucketId,
            up_states: UpStates,
        ) -> Vec<NodeIndex> {
            state.up_storage_nodes(up_states).into_iter().collect()
        }
    }

    struct Fixture {
        updater: BucketDbUpdater,
        clock: ManualClock,
        rx: mpsc::UnboundedReceiver<Outbound>,
        /// What each storage node holds.
        storage: BTreeMap<NodeIndex, Vec<BucketEntry>>,
        next_cmd_id: MessageId,
    }

    fn b(id: u64) -> BucketId {
        BucketId::new(16, id)
    }

    fn bucket(id: u64) -> Bucket {
        Bucket::new(BucketSpace::DEFAULT, b(id))
    }

    fn info(checksum: u32) -> BucketInfo {
        BucketInfo::new(checksum, 1, 100, 1)
    }

    fn deferred_bundle(state: &str) -> ClusterStateBundle {
        ClusterStateBundle::new(state.parse().unwrap()).deferred(true)
    }

    impl Fixture {
        fn new(config: UpdaterConfig) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let clock = ManualClock::new(10_000);
            let mut repo = BucketSpaceRepo::default();
            repo.add(
                BucketSpace::DEFAULT,
                DistributorBucketSpace::new(Arc::new(ModuloDistribution)),
            );
            let updater =
                BucketDbUpdater::new(config, repo, Box::new(tx), Arc::new(clock.clone()))
                    .expect("valid config");
            Self {
                updater,
                clock,
                rx,
                storage: BTreeMap::new(),
                next_cmd_id: 1_000,
            }
        }

        fn db(&self) -> Arc<crate::updater::bucket_db::BucketDatabase> {
            self.updater
                .bucket_space_repo()
                .get(BucketSpace::DEFAULT)
                .expect("default space")
                .bucket_database()
                .clone()
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn requests(&mut self) -> Vec<RequestBucketInfoCommand> {
            self.drain()
                .into_iter()
                .filter_map(|msg| match msg {
                    Outbound::RequestBucketInfo(cmd) => Some(cmd),
                    _ => None,
                })
                .collect()
        }

        fn cmd_id(&mut self) -> MessageId {
            self.next_cmd_id += 1;
            self.next_cmd_id
        }

        fn set_state(&mut self, state: &str) -> SetSystemStateCommand {
            let bundle = ClusterStateBundle::new(state.parse().expect("state"));
            self.set_bundle(bundle)
        }

        fn set_bundle(&mut self, bundle: ClusterStateBundle) -> SetSystemStateCommand {
            let cmd = SetSystemStateCommand::new(self.cmd_id(), bundle);
            self.updater.on_set_system_state(cmd.clone());
            cmd
        }

        fn answer(&self, cmd: &RequestBucketInfoCommand) -> RequestBucketInfoReply {
            let held = self.storage.get(&cmd.target_node).cloned().unwrap_or_default();
            let buckets = if cmd.is_full_listing() {
                held
            } else {
                held.into_iter()
                    .filter(|(id, _)| cmd.buckets.contains(id))
                    .collect()
            };
            RequestBucketInfoReply::ok(cmd, buckets)
        }

        /// Answer every outstanding request until none remain; returns the
        /// non-request messages seen along the way.
        fn answer_all(&mut self) -> Vec<Outbound> {
            let mut other = Vec::new();
            loop {
                let mut answered = false;
                for msg in self.drain() {
                    match msg {
                        Outbound::RequestBucketInfo(cmd) => {
                            let reply = self.answer(&cmd);
                            self.updater.on_request_bucket_info_reply(&reply);
                            answered = true;
                        }
                        other_msg => other.push(other_msg),
                    }
                }
                if !answered {
                    return other;
                }
            }
        }
    }

    fn bootstrap(storage: &[(NodeIndex, &[u64])]) -> Fixture {
        let mut fx = Fixture::new(UpdaterConfig::default());
        for (node, ids) in storage {
            fx.storage
                .insert(*node, ids.iter().map(|id| (b(*id), info(*id as u32))).collect());
        }
        fx.set_state("version:1 distributor:1 storage:3");
        fx.answer_all();
        assert!(!fx.updater.has_pending_cluster_state());
        assert_eq!(fx.updater.active_bundle().version(), 1);
        fx
    }

    #[test]
    fn bootstrap_fetches_all_nodes() {
        let fx = bootstrap(&[(0, &[1, 2]), (1, &[2]), (2, &[3])]);
        let db = fx.db();
        assert_eq!(db.get(b(1)).unwrap().nodes(), vec![0]);
        assert_eq!(db.get(b(2)).unwrap().nodes(), vec![0, 1]);
        assert_eq!(db.get(b(3)).unwrap().nodes(), vec![2]);
        assert_eq!(fx.updater.history().count(), 1);
    }

    #[test]
    fn identical_state_is_not_consumed() {
        let mut fx = bootstrap(&[]);
        let cmd = SetSystemStateCommand::new(
            77,
            ClusterStateBundle::new("version:1 distributor:1 storage:3".parse().unwrap()),
        );
        assert!(!fx.updater.on_set_system_state(cmd));
        assert!(fx.drain().is_empty());
    }

    #[test]
    fn node_going_down_strips_only_its_replica() {
        let mut fx = bootstrap(&[(1, &[5]), (2, &[5])]);
        assert_eq!(fx.db().get(b(5)).unwrap().nodes(), vec![1, 2]);

        fx.set_state("version:2 distributor:1 storage:3 .2.s:d");
        // Nothing came up, so nothing is fetched and the state activates.
        assert!(fx.requests().is_empty());
        assert!(!fx.updater.has_pending_cluster_state());
        assert_eq!(fx.db().get(b(5)).unwrap().nodes(), vec![1]);
        assert_eq!(fx.updater.removed_buckets(), 0);
    }

    #[test]
    fn losing_every_replica_counts_removed_bucket() {
        let mut fx = bootstrap(&[(2, &[6])]);
        fx.set_state("version:2 distributor:1 storage:3 .2.s:d");
        assert!(fx.db().get(b(6)).is_none());
        assert_eq!(fx.updater.removed_buckets(), 1);
    }

    #[test]
    fn node_coming_up_is_fetched_and_merged() {
        let mut fx = Fixture::new(UpdaterConfig::default());
        fx.set_state("version:1 distributor:1 storage:3 .2.s:d");
        fx.answer_all();
        fx.storage.insert(2, vec![(b(9), info(9))]);

        fx.set_state("version:2 distributor:1 storage:3");
        let requests = fx.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target_node, 2);
        assert!(requests[0].is_full_listing());
        let reply = fx.answer(&requests[0]);
        assert!(fx.updater.on_request_bucket_info_reply(&reply));
        assert_eq!(fx.db().get(b(9)).unwrap().nodes(), vec![2]);
        assert_eq!(fx.updater.active_bundle().version(), 2);
    }

    #[test]
    fn superseded_transition_is_replied_and_its_replies_discarded() {
        let mut fx = Fixture::new(UpdaterConfig::default());
        fx.set_state("version:1 distributor:1 storage:4 .3.s:d");
        fx.answer_all();
        fx.storage.insert(3, vec![(b(0x10), info(1))]);

        let first = fx.set_state("version:2 distributor:1 storage:4");
        let first_requests = fx.requests();
        assert_eq!(first_requests.len(), 1);

        fx.set_state("version:3 distributor:1 storage:4 .0.s:d");
        let out = fx.drain();
        let replied: Vec<&SetSystemStateReply> = out
            .iter()
            .filter_map(|m| match m {
                Outbound::SetSystemStateReply(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(replied.len(), 1);
        assert_eq!(replied[0].msg_id, first.msg_id);
        assert_eq!(replied[0].version, 2);
        // Node 3 was owed a reply, so the superseding transition asks again.
        let second_requests: Vec<&RequestBucketInfoCommand> = out
            .iter()
            .filter_map(|m| match m {
                Outbound::RequestBucketInfo(cmd) => Some(cmd),
                _ => None,
            })
            .collect();
        assert_eq!(second_requests.len(), 1);
        assert_eq!(second_requests[0].target_node, 3);

        let stale = fx.answer(&first_requests[0]);
        assert!(fx.updater.on_request_bucket_info_reply(&stale));
        assert!(fx.db().get(b(0x10)).is_none());
        assert!(fx.updater.has_pending_cluster_state());

        let fresh = fx.answer(second_requests[0]);
        fx.updater.on_request_bucket_info_reply(&fresh);
        assert_eq!(fx.updater.active_bundle().version(), 3);
        assert_eq!(fx.db().get(b(0x10)).unwrap().nodes(), vec![3]);
    }

    #[test]
    fn failed_pending_request_is_resent_after_retry_delay() {
        let mut fx = Fixture::new(UpdaterConfig::default());
        fx.set_state("version:1 distributor:1 storage:1");
        let requests = fx.requests();
        let failed = RequestBucketInfoReply::failed(&requests[0], ResultCode::Busy);
        fx.updater.on_request_bucket_info_reply(&failed);

        fx.clock.advance_ms(99);
        fx.updater.resend_delayed_messages();
        assert!(fx.requests().is_empty());

        fx.clock.advance_ms(1);
        fx.updater.resend_delayed_messages();
        let resent = fx.requests();
        assert_eq!(resent.len(), 1);
        let reply = fx.answer(&resent[0]);
        fx.updater.on_request_bucket_info_reply(&reply);
        assert!(!fx.updater.has_pending_cluster_state());
    }

    #[test]
    fn delayed_single_bucket_requests_resend_in_deadline_order() {
        let mut fx = bootstrap(&[(0, &[1]), (1, &[2])]);
        fx.updater.recheck_bucket_info(0, bucket(1));
        let first = fx.requests();
        fx.clock.advance_ms(30);
        fx.updater.recheck_bucket_info(1, bucket(2));
        let second = fx.requests();

        for req in [&first[0], &second[0]] {
            let failed = RequestBucketInfoReply::failed(req, ResultCode::Timeout);
            fx.updater.on_request_bucket_info_reply(&failed);
        }
        assert_eq!(fx.updater.delayed_message_count(), 2);

        fx.clock.advance_ms(100);
        fx.updater.resend_delayed_messages();
        let resent = fx.requests();
        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0].target_node, 0);
        assert_eq!(resent[1].target_node, 1);
        assert_eq!(fx.updater.delayed_message_count(), 0);
    }

    #[test]
    fn early_resend_tick_leaves_queue_untouched() {
        let mut fx = bootstrap(&[(0, &[1])]);
        fx.updater.recheck_bucket_info(0, bucket(1));
        let sent = fx.requests();
        let failed = RequestBucketInfoReply::failed(&sent[0], ResultCode::Busy);
        fx.updater.on_request_bucket_info_reply(&failed);
        fx.clock.advance_ms(50);
        fx.updater.resend_delayed_messages();
        assert!(fx.requests().is_empty());
        assert_eq!(fx.updater.delayed_message_count(), 1);
    }

    #[test]
    fn activation_for_other_version_replies_with_pending_version() {
        let mut fx = bootstrap(&[]);
        let bundle = deferred_bundle("version:8 distributor:1 storage:4");
        fx.set_bundle(bundle);
        fx.drain();

        let handled = fx
            .updater
            .on_activate_cluster_state_version(&ActivateClusterStateVersionCommand {
                msg_id: 5,
                version: 7,
            });
        assert!(handled);
        let out = fx.drain();
        match out.as_slice() {
            [Outbound::ActivateClusterStateVersionReply(reply)] => {
                assert_eq!(reply.version, 7);
                assert_eq!(reply.actual_version, 8);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(fx.updater.active_bundle().version(), 1);
    }

    #[test]
    fn activation_before_completion_replies_with_zero() {
        let mut fx = bootstrap(&[]);
        let bundle = deferred_bundle("version:2 distributor:1 storage:4");
        fx.set_bundle(bundle);
        assert_eq!(fx.requests().len(), 1);

        assert!(fx
            .updater
            .on_activate_cluster_state_version(&ActivateClusterStateVersionCommand {
                msg_id: 5,
                version: 2,
            }));
        match fx.drain().as_slice() {
            [Outbound::ActivateClusterStateVersionReply(reply)] => {
                assert_eq!(reply.actual_version, 0)
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn deferred_transition_forwards_on_completion_and_waits_for_activation() {
        let mut fx = bootstrap(&[]);
        fx.storage.insert(3, vec![(b(4), info(4))]);
        let bundle = deferred_bundle("version:2 distributor:1 storage:4");
        let cmd = fx.set_bundle(bundle);
        let other = fx.answer_all();
        assert!(matches!(
            other.as_slice(),
            [Outbound::SetSystemStateForwarded(fwd)] if fwd.msg_id == cmd.msg_id
        ));
        assert!(fx.updater.has_pending_cluster_state());
        assert_eq!(fx.updater.active_bundle().version(), 1);
        assert!(fx.db().get(b(4)).is_none());

        let handled = fx
            .updater
            .on_activate_cluster_state_version(&ActivateClusterStateVersionCommand {
                msg_id: 9,
                version: 2,
            });
        assert!(!handled);
        assert!(!fx.updater.has_pending_cluster_state());
        assert_eq!(fx.updater.active_bundle().version(), 2);
        assert_eq!(fx.db().get(b(4)).unwrap().nodes(), vec![3]);
        let out = fx.drain();
        assert!(out
            .iter()
            .any(|m| matches!(m, Outbound::ClusterStateEnabled(e) if e.version() == 2)));
        assert!(!out
            .iter()
            .any(|m| matches!(m, Outbound::SetSystemStateForwarded(_))));
    }

    #[test]
    fn unexpected_activation_is_passed_on() {
        let mut fx = bootstrap(&[]);
        assert!(!fx
            .updater
            .on_activate_cluster_state_version(&ActivateClusterStateVersionCommand {
                msg_id: 1,
                version: 3,
            }));
        assert!(fx.drain().is_empty());
    }

    #[test]
    fn non_owned_entries_move_to_read_only_db_until_activation() {
        let config = UpdaterConfig {
            defer_state_activation: true,
            ..UpdaterConfig::default()
        };
        let mut fx = Fixture::new(config);
        fx.storage
            .insert(0, vec![(b(2), info(2)), (b(3), info(3))]);
        fx.set_state("version:1 distributor:1 storage:1");
        fx.answer_all();
        assert_eq!(fx.db().len(), 2);

        // Odd superbuckets now belong to distributor 1.
        let bundle = deferred_bundle("version:2 distributor:2 storage:1");
        fx.set_bundle(bundle);
        assert!(fx.db().get(b(3)).is_none());
        assert!(fx.db().get(b(2)).is_some());
        let read_only = fx
            .updater
            .read_only_bucket_space_repo()
            .get(BucketSpace::DEFAULT)
            .unwrap()
            .bucket_database()
            .clone();
        assert_eq!(read_only.get(b(3)).unwrap().nodes(), vec![0]);

        fx.answer_all();
        fx.updater
            .on_activate_cluster_state_version(&ActivateClusterStateVersionCommand {
                msg_id: 2,
                version: 2,
            });
        assert!(read_only.is_empty());
        assert!(fx.db().get(b(3)).is_none());
        assert_eq!(fx.db().get(b(2)).unwrap().nodes(), vec![0]);
    }

    #[test]
    fn history_is_capped_and_reported_newest_first() {
        let config = UpdaterConfig {
            history_capacity: 3,
            ..UpdaterConfig::default()
        };
        let mut fx = Fixture::new(config);
        for version in 1..=5 {
            fx.set_state(&format!("version:{version} distributor:1 storage:2"));
            fx.answer_all();
        }
        let versions: Vec<String> = fx
            .updater
            .history()
            .map(|h| h.new_cluster_state.clone())
            .collect();
        assert_eq!(
            versions,
            vec![
                "version:3 distributor:1 storage:2",
                "version:4 distributor:1 storage:2",
                "version:5 distributor:1 storage:2",
            ]
        );
        let status = fx.updater.report_status();
        let newest = status.find("to=\"version:5").unwrap();
        let oldest = status.find("to=\"version:3").unwrap();
        assert!(newest < oldest, "{status}");
    }

    #[test]
    fn notify_is_acked_and_rechecked_after_pending_completes() {
        let mut fx = bootstrap(&[(0, &[1])]);
        fx.set_state("version:2 distributor:1 storage:4");
        let pending_requests = fx.requests();
        assert_eq!(pending_requests.len(), 1);

        let notify = NotifyBucketChangeCommand {
            msg_id: 55,
            source_node: 0,
            bucket: bucket(1),
            info: info(11),
        };
        assert!(fx.updater.on_notify_bucket_change(&notify));
        match fx.drain().as_slice() {
            [Outbound::NotifyBucketChangeReply(reply)] => assert_eq!(reply.msg_id, 55),
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(fx.updater.enqueued_recheck_count(), 1);

        let reply = fx.answer(&pending_requests[0]);
        fx.updater.on_request_bucket_info_reply(&reply);
        let rechecks = fx.requests();
        assert_eq!(rechecks.len(), 1);
        assert_eq!(rechecks[0].buckets, vec![b(1)]);
        assert_eq!(fx.updater.enqueued_recheck_count(), 0);
    }

    #[test]
    fn invalid_notify_is_acked_but_ignored() {
        let mut fx = bootstrap(&[]);
        let notify = NotifyBucketChangeCommand {
            msg_id: 56,
            source_node: 0,
            bucket: bucket(1),
            info: BucketInfo::default(),
        };
        assert!(fx.updater.on_notify_bucket_change(&notify));
        let out = fx.drain();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Outbound::NotifyBucketChangeReply(_)));
        assert_eq!(fx.updater.sent_message_count(), 0);
    }

    #[test]
    fn single_bucket_reply_updates_replica_info() {
        let mut fx = bootstrap(&[(0, &[1]), (1, &[1])]);
        fx.storage.insert(1, vec![(b(1), info(99))]);
        fx.updater.recheck_bucket_info(1, bucket(1));
        fx.answer_all();
        let entry = fx.db().get(b(1)).unwrap();
        assert_eq!(entry.node(1).unwrap().info.checksum, 99);
        assert_eq!(entry.node(0).unwrap().info.checksum, 1);

        // An empty answer removes the node's copy.
        fx.storage.insert(1, Vec::new());
        fx.updater.recheck_bucket_info(1, bucket(1));
        fx.answer_all();
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);
    }

    #[test]
    fn single_bucket_reply_does_not_add_unowned_buckets() {
        let mut fx = Fixture::new(UpdaterConfig::default());
        fx.set_state("version:1 distributor:2 storage:1");
        fx.answer_all();
        fx.storage.insert(0, vec![(b(3), info(3))]);
        fx.updater.recheck_bucket_info(0, bucket(3));
        fx.answer_all();
        assert!(fx.db().get(b(3)).is_none());
    }

    #[test]
    fn merge_reply_is_forwarded_once_all_rechecks_resolve() {
        let mut fx = bootstrap(&[(0, &[7]), (1, &[7])]);
        let merge = MergeBucketReply {
            msg_id: 300,
            bucket: bucket(7),
            nodes: vec![
                MergeNode {
                    index: 0,
                    source_only: false,
                },
                MergeNode {
                    index: 1,
                    source_only: false,
                },
            ],
            result: ResultCode::Ok,
        };
        assert!(fx.updater.on_merge_bucket_reply(merge));
        let rechecks = fx.requests();
        assert_eq!(rechecks.len(), 2);
        assert_eq!(fx.updater.open_merge_guards(), 1);

        let first = fx.answer(&rechecks[0]);
        fx.updater.on_request_bucket_info_reply(&first);
        assert!(fx.drain().is_empty());

        // A failed recheck keeps holding the token across its retry.
        let failed = RequestBucketInfoReply::failed(&rechecks[1], ResultCode::Busy);
        fx.updater.on_request_bucket_info_reply(&failed);
        assert!(fx.drain().is_empty());
        fx.clock.advance_ms(100);
        fx.updater.resend_delayed_messages();
        let out = fx.answer_all();
        match out.as_slice() {
            [Outbound::MergeCompleted(reply)] => assert_eq!(reply.msg_id, 300),
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(fx.updater.open_merge_guards(), 0);
    }

    #[test]
    fn merge_reply_with_no_up_nodes_is_forwarded_immediately() {
        let mut fx = bootstrap(&[]);
        let merge = MergeBucketReply {
            msg_id: 301,
            bucket: bucket(7),
            nodes: vec![MergeNode {
                index: 9,
                source_only: true,
            }],
            result: ResultCode::Ok,
        };
        fx.updater.on_merge_bucket_reply(merge);
        match fx.drain().as_slice() {
            [Outbound::MergeCompleted(reply)] => assert_eq!(reply.msg_id, 301),
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn flush_drops_merge_guards_without_forwarding() {
        let mut fx = bootstrap(&[(0, &[7])]);
        fx.updater.on_merge_bucket_reply(MergeBucketReply {
            msg_id: 302,
            bucket: bucket(7),
            nodes: vec![MergeNode {
                index: 0,
                source_only: false,
            }],
            result: ResultCode::Ok,
        });
        let rechecks = fx.requests();
        fx.updater.flush();
        assert_eq!(fx.updater.open_merge_guards(), 0);
        assert_eq!(fx.updater.sent_message_count(), 0);

        let late = fx.answer(&rechecks[0]);
        fx.updater.on_request_bucket_info_reply(&late);
        assert!(fx.drain().is_empty());
    }

    #[test]
    fn distribution_change_queries_every_node_and_activates_unversioned() {
        let mut fx = bootstrap(&[(0, &[1]), (1, &[1]), (2, &[2])]);
        fx.updater.storage_distribution_changed(BTreeMap::from([(
            BucketSpace::DEFAULT,
            Arc::new(ModuloDistribution) as Arc<dyn Distribution>,
        )]));
        let requests = fx.requests();
        let mut targets: Vec<NodeIndex> = requests.iter().map(|r| r.target_node).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![0, 1, 2]);
        assert_eq!(
            fx.updater.pending().map(|p| p.is_versioned_transition()),
            Some(false)
        );

        let mut other = Vec::new();
        for req in &requests {
            let reply = fx.answer(req);
            fx.updater.on_request_bucket_info_reply(&reply);
            other.extend(fx.drain());
        }
        assert!(other
            .iter()
            .any(|m| matches!(m, Outbound::DistributionChangeEnabled)));
        assert_eq!(fx.updater.active_bundle().version(), 1);
        assert_eq!(fx.updater.history().count(), 1);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0, 1]);
    }

    #[test]
    fn ownership_in_pending_state() {
        let mut fx = bootstrap(&[]);
        assert_eq!(
            fx.updater.check_ownership_in_pending_state(bucket(3)),
            BucketOwnership::Owned
        );
        fx.set_state("version:2 distributor:2 storage:4");
        match fx.updater.check_ownership_in_pending_state(bucket(3)) {
            BucketOwnership::NotOwnedInPendingState(state) => assert_eq!(state.version, 2),
            other => panic!("unexpected ownership: {other:?}"),
        }
        assert_eq!(
            fx.updater.check_ownership_in_pending_state(bucket(2)),
            BucketOwnership::Owned
        );
        assert_eq!(
            fx.updater
                .pending_cluster_state(BucketSpace::DEFAULT)
                .map(|s| s.distributor_count),
            Some(2)
        );
    }

    #[test]
    fn transition_timer_spans_superseding_transitions() {
        let mut fx = bootstrap(&[]);
        fx.set_state("version:2 distributor:1 storage:4");
        fx.clock.advance_ms(40);
        fx.set_state("version:3 distributor:1 storage:5");
        fx.clock.advance_ms(60);
        fx.answer_all();
        assert_eq!(fx.updater.active_bundle().version(), 3);
        assert_eq!(fx.updater.last_transition_ms(), Some(100));
    }

    #[test]
    fn status_report_lists_requests() {
        let mut fx = bootstrap(&[(0, &[1])]);
        fx.updater.recheck_bucket_info(0, bucket(1));
        let sent = fx.requests();
        fx.updater.recheck_bucket_info(0, Bucket::new(BucketSpace::DEFAULT, BucketId::all()));
        let all = fx.requests();
        let failed = RequestBucketInfoReply::failed(&sent[0], ResultCode::Busy);
        fx.updater.on_request_bucket_info_reply(&failed);

        let status = fx.updater.report_status();
        assert!(status
            .starts_with("<status id=\"bucketdb\" name=\"Bucket Database Updater\"><bucketdb>"));
        assert!(status.contains(
            "<systemstate_active>version:1 distributor:1 storage:3</systemstate_active>"
        ));
        assert!(status.contains("bucket=\"all\""), "{status}");
        assert!(status.contains("bucketspace=\"0x1\""), "{status}");
        assert!(status.contains("resendtimestamp=\"10100\""), "{status}");
        assert!(status.contains(&format!("msgid=\"{}\"", all[0].msg_id)));
        assert_eq!(fx.updater.report_content_type(), "text/xml");
    }

    #[test]
    fn status_shows_only_the_active_baseline_state() {
        let mut fx = bootstrap(&[(0, &[1])]);
        let derived: ClusterState = "version:2 distributor:1 storage:3 .1.s:m".parse().unwrap();
        let bundle = deferred_bundle("version:2 distributor:1 storage:3")
            .with_derived(BucketSpace::GLOBAL, derived);
        fx.set_bundle(bundle);
        fx.answer_all();
        let activate = ActivateClusterStateVersionCommand {
            msg_id: 77,
            version: 2,
        };
        assert!(!fx.updater.on_activate_cluster_state_version(&activate));

        let status = fx.updater.report_status();
        assert!(
            status.contains(
                "<systemstate_active>version:2 distributor:1 storage:3</systemstate_active>"
            ),
            "{status}"
        );
    }

    #[test]
    fn failed_full_bucket_recheck_is_not_delayed() {
        let mut fx = bootstrap(&[]);
        fx.updater
            .recheck_bucket_info(0, Bucket::new(BucketSpace::DEFAULT, BucketId::all()));
        let sent = fx.requests();
        let failed = RequestBucketInfoReply::failed(&sent[0], ResultCode::Busy);
        fx.updater.on_request_bucket_info_reply(&failed);
        assert_eq!(fx.updater.delayed_message_count(), 0);
    }

    #[test]
    fn reply_from_node_that_went_down_is_dropped() {
        let mut fx = bootstrap(&[(2, &[1]), (0, &[1])]);
        fx.storage.insert(2, vec![(b(1), info(42))]);
        fx.updater.recheck_bucket_info(2, bucket(1));
        let sent = fx.requests();
        fx.set_state("version:2 distributor:1 storage:3 .2.s:d");
        fx.drain();
        let reply = fx.answer(&sent[0]);
        fx.updater.on_request_bucket_info_reply(&reply);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);
    }

    #[test]
    fn recheck_reply_from_node_down_in_pending_state_is_not_merged() {
        let mut fx = bootstrap(&[(0, &[1]), (2, &[1])]);
        fx.updater.recheck_bucket_info(2, bucket(1));
        let recheck = fx.requests();
        assert_eq!(recheck.len(), 1);

        // Node 3 joining keeps the transition open while node 2 goes down.
        fx.set_state("version:2 distributor:1 storage:4 .2.s:d");
        let listings = fx.requests();
        let targets: Vec<NodeIndex> = listings.iter().map(|r| r.target_node).collect();
        assert_eq!(targets, vec![3]);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);

        let late = fx.answer(&recheck[0]);
        fx.updater.on_request_bucket_info_reply(&late);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);
        assert_eq!(fx.updater.sent_message_count(), 0);

        for req in &listings {
            let reply = fx.answer(req);
            fx.updater.on_request_bucket_info_reply(&reply);
        }
        assert!(!fx.updater.has_pending_cluster_state());
        assert_eq!(fx.updater.active_bundle().version(), 2);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);
    }

    #[test]
    fn merge_recheck_from_node_down_in_pending_state_releases_guard() {
        let mut fx = bootstrap(&[(0, &[1]), (2, &[1])]);
        let merge = MergeBucketReply {
            msg_id: 301,
            bucket: bucket(1),
            nodes: vec![
                MergeNode {
                    index: 0,
                    source_only: false,
                },
                MergeNode {
                    index: 2,
                    source_only: false,
                },
            ],
            result: ResultCode::Ok,
        };
        fx.updater.on_merge_bucket_reply(merge);
        let rechecks = fx.requests();
        assert_eq!(rechecks.len(), 2);

        fx.set_state("version:2 distributor:1 storage:4 .2.s:d");
        let listings = fx.requests();
        for req in &rechecks {
            let reply = fx.answer(req);
            fx.updater.on_request_bucket_info_reply(&reply);
        }
        let out = fx.drain();
        assert!(out
            .iter()
            .any(|m| matches!(m, Outbound::MergeCompleted(r) if r.msg_id == 301)));
        assert_eq!(fx.updater.open_merge_guards(), 0);

        for req in &listings {
            let reply = fx.answer(req);
            fx.updater.on_request_bucket_info_reply(&reply);
        }
        assert_eq!(fx.updater.active_bundle().version(), 2);
        assert_eq!(fx.db().get(b(1)).unwrap().nodes(), vec![0]);
    }

    #[test]
    fn rejects_invalid_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = UpdaterConfig {
            tick_interval_ms: 0,
            ..UpdaterConfig::default()
        };
        let result = BucketDbUpdater::new(
            config,
            BucketSpaceRepo::default(),
            Box::new(tx),
            Arc::new(ManualClock::new(0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn copies_keep_ideal_order() {
        let fx = bootstrap(&[(2, &[8]), (0, &[8]), (1, &[8])]);
        let entry = fx.db().get(b(8)).unwrap();
        assert_eq!(entry.nodes(), vec![0, 1, 2]);
        let copy: &BucketCopy = entry.node(2).unwrap();
        assert!(copy.timestamp > 0);
    }
}
