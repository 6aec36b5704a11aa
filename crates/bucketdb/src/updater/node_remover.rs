//! Database pruning on cluster-state and distribution changes.
//!
//! `MergingNodeRemover` is the merge processor run over a bucket database
//! before a new pending transition is created. It drops entries this
//! distributor no longer owns and strips replicas on nodes that are no
//! longer available.

use std::collections::HashMap;

use super::bucket_db::{Entry, MergeResult};
use super::cluster_state::{ClusterState, NodeType, UpStates};
use super::distribution::Distribution;
use super::types::{BucketCopy, BucketId, NodeIndex};

/// What a finished sweep produced.
#[derive(Debug, Default)]
pub struct PruneOutcome {
    /// Entries that lost every replica.
    pub removed_buckets: usize,
    /// Entries no longer owned, when tracking was requested.
    pub non_owned: Vec<Entry>,
}

pub struct MergingNodeRemover<'a> {
    old_state: &'a ClusterState,
    state: &'a ClusterState,
    local_index: NodeIndex,
    distribution: &'a dyn Distribution,
    up_states: UpStates,
    track_non_owned_entries: bool,
    available_nodes: Vec<bool>,
    /// Ownership decision per superbucket for the current sweep.
    owned_superbuckets: HashMap<u64, bool>,
    outcome: PruneOutcome,
}

impl<'a> MergingNodeRemover<'a> {
    pub fn new(
        old_state: &'a ClusterState,
        state: &'a ClusterState,
        local_index: NodeIndex,
        distribution: &'a dyn Distribution,
        up_states: UpStates,
        track_non_owned_entries: bool,
    ) -> Self {
        let available_nodes = (0..state.storage_count)
            .map(|idx| state.node_is_up(NodeType::Storage, idx, up_states))
            .collect();
        Self {
            old_state,
            state,
            local_index,
            distribution,
            up_states,
            track_non_owned_entries,
            available_nodes,
            owned_superbuckets: HashMap::new(),
            outcome: PruneOutcome::default(),
        }
    }

    fn storage_node_is_available(&self, node: NodeIndex) -> bool {
        self.available_nodes
            .get(usize::from(node))
            .copied()
            .unwrap_or(false)
    }

    fn distributor_owns_bucket(&mut self, bucket: BucketId) -> bool {
        // Too-few-bits never depends on the superbucket, so check it before
        // consulting the cache.
        if u16::from(bucket.used_bits()) < self.state.distribution_bits {
            tracing::trace!(%bucket, "removing bucket: using too few distribution bits now");
            return false;
        }
        let superbucket = bucket.superbucket(self.state.distribution_bits);
        if let Some(owned) = self.owned_superbuckets.get(&superbucket) {
            if !*owned {
                tracing::trace!(
                    %bucket,
                    "removing bucket: now owned by another distributor (cached)"
                );
            }
            return *owned;
        }

        let owned = match self.distribution.ideal_distributor(self.state, bucket) {
            Ok(distributor) => distributor == self.local_index,
            Err(err) => {
                tracing::trace!(%bucket, error = %err, "removing bucket: no owner in new state");
                false
            }
        };
        self.owned_superbuckets.insert(superbucket, owned);
        if !owned {
            tracing::trace!(%bucket, "removing bucket: now owned by another distributor");
        }
        owned
    }

    fn has_unavailable_nodes(&self, entry: &Entry) -> bool {
        entry
            .copies()
            .iter()
            .any(|copy| !self.storage_node_is_available(copy.node))
    }

    /// Decide the fate of one database entry.
    pub fn process(&mut self, entry: &mut Entry) -> MergeResult {
        let bucket = entry.bucket();
        if !self.distributor_owns_bucket(bucket) {
            if self.track_non_owned_entries {
                self.outcome.non_owned.push(entry.clone());
            }
            return MergeResult::Skip;
        }
        if entry.is_empty() {
            return MergeResult::Skip;
        }
        if !self.has_unavailable_nodes(entry) {
            return MergeResult::KeepUnchanged;
        }

        let remaining: Vec<BucketCopy> = entry
            .copies()
            .iter()
            .filter(|copy| self.storage_node_is_available(copy.node))
            .copied()
            .collect();
        if remaining.is_empty() {
            self.outcome.removed_buckets += 1;
            return MergeResult::Skip;
        }

        let order = self
            .distribution
            .ideal_storage_nodes(self.state, bucket, self.up_states);
        entry.clear();
        entry.add_nodes(&remaining, &order);
        tracing::trace!(%entry, "changed replica set");
        MergeResult::Update
    }

    /// Finish the sweep, logging when buckets became unavailable.
    pub fn finish(self) -> PruneOutcome {
        if self.outcome.removed_buckets != 0 {
            tracing::info!(
                removed_buckets = self.outcome.removed_buckets,
                change = %self.old_state.textual_difference(self.state),
                "buckets no longer have available replicas; \
                 their documents are unavailable until nodes come back up"
            );
        }
        self.outcome
    }
}
