//! Bucket-to-node distribution.
//!
//! The distribution function is owned by the surrounding system; this module
//! only fixes its contract plus a deterministic rendezvous-hash implementation
//! used by tests and the workload simulator.

use super::cluster_state::{ClusterState, NodeType, UpStates};
use super::types::{BucketId, NodeIndex};

/// Distributor states that may own buckets (up, initializing, maintenance).
pub const DISTRIBUTOR_UP_STATES: UpStates = UpStates::distributor_default();

/// Expected failures when computing the ideal distributor for a bucket.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DistributionError {
    #[error("{bucket} uses {used_bits} bits, but the cluster state requires {required}")]
    TooFewBucketBitsInUse {
        bucket: BucketId,
        used_bits: u8,
        required: u16,
    },
    #[error("no distributors available in cluster state version {version}")]
    NoDistributorsAvailable { version: u32 },
}

/// Pure mapping from (bucket, cluster state) to owning distributor and ideal
/// storage nodes.
pub trait Distribution: Send + Sync + 'static {
    fn ideal_distributor(
        &self,
        state: &ClusterState,
        bucket: BucketId,
    ) -> Result<NodeIndex, DistributionError>;

    /// Storage nodes in preference order, restricted to nodes in `up_states`.
    fn ideal_storage_nodes(
        &self,
        state: &ClusterState,
        bucket: BucketId,
        up_states: UpStates,
    ) -> Vec<NodeIndex>;
}

/// Highest-random-weight distribution keyed by superbucket.
#[derive(Clone, Debug)]
pub struct RendezvousDistribution {
    redundancy: usize,
    seed: u64,
}

impl RendezvousDistribution {
    pub fn new(redundancy: usize) -> Self {
        Self {
            redundancy: redundancy.max(1),
            seed: 0,
        }
    }

    /// Different seeds model a changed distribution config.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    /// First 8 bytes of blake3 over `seed | type tag | superbucket | node`,
    /// all little-endian, so placement is stable across builds.
    fn score(&self, node_type: NodeType, superbucket: u64, node: NodeIndex) -> u64 {
        let tag: u8 = match node_type {
            NodeType::Distributor => 0,
            NodeType::Storage => 1,
        };
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(&[tag]);
        hasher.update(&superbucket.to_le_bytes());
        hasher.update(&node.to_le_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

impl Distribution for RendezvousDistribution {
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
        let superbucket = bucket.superbucket(state.distribution_bits);
        (0..state.distributor_count)
            .filter(|idx| state.node_is_up(NodeType::Distributor, *idx, DISTRIBUTOR_UP_STATES))
            .max_by_key(|idx| (self.score(NodeType::Distributor, superbucket, *idx), *idx))
            .ok_or(DistributionError::NoDistributorsAvailable {
                version: state.version,
            })
    }

    fn ideal_storage_nodes(
        &self,
        state: &ClusterState,
        bucket: BucketId,
        up_states: UpStates,
    ) -> Vec<NodeIndex> {
        let superbucket = bucket.superbucket(state.distribution_bits);
        let mut scored: Vec<(u64, NodeIndex)> = state
            .up_storage_nodes(up_states)
            .into_iter()
            .map(|idx| (self.score(NodeType::Storage, superbucket, idx), idx))
            .collect();
        scored.sort_unstable_by(|a, b| b.cmp(a));
        scored
            .into_iter()
            .take(self.redundancy)
            .map(|(_, idx)| idx)
            .collect()
    }
}
