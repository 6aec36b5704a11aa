//! Per-bucket-space database, distribution and active cluster state.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::bucket_db::BucketDatabase;
use super::cluster_state::{ClusterState, ClusterStateBundle};
use super::distribution::Distribution;
use super::types::BucketSpace;

#[derive(Clone)]
pub struct DistributorBucketSpace {
    db: Arc<BucketDatabase>,
    distribution: Arc<dyn Distribution>,
    cluster_state: Arc<ClusterState>,
}

impl DistributorBucketSpace {
    pub fn new(distribution: Arc<dyn Distribution>) -> Self {
        Self {
            db: Arc::new(BucketDatabase::new()),
            distribution,
            cluster_state: Arc::new(ClusterState::default()),
        }
    }

    pub fn bucket_database(&self) -> &Arc<BucketDatabase> {
        &self.db
    }

    pub fn distribution(&self) -> &Arc<dyn Distribution> {
        &self.distribution
    }

    pub fn cluster_state(&self) -> &Arc<ClusterState> {
        &self.cluster_state
    }

    pub fn set_distribution(&mut self, distribution: Arc<dyn Distribution>) {
        self.distribution = distribution;
    }

    pub fn set_cluster_state(&mut self, state: Arc<ClusterState>) {
        self.cluster_state = state;
    }
}

impl std::fmt::Debug for DistributorBucketSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributorBucketSpace")
            .field("entries", &self.db.len())
            .field("cluster_state", &self.cluster_state.to_string())
            .finish()
    }
}

/// Bucket spaces known to a distributor.
#[derive(Clone, Debug, Default)]
pub struct BucketSpaceRepo {
    spaces: BTreeMap<BucketSpace, DistributorBucketSpace>,
}

impl BucketSpaceRepo {
    /// Repo with the `default` and `global` spaces sharing one distribution.
    pub fn with_default_spaces(distribution: Arc<dyn Distribution>) -> Self {
        let mut repo = Self::default();
        repo.add(BucketSpace::DEFAULT, DistributorBucketSpace::new(distribution.clone()));
        repo.add(BucketSpace::GLOBAL, DistributorBucketSpace::new(distribution));
        repo
    }

    pub fn add(&mut self, space: BucketSpace, bucket_space: DistributorBucketSpace) {
        self.spaces.insert(space, bucket_space);
    }

    pub fn get(&self, space: BucketSpace) -> Option<&DistributorBucketSpace> {
        self.spaces.get(&space)
    }

    pub fn get_mut(&mut self, space: BucketSpace) -> Option<&mut DistributorBucketSpace> {
        self.spaces.get_mut(&space)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BucketSpace, &DistributorBucketSpace)> {
        self.spaces.iter()
    }

    pub fn spaces(&self) -> impl Iterator<Item = BucketSpace> + '_ {
        self.spaces.keys().copied()
    }

    /// Install the derived state of every space from `bundle`.
    pub fn enable_cluster_state_bundle(&mut self, bundle: &ClusterStateBundle) {
        for (space, bucket_space) in self.spaces.iter_mut() {
            bucket_space.set_cluster_state(bundle.derived_state(*space));
        }
    }

    /// Same spaces and distributions, backed by fresh empty databases.
    pub fn read_only_mirror(&self) -> Self {
        let spaces = self
            .spaces
            .iter()
            .map(|(space, bs)| {
                (
                    *space,
                    DistributorBucketSpace::new(bs.distribution.clone()),
                )
            })
            .collect();
        Self { spaces }
    }

    pub fn clear_databases(&self) {
        for bucket_space in self.spaces.values() {
            bucket_space.db.clear();
        }
    }
}
