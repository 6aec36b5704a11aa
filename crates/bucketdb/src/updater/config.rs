//! Updater configuration and tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cluster_state::UpStates;
use super::types::NodeIndex;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Configuration consumed by `BucketDbUpdater`.
///
/// Everything here is sourced from the owning distributor's config; defaults
/// match production behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Index of this distributor in the cluster state.
    pub distributor_index: NodeIndex,
    /// Storage node states counted as available.
    pub storage_up_states: UpStates,
    /// Keep serving reads from a read-only copy of buckets that are moving
    /// away while a transition is pending.
    pub defer_state_activation: bool,
    /// Fixed backoff before a failed bucket-info request is resent.
    pub retry_delay_ms: u64,
    /// Number of completed transitions kept for the status page.
    pub history_capacity: usize,
    /// How often the service loop resends delayed requests.
    pub tick_interval_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            distributor_index: 0,
            storage_up_states: UpStates::storage_default(),
            defer_state_activation: false,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl UpdaterConfig {
    pub fn for_distributor(distributor_index: NodeIndex) -> Self {
        Self {
            distributor_index,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.storage_up_states.is_empty(),
            "storage_up_states must name at least one state"
        );
        anyhow::ensure!(self.history_capacity > 0, "history_capacity must be > 0");
        anyhow::ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be > 0");
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
