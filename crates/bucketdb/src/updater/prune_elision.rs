//! Fast path deciding whether a state transition can skip the pruning sweep.

use super::cluster_state::{ClusterState, NodeType, UpStates};
use super::distribution::DISTRIBUTOR_UP_STATES;

/// True when no bucket can change owner or lose an available replica between
/// `old` and `new`: same distribution bits, same node counts, and every node
/// keeps its availability.
pub fn db_pruning_may_be_elided(
    old: &ClusterState,
    new: &ClusterState,
    up_states: UpStates,
) -> bool {
    if old.distribution_bits != new.distribution_bits {
        return false;
    }
    for (node_type, states) in [
        (NodeType::Distributor, DISTRIBUTOR_UP_STATES),
        (NodeType::Storage, up_states),
    ] {
        let count = old.node_count(node_type);
        if count != new.node_count(node_type) {
            return false;
        }
        let same_availability = (0..count).all(|idx| {
            old.node_is_up(node_type, idx, states) == new.node_is_up(node_type, idx, states)
        });
        if !same_availability {
            return false;
        }
    }
    true
}
