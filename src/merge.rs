//! Dedup policy for two observations of the same platform.

use crate::model::Observation;

/// Keeps the newer of two observations for the same `platform_code`.
///
/// The incoming record wins when it is newer or equally old. Records are
/// complete snapshots, so fields are never combined across them.
pub fn merge_observation(existing: Observation, incoming: Observation) -> Observation {
    if incoming.time >= existing.time {
        incoming
    } else {
        existing
    }
}
