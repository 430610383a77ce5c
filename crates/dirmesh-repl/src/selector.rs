//! Relay selection: which replication server a replica should connect to.
//!
//! Two independent algorithms. The first-connection path ranks candidates by
//! group affinity and data freshness. The rebalancing path runs periodically
//! on an established link and decides whether the replica should migrate to
//! even out relay load, with explicit protection against reconnect
//! oscillation: a migration that would merely mirror the imbalance is never
//! taken, and when a relay sheds replicas only the lowest replica ids move so
//! every member of the mesh reaches the same conclusion independently.

use crate::stamp::{RelayId, ReplicaId};
use crate::state::ReplicaState;
use crate::topology::RelayInfo;

/// Tuning knobs for the rebalancing decision.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Load-deficit band within which the current link is always kept, as a
    /// fraction of total load. Zero keeps only exact balance; the structural
    /// mirror-imbalance check applies regardless.
    pub rebalance_tolerance: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            rebalance_tolerance: 0.0,
        }
    }
}

/// Outcome of a rebalancing evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceDecision {
    /// Stay on the current relay.
    KeepCurrent,
    /// Disconnect and reconnect to the given relay.
    MigrateTo(RelayId),
}

/// Choose a relay for the first connection.
///
/// No candidate is discarded outright. Ranking: same group as the local
/// replica beats any foreign group; among those, the relay holding the most
/// locally-originated changes wins, meaning least catch-up (a relay even
/// further ahead than us wins outright, since we lost our own state); load
/// deficit and weight settle what freshness cannot; the final tie-break is
/// the lowest relay id. Generation-id mismatches are tolerated here; the
/// connection status machine deals with them after the handshake.
pub fn choose_initial(
    local_state: &ReplicaState,
    candidates: &[RelayInfo],
    local_replica: ReplicaId,
    local_group: u8,
) -> Option<RelayId> {
    if candidates.is_empty() {
        return None;
    }
    let pool = prefer_group(candidates, local_group);

    // Freshness: keep only the relays holding the newest change that this
    // replica originated.
    let best_mark = pool
        .iter()
        .map(|r| r.state.mark(local_replica))
        .max()
        .flatten();
    if best_mark < local_state.mark(local_replica) {
        tracing::warn!(
            replica = local_replica,
            "no relay holds all locally-originated changes; connecting to the freshest anyway"
        );
    }
    let freshest: Vec<&RelayInfo> = pool
        .iter()
        .filter(|r| r.state.mark(local_replica) == best_mark)
        .copied()
        .collect();

    Some(pick_by_load(&freshest))
}

/// Decide whether an already-connected replica should migrate to a different
/// relay to even out load.
pub fn choose_rebalance(
    config: &SelectorConfig,
    candidates: &[RelayInfo],
    current: RelayId,
    local_replica: ReplicaId,
    local_group: u8,
) -> RebalanceDecision {
    if candidates.is_empty() {
        return RebalanceDecision::KeepCurrent;
    }
    let pool = prefer_group(candidates, local_group);

    let Some(current_info) = pool.iter().find(|r| r.relay_id == current) else {
        // The current relay is outside the preferred pool (wrong group, or no
        // longer advertised): group affinity wins over any load concern.
        let target = pick_by_load(&pool);
        if target == current {
            return RebalanceDecision::KeepCurrent;
        }
        tracing::info!(from = current, to = target, "migrating for group affinity");
        return RebalanceDecision::MigrateTo(target);
    };

    if pool.len() == 1 {
        return RebalanceDecision::KeepCurrent;
    }

    let deficits = load_deficits(&pool);
    let total_connected: usize = pool.iter().map(|r| r.connected_count()).sum();
    let current_deficit = deficit_of(&deficits, current);

    // The relay is at or under its load goal: nothing to shed.
    if current_deficit >= 0.0 {
        return RebalanceDecision::KeepCurrent;
    }

    // Overloaded. Does some other relay actually lack replicas?
    let others_deficit_sum: f64 = deficits
        .iter()
        .filter(|(id, _)| *id != current)
        .map(|(_, d)| d)
        .sum();
    if others_deficit_sum <= 0.0 {
        return RebalanceDecision::KeepCurrent;
    }

    let movers = (others_deficit_sum * total_connected as f64).round() as i64;
    if movers <= 0 {
        return RebalanceDecision::KeepCurrent;
    }

    // Tolerance band: a marginal improvement is never worth a reconnect.
    let best_other = deficits
        .iter()
        .filter(|(id, _)| *id != current)
        .map(|(_, d)| *d)
        .fold(f64::NEG_INFINITY, f64::max);
    if best_other - current_deficit <= config.rebalance_tolerance {
        return RebalanceDecision::KeepCurrent;
    }

    if movers == 1 && would_mirror_imbalance(&pool, current_info, others_deficit_sum, total_connected)
    {
        // Moving one replica would merely flip the imbalance and the next
        // evaluation would move it straight back.
        return RebalanceDecision::KeepCurrent;
    }

    // Only the lowest replica ids connected to the overloaded relay migrate,
    // up to the number needed. Deterministic everywhere in the mesh.
    let mut connected = current_info.connected_replicas.clone();
    connected.sort_unstable();
    let evicted = connected
        .iter()
        .take(movers as usize)
        .any(|&r| r == local_replica);
    if !evicted {
        return RebalanceDecision::KeepCurrent;
    }

    let target = pool
        .iter()
        .filter(|r| r.relay_id != current)
        .max_by(|a, b| {
            deficit_of(&deficits, a.relay_id)
                .total_cmp(&deficit_of(&deficits, b.relay_id))
                .then(b.relay_id.cmp(&a.relay_id)) // prefer the lower id on ties
        })
        .map(|r| r.relay_id);
    match target {
        Some(target) => {
            tracing::info!(from = current, to = target, replica = local_replica,
                "migrating to rebalance relay load");
            RebalanceDecision::MigrateTo(target)
        }
        None => RebalanceDecision::KeepCurrent,
    }
}

/// Same-group candidates win wholesale; only when no candidate shares the
/// local group does selection run across all of them.
fn prefer_group(candidates: &[RelayInfo], local_group: u8) -> Vec<&RelayInfo> {
    let same_group: Vec<&RelayInfo> = candidates
        .iter()
        .filter(|r| r.group_id == local_group)
        .collect();
    if same_group.is_empty() {
        candidates.iter().collect()
    } else {
        same_group
    }
}

/// `(relay, target load share - current load share)` for every candidate.
fn load_deficits(pool: &[&RelayInfo]) -> Vec<(RelayId, f64)> {
    let total_weight: u64 = pool.iter().map(|r| r.weight as u64).sum();
    let total_connected: usize = pool.iter().map(|r| r.connected_count()).sum();
    pool.iter()
        .map(|r| {
            let goal = if total_weight == 0 {
                1.0 / pool.len() as f64
            } else {
                r.weight as f64 / total_weight as f64
            };
            let share = if total_connected == 0 {
                0.0
            } else {
                r.connected_count() as f64 / total_connected as f64
            };
            (r.relay_id, goal - share)
        })
        .collect()
}

fn deficit_of(deficits: &[(RelayId, f64)], relay: RelayId) -> f64 {
    deficits
        .iter()
        .find(|(id, _)| *id == relay)
        .map(|(_, d)| *d)
        .unwrap_or(0.0)
}

/// Would shedding one replica leave the mesh in the mirror image of the
/// current imbalance? If so the exact balance is unreachable with this
/// replica count and migrating would oscillate forever.
fn would_mirror_imbalance(
    pool: &[&RelayInfo],
    current: &RelayInfo,
    others_deficit_sum: f64,
    total_connected: usize,
) -> bool {
    if total_connected == 0 {
        return false;
    }
    let total_weight: u64 = pool.iter().map(|r| r.weight as u64).sum();
    let goal = if total_weight == 0 {
        1.0 / pool.len() as f64
    } else {
        current.weight as f64 / total_weight as f64
    };
    let new_current_deficit =
        round6(goal - (current.connected_count() as f64 - 1.0) / total_connected as f64);
    let new_others_sum = round6(others_deficit_sum - 1.0 / total_connected as f64);
    new_current_deficit != 0.0 && new_current_deficit == -new_others_sum
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Largest load deficit wins; when every deficit is zero the highest weight
/// wins; the lowest relay id settles remaining ties.
fn pick_by_load(pool: &[&RelayInfo]) -> RelayId {
    let deficits = load_deficits(pool);
    let all_balanced = deficits.iter().all(|(_, d)| round6(*d) == 0.0);
    let best = if all_balanced {
        pool.iter()
            .min_by(|a, b| b.weight.cmp(&a.weight).then(a.relay_id.cmp(&b.relay_id)))
    } else {
        pool.iter().min_by(|a, b| {
            deficit_of(&deficits, b.relay_id)
                .total_cmp(&deficit_of(&deficits, a.relay_id))
                .then(a.relay_id.cmp(&b.relay_id))
        })
    };
    best.map(|r| r.relay_id).unwrap_or(0)
}
