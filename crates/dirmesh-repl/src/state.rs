//! Per-replica high-water marks: which changes from each origin replica have
//! been seen locally.
//!
//! A `ReplicaState` is attached to handshakes and topology refreshes, drives
//! the relay selector's freshness ranking, and is hashed into a scalar
//! fingerprint for fast generation-id style comparisons.

use crate::stamp::{ChangeStamp, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Map of origin replica to the greatest stamp seen from that replica.
///
/// Monotonic per key: `update` only takes effect when the new stamp is
/// strictly greater than the recorded one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    marks: HashMap<ReplicaId, ChangeStamp>,
}

impl ReplicaState {
    /// Create an empty state vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stamp. Returns true if the high-water mark for the stamp's
    /// origin replica advanced.
    pub fn update(&mut self, stamp: ChangeStamp) -> bool {
        match self.marks.get(&stamp.replica_id) {
            Some(&current) if stamp <= current => false,
            _ => {
                self.marks.insert(stamp.replica_id, stamp);
                true
            }
        }
    }

    /// Pointwise maximum with another state vector.
    pub fn merge(&mut self, other: &ReplicaState) {
        for &stamp in other.marks.values() {
            self.update(stamp);
        }
    }

    /// The greatest stamp seen from `replica`, if any.
    pub fn mark(&self, replica: ReplicaId) -> Option<ChangeStamp> {
        self.marks.get(&replica).copied()
    }

    /// True iff every mark in `self` is covered by `other` (other's mark for
    /// the same replica is at least as new). An empty state is covered by
    /// everything. Used to answer "does that server already hold all our
    /// changes".
    pub fn covered_by(&self, other: &ReplicaState) -> bool {
        self.marks.iter().all(|(replica, &stamp)| {
            other
                .marks
                .get(replica)
                .is_some_and(|&theirs| theirs >= stamp)
        })
    }

    /// True if no change has ever been recorded.
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Number of origin replicas tracked.
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Order-independent scalar fingerprint of the whole vector.
    ///
    /// Per-entry hashes are combined with XOR, so two logically equal vectors
    /// produce equal fingerprints no matter how their maps iterate. Not a
    /// cryptographic digest; equality evidence only.
    pub fn fingerprint(&self) -> u64 {
        self.marks
            .iter()
            .map(|(&replica, &stamp)| {
                let mut h = mix(replica as u64 ^ 0x9e37_79b9_7f4a_7c15);
                h = mix(h ^ stamp.wall_ms);
                h = mix(h ^ stamp.seq as u64);
                mix(h ^ stamp.replica_id as u64)
            })
            .fold(0u64, |acc, h| acc ^ h)
    }

    /// Iterate over `(replica, stamp)` marks in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, ChangeStamp)> + '_ {
        self.marks.iter().map(|(&r, &s)| (r, s))
    }
}

/// 64-bit finalizer (splitmix64 style) so near-identical inputs spread.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
