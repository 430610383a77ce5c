//! Logical timestamps and the per-replica clock that issues them.
//!
//! Every change in the mesh carries a `ChangeStamp`. Stamps are totally
//! ordered and each replica's clock is advanced past every stamp it observes,
//! so a stamp issued after an observation is guaranteed to sort later.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Identifier of a replica (a full directory copy) in the mesh.
pub type ReplicaId = u16;

/// Identifier of a relay (replication server) in the mesh.
pub type RelayId = u16;

/// A totally-ordered logical timestamp.
///
/// Ordering is by wall-clock milliseconds, then per-millisecond sequence,
/// then replica id. The replica id tie-break is purely for determinism and
/// carries no semantic meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeStamp {
    /// Wall-clock milliseconds since the Unix epoch at issue time.
    pub wall_ms: u64,
    /// Sequence number disambiguating stamps issued in the same millisecond.
    pub seq: u32,
    /// The replica that issued this stamp.
    pub replica_id: ReplicaId,
}

impl ChangeStamp {
    /// Create a stamp from its parts.
    pub fn new(wall_ms: u64, seq: u32, replica_id: ReplicaId) -> Self {
        Self {
            wall_ms,
            seq,
            replica_id,
        }
    }

    /// True if this stamp sorts strictly after `other`.
    pub fn is_newer_than(&self, other: ChangeStamp) -> bool {
        *self > other
    }

    /// True if this stamp sorts strictly before `other`.
    pub fn is_older_than(&self, other: ChangeStamp) -> bool {
        *self < other
    }
}

impl std::fmt::Display for ChangeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:013}/{:06}/{}", self.wall_ms, self.seq, self.replica_id)
    }
}

/// Internal clock position: the (wall_ms, seq) pair of the last stamp issued
/// or observed.
#[derive(Debug, Clone, Copy)]
struct ClockPos {
    wall_ms: u64,
    seq: u32,
}

/// Per-replica monotonic stamp generator.
///
/// `next()` returns a stamp strictly greater than every stamp previously
/// issued by this clock *and* every stamp passed to `observe()`. When the
/// wall clock lags behind the logical position (skew, or a burst of stamps in
/// one millisecond) the sequence number is bumped instead.
#[derive(Debug)]
pub struct LogicalClock {
    replica_id: ReplicaId,
    pos: Mutex<ClockPos>,
}

impl LogicalClock {
    /// Create a clock for the given replica, starting at the current wall time.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            pos: Mutex::new(ClockPos { wall_ms: 0, seq: 0 }),
        }
    }

    /// The replica this clock issues stamps for.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Issue the next stamp. Strictly greater than anything issued or
    /// observed before.
    pub fn next(&self) -> ChangeStamp {
        let now = Self::now_ms();
        let mut pos = self.pos.lock().unwrap_or_else(|p| p.into_inner());
        if now > pos.wall_ms {
            pos.wall_ms = now;
            pos.seq = 0;
        } else {
            // Wall clock is behind the logical position: stay on the logical
            // millisecond and bump the sequence.
            match pos.seq.checked_add(1) {
                Some(s) => pos.seq = s,
                None => {
                    pos.wall_ms += 1;
                    pos.seq = 0;
                }
            }
        }
        ChangeStamp::new(pos.wall_ms, pos.seq, self.replica_id)
    }

    /// Advance the clock past an externally observed stamp without issuing.
    ///
    /// After `observe(t)`, the next `next()` call returns a stamp greater
    /// than `t` regardless of local wall-clock skew.
    pub fn observe(&self, stamp: ChangeStamp) {
        let mut pos = self.pos.lock().unwrap_or_else(|p| p.into_inner());
        if stamp.wall_ms > pos.wall_ms || (stamp.wall_ms == pos.wall_ms && stamp.seq > pos.seq) {
            pos.wall_ms = stamp.wall_ms;
            pos.seq = stamp.seq;
        }
    }
}
