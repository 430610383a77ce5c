//! Assured replication: per-update acknowledgment contracts.
//!
//! A publisher may require that an update be acknowledged before its caller
//! resumes: either by at least N relays of the local group (safe-data) or by
//! at least one other replica that actually replayed it (safe-read). The
//! coordinator suspends only the publishing caller; the link's writer task
//! keeps draining other updates while a caller waits. The contract governs
//! how long the caller waits, never whether the update is eventually
//! delivered by the normal stream.

use crate::stamp::ChangeStamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Acknowledgment contract attached to an outgoing update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AssuredMode {
    /// Fire and forget.
    None,
    /// Wait until the update reached at least `level` relays of the local
    /// group.
    SafeData(u8),
    /// Wait until at least one other replica replayed the update.
    SafeRead,
}

impl AssuredMode {
    /// True for the two blocking modes.
    pub fn is_assured(&self) -> bool {
        !matches!(self, AssuredMode::None)
    }
}

/// Content of an acknowledgment as received from the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AckInfo {
    /// The ack signals a timeout somewhere along the path.
    pub timed_out: bool,
    /// A receiver was in a status that cannot guarantee durability.
    pub wrong_status: bool,
    /// A receiver failed to replay the update.
    pub replay_error: bool,
    /// Servers that failed to acknowledge.
    pub failed_servers: Vec<u16>,
    /// Servers that confirmed receipt; a safe-data contract of level N is
    /// only met once this aggregate reaches N.
    pub acked_servers: Vec<u16>,
}

impl AckInfo {
    /// True when the ack carries no failure of any kind.
    pub fn is_positive(&self) -> bool {
        !self.timed_out && !self.wrong_status && !self.replay_error && self.failed_servers.is_empty()
    }
}

/// Terminal outcome of one assured update, as seen by the publishing caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Positive acknowledgment received within the timeout.
    Acked,
    /// A negative acknowledgment was received; details inside.
    NotAcked(AckInfo),
    /// No acknowledgment arrived before the timeout expired.
    TimedOut,
    /// The link was lost while waiting.
    LinkLost,
    /// Published without waiting (mode none, or no eligible relay).
    SentOnly,
}

impl AckOutcome {
    /// True only for [`AckOutcome::Acked`].
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AckOutcome::Acked)
    }
}

/// Cumulative counters for one assured mode family. Never reset except on
/// restart; each pending update bumps exactly one terminal counter.
#[derive(Debug, Default)]
pub struct ModeCounters {
    sent: AtomicU64,
    acknowledged: AtomicU64,
    not_acknowledged: AtomicU64,
    timed_out: AtomicU64,
    wrong_status: AtomicU64,
    replay_error: AtomicU64,
    link_lost: AtomicU64,
}

/// Read-only snapshot of a [`ModeCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ModeCountersSnapshot {
    /// Updates published under this mode.
    pub sent: u64,
    /// Updates positively acknowledged.
    pub acknowledged: u64,
    /// Updates that terminated without a positive acknowledgment.
    pub not_acknowledged: u64,
    /// Of the not-acknowledged, those that hit a timeout.
    pub timed_out: u64,
    /// Of the not-acknowledged, those reporting a wrong-status receiver.
    pub wrong_status: u64,
    /// Of the not-acknowledged, those reporting a replay failure.
    pub replay_error: u64,
    /// Of the not-acknowledged, those whose link was lost mid-wait.
    pub link_lost: u64,
}

impl ModeCounters {
    fn snapshot(&self) -> ModeCountersSnapshot {
        ModeCountersSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            not_acknowledged: self.not_acknowledged.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            wrong_status: self.wrong_status.load(Ordering::Relaxed),
            replay_error: self.replay_error.load(Ordering::Relaxed),
            link_lost: self.link_lost.load(Ordering::Relaxed),
        }
    }
}

/// Receiver-side counters for safe-read updates replayed on this replica.
#[derive(Debug, Default)]
pub struct ReceiverCounters {
    received: AtomicU64,
    acked_positive: AtomicU64,
    acked_negative: AtomicU64,
}

/// Read-only snapshot of [`ReceiverCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReceiverCountersSnapshot {
    /// Safe-read updates received from the mesh.
    pub received: u64,
    /// Of those, acked positively after replay.
    pub acked_positive: u64,
    /// Of those, acked with an error or wrong-status flag.
    pub acked_negative: u64,
}

enum AckSignal {
    Ack(AckInfo),
    LinkLost,
}

/// Tracks pending assured updates and settles their callers.
///
/// One coordinator per replication domain. The reader task routes incoming
/// acks in via [`AssuredCoordinator::complete`]; link teardown cancels every
/// pending wait via [`AssuredCoordinator::cancel_all`].
#[derive(Default)]
pub struct AssuredCoordinator {
    pending: Mutex<HashMap<ChangeStamp, oneshot::Sender<AckSignal>>>,
    safe_data: ModeCounters,
    safe_read: ModeCounters,
    receiver: ReceiverCounters,
    server_errors: Mutex<HashMap<u16, u64>>,
}

/// Handle for one in-flight assured update, created before the update is
/// written to the link so the ack can never race the registration.
pub struct PendingAck {
    stamp: ChangeStamp,
    rx: oneshot::Receiver<AckSignal>,
}

impl AssuredCoordinator {
    /// Create a coordinator with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters_for(&self, mode: AssuredMode) -> &ModeCounters {
        match mode {
            AssuredMode::SafeRead => &self.safe_read,
            // Mode none is never tracked; attribute it to safe-data so the
            // arithmetic stays total.
            AssuredMode::SafeData(_) | AssuredMode::None => &self.safe_data,
        }
    }

    /// Count an update as published under `mode`.
    pub fn record_sent(&self, mode: AssuredMode) {
        if mode.is_assured() {
            self.counters_for(mode).sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Register a pending wait for `stamp`. Must be called before the update
    /// is handed to the writer task.
    pub fn track(&self, stamp: ChangeStamp) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(stamp, tx);
        PendingAck { stamp, rx }
    }

    /// Route an incoming acknowledgment to its waiting caller. Returns false
    /// if nothing was waiting for `stamp` (already timed out, or never
    /// assured).
    pub fn complete(&self, stamp: ChangeStamp, ack: AckInfo) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&stamp);
        match tx {
            Some(tx) => tx.send(AckSignal::Ack(ack)).is_ok(),
            None => false,
        }
    }

    /// Cancel every pending wait because the link went down. Each waiter
    /// resolves as [`AckOutcome::LinkLost`].
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.drain().collect()
        };
        for (stamp, tx) in drained {
            if tx.send(AckSignal::LinkLost).is_err() {
                tracing::debug!(stamp = %stamp, "waiter gone before link-lost cancellation");
            }
        }
    }

    /// Number of updates currently awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Suspend the caller until the update acknowledges, times out, or the
    /// link drops. Counts exactly one terminal outcome. A safe-data ack is
    /// only accepted once its aggregate covers the configured level; a
    /// positive ack from too few servers resolves as not-acknowledged.
    pub async fn wait(&self, pending: PendingAck, mode: AssuredMode, timeout: Duration) -> AckOutcome {
        let counters = self.counters_for(mode);
        let PendingAck { stamp, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(AckSignal::Ack(ack))) => {
                let satisfied = ack.is_positive()
                    && match mode {
                        AssuredMode::SafeData(level) => ack.acked_servers.len() >= level as usize,
                        _ => true,
                    };
                if satisfied {
                    counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                    AckOutcome::Acked
                } else {
                    if ack.is_positive() {
                        tracing::warn!(stamp = %stamp, acked = ack.acked_servers.len(),
                            "safe-data aggregate below the configured level");
                    }
                    counters.not_acknowledged.fetch_add(1, Ordering::Relaxed);
                    if ack.timed_out {
                        counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    if ack.wrong_status {
                        counters.wrong_status.fetch_add(1, Ordering::Relaxed);
                    }
                    if ack.replay_error {
                        counters.replay_error.fetch_add(1, Ordering::Relaxed);
                    }
                    self.note_server_errors(&ack.failed_servers);
                    AckOutcome::NotAcked(ack)
                }
            }
            Ok(Ok(AckSignal::LinkLost)) | Ok(Err(_)) => {
                counters.not_acknowledged.fetch_add(1, Ordering::Relaxed);
                counters.link_lost.fetch_add(1, Ordering::Relaxed);
                AckOutcome::LinkLost
            }
            Err(_elapsed) => {
                // Deregister so a late ack is dropped instead of leaking.
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&stamp);
                counters.not_acknowledged.fetch_add(1, Ordering::Relaxed);
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(stamp = %stamp, timeout_ms = timeout.as_millis() as u64,
                    "assured update not acknowledged before timeout");
                AckOutcome::TimedOut
            }
        }
    }

    fn note_server_errors(&self, failed: &[u16]) {
        if failed.is_empty() {
            return;
        }
        let mut map = self.server_errors.lock().unwrap_or_else(|p| p.into_inner());
        for &server in failed {
            *map.entry(server).or_insert(0) += 1;
        }
    }

    /// Count a safe-read update received from the mesh and the polarity of
    /// the ack we answered with.
    pub fn record_received(&self, acked_positive: bool) {
        self.receiver.received.fetch_add(1, Ordering::Relaxed);
        if acked_positive {
            self.receiver.acked_positive.fetch_add(1, Ordering::Relaxed);
        } else {
            self.receiver.acked_negative.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of the safe-data counters.
    pub fn safe_data_counters(&self) -> ModeCountersSnapshot {
        self.safe_data.snapshot()
    }

    /// Snapshot of the safe-read counters.
    pub fn safe_read_counters(&self) -> ModeCountersSnapshot {
        self.safe_read.snapshot()
    }

    /// Snapshot of the receiver-side counters.
    pub fn receiver_counters(&self) -> ReceiverCountersSnapshot {
        ReceiverCountersSnapshot {
            received: self.receiver.received.load(Ordering::Relaxed),
            acked_positive: self.receiver.acked_positive.load(Ordering::Relaxed),
            acked_negative: self.receiver.acked_negative.load(Ordering::Relaxed),
        }
    }

    /// Per-server count of failed acknowledgments.
    pub fn server_error_counts(&self) -> HashMap<u16, u64> {
        self.server_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
