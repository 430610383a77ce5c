//! Connection status tracking for a replica's link to its relay.
//!
//! The status is a small state machine driven by connection events and the
//! backlog monitor. It gates what the replica is allowed to do: a degraded
//! replica no longer contributes to safe-read acknowledgements, and a replica
//! with a stale generation id accepts no updates at all until a full update
//! resets it.

use serde::{Deserialize, Serialize};

/// Where a replica stands relative to its relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No link to any relay.
    NotConnected,
    /// Connected and keeping up with the update stream.
    Normal,
    /// Connected but the replay backlog exceeds the configured threshold.
    Degraded,
    /// Receiving a full copy of the data set from another replica.
    FullUpdate,
    /// The replica's generation id does not match the topology's; all
    /// incoming updates are refused until a full update rebuilds the data.
    BadGeneration,
}

impl ConnectionStatus {
    /// Whether this replica may acknowledge safe-read updates.
    pub fn can_ack_safe_read(&self) -> bool {
        matches!(self, ConnectionStatus::Normal)
    }

    /// Whether incoming updates are applied at all.
    pub fn accepts_updates(&self) -> bool {
        matches!(self, ConnectionStatus::Normal | ConnectionStatus::Degraded)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::NotConnected => "not-connected",
            ConnectionStatus::Normal => "normal",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::FullUpdate => "full-update",
            ConnectionStatus::BadGeneration => "bad-generation",
        };
        f.write_str(s)
    }
}

/// Events that drive status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// Handshake completed with a matching generation id.
    ConnectedOk,
    /// Handshake completed with a matching generation id, but the backlog
    /// already exceeded the threshold at connect time.
    ConnectedDegraded,
    /// Handshake completed but the generation ids differ.
    ConnectedBadGeneration,
    /// The link to the relay dropped.
    LinkLost,
    /// The backlog monitor crossed the degraded threshold upward.
    BacklogExceeded,
    /// The backlog monitor fell back under the threshold.
    BacklogCleared,
    /// A full update session started with this replica as the target.
    FullUpdateStarted,
    /// The full update session finished (the link always drops right after).
    FullUpdateEnded,
    /// A generation-id reset arrived with a value differing from the local
    /// one.
    GenerationReset,
}

/// The status machine itself. Transitions not listed in the table are
/// ignored with a warning; they indicate a stale or reordered event, not a
/// corrupted replica.
#[derive(Debug)]
pub struct StatusMachine {
    status: ConnectionStatus,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    /// Start out disconnected.
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::NotConnected,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Apply an event, returning the new status. Invalid events for the
    /// current status leave it unchanged.
    pub fn apply(&mut self, event: StatusEvent) -> ConnectionStatus {
        use ConnectionStatus::*;
        use StatusEvent::*;

        let next = match (self.status, event) {
            (NotConnected, ConnectedOk) => Some(Normal),
            (NotConnected, ConnectedDegraded) => Some(Degraded),
            (NotConnected, ConnectedBadGeneration) => Some(BadGeneration),

            (Normal, BacklogExceeded) => Some(Degraded),
            (Normal, FullUpdateStarted) => Some(FullUpdate),
            (Normal, LinkLost) => Some(NotConnected),

            (Degraded, BacklogCleared) => Some(Normal),
            (Degraded, FullUpdateStarted) => Some(FullUpdate),
            (Degraded, LinkLost) => Some(NotConnected),

            // A full update always ends by dropping the link, so both the
            // explicit end and a raw link loss land in NotConnected.
            (FullUpdate, FullUpdateEnded) => Some(NotConnected),
            (FullUpdate, LinkLost) => Some(NotConnected),

            // A mismatching reset poisons every connected state; only a full
            // update can recover from it.
            (Normal | Degraded | FullUpdate | BadGeneration, GenerationReset) => {
                Some(BadGeneration)
            }

            (BadGeneration, FullUpdateStarted) => Some(FullUpdate),
            (BadGeneration, LinkLost) => Some(NotConnected),

            _ => None,
        };

        match next {
            Some(next) => {
                if next != self.status {
                    tracing::info!(from = %self.status, to = %next, ?event, "status change");
                }
                self.status = next;
            }
            None => {
                tracing::warn!(status = %self.status, ?event, "ignoring event with no transition");
            }
        }
        self.status
    }
}
