//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The relay link is down or the channel to it is closed.
    #[error("link error: {msg}")]
    Link {
        /// Error message describing the issue.
        msg: String,
    },

    /// Handshake rejected: the peer speaks an incompatible protocol version.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected protocol version.
        expected: u8,
        /// Actual protocol version.
        got: u8,
    },

    /// Handshake failed for a reason other than versioning.
    #[error("handshake failed with relay {relay_id}: {msg}")]
    Handshake {
        /// The relay that rejected the handshake.
        relay_id: u16,
        /// Error message describing the rejection.
        msg: String,
    },

    /// No relay candidate is available for connection.
    #[error("no relay available")]
    NoRelayAvailable,

    /// A persisted attribute history blob could not be decoded.
    ///
    /// Callers are expected to rebuild an empty history and continue; this
    /// error never aborts entry processing.
    #[error("malformed attribute history: {msg}")]
    MalformedHistory {
        /// Error message describing the corruption.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),
}
