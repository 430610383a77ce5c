//! Wire protocol between replicas and relays.
//!
//! Every frame is one version byte followed by a bincode-encoded
//! [`WireMessage`]. The version byte is checked before any payload decoding
//! so that a peer speaking a different protocol fails fast with a clear
//! error instead of a garbled deserialization.

use serde::{Deserialize, Serialize};

use crate::assured::{AckInfo, AssuredMode};
use crate::error::ReplError;
use crate::resolver::Modification;
use crate::stamp::{ChangeStamp, RelayId, ReplicaId};
use crate::state::ReplicaState;
use crate::topology::RelayInfo;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// One replicated modification set for a single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Stamp assigned by the originating replica's clock.
    pub stamp: ChangeStamp,
    /// Replica the change originated on.
    pub origin: ReplicaId,
    /// Key of the entry being modified.
    pub entry_key: String,
    /// The modifications, in application order.
    pub mods: Vec<Modification>,
    /// Assurance the originator is waiting for.
    pub mode: AssuredMode,
}

/// Everything that crosses a replication link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message from a replica after the transport comes up.
    HandshakeStart {
        /// Identity of the connecting replica.
        replica_id: ReplicaId,
        /// Replication group the replica belongs to.
        group_id: u8,
        /// Generation id of the replica's data set.
        generation_id: u64,
        /// The replica's state vector, for catch-up positioning.
        state: ReplicaState,
    },
    /// Relay's reply completing the handshake.
    HandshakeAck {
        /// Identity of the relay.
        relay_id: RelayId,
        /// The relay's replication group.
        group_id: u8,
        /// Generation id the topology agrees on.
        generation_id: u64,
        /// The relay's merged state vector.
        state: ReplicaState,
        /// Current view of all known relays.
        topology: Vec<RelayInfo>,
    },
    /// Unsolicited refresh of the topology view.
    TopologyUpdate {
        /// All known relays after the change.
        relays: Vec<RelayInfo>,
    },
    /// A replicated change.
    Update(UpdateMsg),
    /// Acknowledgment for an assured update.
    Ack {
        /// Stamp of the update being acknowledged.
        stamp: ChangeStamp,
        /// Failure detail; an all-clear info means a positive ack.
        info: AckInfo,
    },
    /// Administrative reset of the generation id.
    GenerationReset {
        /// The new generation id.
        generation_id: u64,
    },
    /// Start of a full update session toward this replica.
    FullUpdateStart {
        /// Replica providing the data.
        source: ReplicaId,
        /// Generation id of the incoming data set.
        generation_id: u64,
        /// Number of entries that will follow.
        total_entries: u64,
    },
    /// One entry of a full update session.
    FullUpdateEntry {
        /// Key of the entry.
        entry_key: String,
        /// The entry's encoded history ledger.
        history: Vec<u8>,
    },
    /// End of a full update session. The link drops right after.
    FullUpdateDone {
        /// Entries actually sent, for verification against the start frame.
        entries_sent: u64,
    },
}

impl WireMessage {
    /// Encode into a framed byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>, ReplError> {
        let mut buf = vec![PROTOCOL_VERSION];
        bincode::serialize_into(&mut buf, self)?;
        Ok(buf)
    }

    /// Decode a framed byte buffer, checking the version byte first.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplError> {
        let (&version, payload) = bytes.split_first().ok_or_else(|| ReplError::Link {
            msg: "empty frame".to_string(),
        })?;
        if version != PROTOCOL_VERSION {
            return Err(ReplError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        Ok(bincode::deserialize(payload)?)
    }
}
