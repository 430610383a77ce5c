//! Registry of relays discovered in the mesh.
//!
//! One `TopologyMap` per replication domain, created at subsystem start and
//! passed by handle (never ambient static state). Entries are refreshed on
//! every topology message from a relay and discarded when the relay
//! disconnects or stops being advertised.

use crate::stamp::{RelayId, ReplicaId};
use crate::state::ReplicaState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything known about one relay (replication server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Unique relay identifier.
    pub relay_id: RelayId,
    /// Advertised endpoint.
    pub url: String,
    /// Partitioning group the relay belongs to (e.g. a data center).
    pub group_id: u8,
    /// Fingerprint of the relay's data set, `None` if the relay holds no data
    /// yet.
    pub generation_id: Option<u64>,
    /// The relay's replica state vector (which changes it already holds).
    pub state: ReplicaState,
    /// Replicas currently connected to this relay, used for load balancing
    /// and deterministic eviction ordering.
    pub connected_replicas: Vec<ReplicaId>,
    /// Load-balancing weight.
    pub weight: u32,
}

impl RelayInfo {
    /// Create a relay descriptor with an empty state vector and no connected
    /// replicas.
    pub fn new(relay_id: RelayId, url: impl Into<String>, group_id: u8, weight: u32) -> Self {
        Self {
            relay_id,
            url: url.into(),
            group_id,
            generation_id: None,
            state: ReplicaState::new(),
            connected_replicas: Vec::new(),
            weight,
        }
    }

    /// Number of replicas connected to this relay.
    pub fn connected_count(&self) -> usize {
        self.connected_replicas.len()
    }
}

/// Live view of the relays advertised to this replica.
#[derive(Debug, Default)]
pub struct TopologyMap {
    relays: HashMap<RelayId, RelayInfo>,
}

impl TopologyMap {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a relay from a topology message.
    pub fn upsert(&mut self, info: RelayInfo) {
        self.relays.insert(info.relay_id, info);
    }

    /// Replace the whole view with a freshly advertised relay list.
    pub fn refresh(&mut self, relays: Vec<RelayInfo>) {
        self.relays = relays.into_iter().map(|r| (r.relay_id, r)).collect();
    }

    /// Discard a relay that disconnected or stopped being advertised.
    pub fn remove(&mut self, relay_id: RelayId) -> Option<RelayInfo> {
        self.relays.remove(&relay_id)
    }

    /// Look up one relay.
    pub fn get(&self, relay_id: RelayId) -> Option<&RelayInfo> {
        self.relays.get(&relay_id)
    }

    /// All known relays, sorted by id for deterministic iteration.
    pub fn candidates(&self) -> Vec<RelayInfo> {
        let mut all: Vec<RelayInfo> = self.relays.values().cloned().collect();
        all.sort_by_key(|r| r.relay_id);
        all
    }

    /// Number of known relays.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// True when no relay is known.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Number of known relays in `group_id`.
    pub fn count_in_group(&self, group_id: u8) -> usize {
        self.relays.values().filter(|r| r.group_id == group_id).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(1, "relay-1:8989", 1, 1));
        assert_eq!(topo.len(), 1);
        assert_eq!(topo.get(1).unwrap().url, "relay-1:8989");
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(1, "a", 1, 1));
        let mut updated = RelayInfo::new(1, "a", 1, 3);
        updated.connected_replicas = vec![10, 11];
        topo.upsert(updated);
        let info = topo.get(1).unwrap();
        assert_eq!(info.weight, 3);
        assert_eq!(info.connected_count(), 2);
    }

    #[test]
    fn test_refresh_replaces_view() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(1, "a", 1, 1));
        topo.upsert(RelayInfo::new(2, "b", 1, 1));
        topo.refresh(vec![RelayInfo::new(3, "c", 2, 1)]);
        assert_eq!(topo.len(), 1);
        assert!(topo.get(1).is_none());
        assert!(topo.get(3).is_some());
    }

    #[test]
    fn test_remove() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(1, "a", 1, 1));
        assert!(topo.remove(1).is_some());
        assert!(topo.remove(1).is_none());
        assert!(topo.is_empty());
    }

    #[test]
    fn test_candidates_sorted() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(5, "e", 1, 1));
        topo.upsert(RelayInfo::new(2, "b", 1, 1));
        topo.upsert(RelayInfo::new(9, "i", 1, 1));
        let ids: Vec<_> = topo.candidates().iter().map(|r| r.relay_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_count_in_group() {
        let mut topo = TopologyMap::new();
        topo.upsert(RelayInfo::new(1, "a", 1, 1));
        topo.upsert(RelayInfo::new(2, "b", 1, 1));
        topo.upsert(RelayInfo::new(3, "c", 2, 1));
        assert_eq!(topo.count_in_group(1), 2);
        assert_eq!(topo.count_in_group(2), 1);
        assert_eq!(topo.count_in_group(9), 0);
    }
}
