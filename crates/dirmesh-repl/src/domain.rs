//! The replication domain: one replicated data set on one replica.
//!
//! A domain owns the logical clock, the per-entry history ledgers, the
//! replica state vector, the assured-replication coordinator and the link to
//! the current relay. Local writes go through [`ReplicationDomain::publish`];
//! the reader task replays everything arriving on the link and answers
//! safe-read acknowledgment requests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::assured::{
    AckInfo, AckOutcome, AssuredCoordinator, AssuredMode, ModeCountersSnapshot,
    ReceiverCountersSnapshot,
};
use crate::error::ReplError;
use crate::fullsync;
use crate::history::EntryHistory;
use crate::link::{RelayConnector, RelayLink};
use crate::monitor::{BacklogMonitor, MonitorConfig};
use crate::resolver::{resolve_local, resolve_replayed, Modification};
use crate::selector::{choose_rebalance, RebalanceDecision, SelectorConfig};
use crate::stamp::{ChangeStamp, LogicalClock, RelayId, ReplicaId};
use crate::state::ReplicaState;
use crate::status::{ConnectionStatus, StatusEvent, StatusMachine};
use crate::topology::TopologyMap;
use crate::wire::{UpdateMsg, WireMessage};

/// Settings for one replication domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Identity of this replica, unique across the mesh.
    pub replica_id: ReplicaId,
    /// Replication group this replica belongs to.
    pub group_id: u8,
    /// Fingerprint of the local data set at subsystem start.
    pub generation_id: u64,
    /// Attributes whose schema allows at most one value.
    pub single_valued_attrs: HashSet<String>,
    /// Acknowledgment contract applied to local writes.
    pub assured_mode: AssuredMode,
    /// Wall-clock budget for one assured wait. Never renewed.
    pub assured_timeout: Duration,
    /// Max value records kept per multi-valued attribute history, 0 for
    /// unlimited.
    pub history_purge_limit: usize,
    /// How often the rebalance evaluation runs.
    pub rebalance_interval: Duration,
    /// Relay selection tuning.
    pub selector: SelectorConfig,
    /// Backlog monitoring tuning.
    pub monitor: MonitorConfig,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            group_id: 1,
            generation_id: 0,
            single_valued_attrs: HashSet::new(),
            assured_mode: AssuredMode::None,
            assured_timeout: Duration::from_secs(2),
            history_purge_limit: 100,
            rebalance_interval: Duration::from_secs(60),
            selector: SelectorConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl DomainConfig {
    /// Create a config for the given replica identity.
    pub fn new(replica_id: ReplicaId, group_id: u8, generation_id: u64) -> Self {
        Self {
            replica_id,
            group_id,
            generation_id,
            ..Default::default()
        }
    }
}

/// Result of publishing one local modification set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// The stamp assigned to the change.
    pub stamp: ChangeStamp,
    /// How the acknowledgment contract resolved.
    pub outcome: AckOutcome,
}

#[derive(Debug, Default)]
struct DomainStatsInner {
    updates_published: AtomicU64,
    updates_replayed: AtomicU64,
    updates_discarded: AtomicU64,
    mods_obsoleted: AtomicU64,
}

/// Monitoring snapshot of one domain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DomainStatus {
    /// Identity of this replica.
    pub replica_id: ReplicaId,
    /// Replication group.
    pub group_id: u8,
    /// Current generation id.
    pub generation_id: u64,
    /// Connection status toward the relay.
    pub status: ConnectionStatus,
    /// The relay currently connected, if any.
    pub connected_relay: Option<RelayId>,
    /// Updates received but not yet replayed.
    pub backlog: u64,
    /// Assured updates currently awaiting acknowledgment.
    pub pending_acks: usize,
    /// Entries with a history ledger.
    pub entries: usize,
    /// Local writes published.
    pub updates_published: u64,
    /// Remote updates replayed.
    pub updates_replayed: u64,
    /// Remote updates refused because of the connection status.
    pub updates_discarded: u64,
    /// Replayed modifications dropped as obsolete by conflict resolution.
    pub mods_obsoleted: u64,
    /// Commutative fingerprint of the state vector, for cross-replica
    /// convergence checks.
    pub state_fingerprint: u64,
    /// Safe-data publisher counters.
    pub safe_data: ModeCountersSnapshot,
    /// Safe-read publisher counters.
    pub safe_read: ModeCountersSnapshot,
    /// Safe-read receiver counters.
    pub receiver: ReceiverCountersSnapshot,
}

/// One replicated data set on one replica.
pub struct ReplicationDomain {
    config: DomainConfig,
    clock: LogicalClock,
    generation: AtomicU64,
    state: Mutex<ReplicaState>,
    histories: DashMap<String, EntryHistory>,
    coordinator: AssuredCoordinator,
    topology: Mutex<TopologyMap>,
    status: Mutex<StatusMachine>,
    link: Mutex<Option<RelayLink>>,
    connector: Mutex<Option<Arc<dyn RelayConnector>>>,
    connected_relay: Mutex<Option<RelayId>>,
    backlog: Arc<AtomicU64>,
    stats: DomainStatsInner,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<BacklogMonitor>>,
}

impl ReplicationDomain {
    /// Create a domain. Call [`ReplicationDomain::start`] once, then
    /// [`ReplicationDomain::handshake`] whenever a fresh link is available.
    pub fn new(config: DomainConfig) -> Arc<Self> {
        let clock = LogicalClock::new(config.replica_id);
        let generation = AtomicU64::new(config.generation_id);
        Arc::new(Self {
            config,
            clock,
            generation,
            state: Mutex::new(ReplicaState::new()),
            histories: DashMap::new(),
            coordinator: AssuredCoordinator::new(),
            topology: Mutex::new(TopologyMap::new()),
            status: Mutex::new(StatusMachine::new()),
            link: Mutex::new(None),
            connector: Mutex::new(None),
            connected_relay: Mutex::new(None),
            backlog: Arc::new(AtomicU64::new(0)),
            stats: DomainStatsInner::default(),
            tasks: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusMachine> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_topology(&self) -> std::sync::MutexGuard<'_, TopologyMap> {
        self.topology.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current_link(&self) -> Option<RelayLink> {
        self.link.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Start the background tasks: backlog monitoring and periodic rebalance
    /// evaluation. The reader task is spawned per link by `handshake`.
    pub fn start(self: &Arc<Self>) {
        let (status_tx, mut status_rx) = mpsc::channel::<StatusEvent>(16);
        let monitor =
            BacklogMonitor::spawn(self.backlog.clone(), self.config.monitor.clone(), status_tx);
        *self.monitor.lock().unwrap_or_else(|p| p.into_inner()) = Some(monitor);

        let domain = Arc::clone(self);
        let status_task = tokio::spawn(async move {
            while let Some(event) = status_rx.recv().await {
                domain.lock_status().apply(event);
            }
        });

        let domain = Arc::clone(self);
        let rebalance_task = tokio::spawn(async move {
            // Stagger the first evaluation so replicas sharing a wall clock
            // do not all migrate in the same instant.
            let jitter = {
                use rand::Rng;
                rand::thread_rng().gen_range(Duration::ZERO..domain.config.rebalance_interval)
            };
            tokio::time::sleep(jitter).await;
            let mut ticker = tokio::time::interval(domain.config.rebalance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                domain.run_rebalance().await;
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(status_task);
        tasks.push(rebalance_task);
    }

    /// Handshake over a freshly established link and spawn the reader task.
    /// The relay answers with its topology view and the generation id the
    /// mesh agrees on; a mismatch connects in bad-generation status.
    pub async fn handshake(self: &Arc<Self>, link: RelayLink) -> Result<RelayId, ReplError> {
        let local_state = self.lock_state().clone();
        link.send(&WireMessage::HandshakeStart {
            replica_id: self.config.replica_id,
            group_id: self.config.group_id,
            generation_id: self.generation.load(Ordering::Relaxed),
            state: local_state,
        })
        .await?;

        match link.recv().await? {
            Some(WireMessage::HandshakeAck {
                relay_id,
                generation_id,
                topology,
                ..
            }) => {
                self.lock_topology().refresh(topology);
                let local_generation = self.generation.load(Ordering::Relaxed);
                let event = if generation_id == local_generation {
                    if self.backlog.load(Ordering::Relaxed) > self.config.monitor.degraded_threshold
                    {
                        StatusEvent::ConnectedDegraded
                    } else {
                        StatusEvent::ConnectedOk
                    }
                } else {
                    tracing::warn!(
                        relay_id,
                        local = local_generation,
                        remote = generation_id,
                        "generation id mismatch, data set needs a full update"
                    );
                    StatusEvent::ConnectedBadGeneration
                };
                self.lock_status().apply(event);
                *self.link.lock().unwrap_or_else(|p| p.into_inner()) = Some(link.clone());
                *self
                    .connected_relay
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(relay_id);

                let domain = Arc::clone(self);
                let reader = tokio::spawn(async move { domain.run_reader(link).await });
                self.tasks
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(reader);
                tracing::info!(relay_id, replica = self.config.replica_id, "connected to relay");
                Ok(relay_id)
            }
            Some(other) => Err(ReplError::Handshake {
                relay_id: 0,
                msg: format!("unexpected reply {other:?}"),
            }),
            None => Err(ReplError::Link {
                msg: "link dropped during handshake".to_string(),
            }),
        }
    }

    /// Publish a local modification set for one entry.
    ///
    /// The change is applied to the local ledger first (local writes are
    /// always causally latest), then shipped to the relay. Under an assured
    /// mode the caller suspends until the contract resolves; only this caller
    /// waits, the domain keeps processing everything else.
    pub async fn publish(
        &self,
        entry_key: &str,
        mods: Vec<Modification>,
    ) -> Result<PublishResult, ReplError> {
        let stamp = self.clock.next();
        self.lock_state().update(stamp);

        {
            let mut entry = self
                .histories
                .entry(entry_key.to_string())
                .or_insert_with(EntryHistory::new);
            for m in &mods {
                let single = self.config.single_valued_attrs.contains(&m.attr);
                resolve_local(&mut entry, m, stamp, single);
            }
            entry.purge(self.config.history_purge_limit);
        }
        self.stats.updates_published.fetch_add(1, Ordering::Relaxed);

        let Some(link) = self.current_link() else {
            tracing::warn!(entry_key, "no relay link, change applied locally only");
            return Ok(PublishResult {
                stamp,
                outcome: AckOutcome::SentOnly,
            });
        };

        // An assured contract needs at least one relay of the local group to
        // enforce it; without one the caller gets the change back immediately.
        let mode = self.config.assured_mode;
        let eligible =
            mode.is_assured() && self.lock_topology().count_in_group(self.config.group_id) > 0;
        let wire_mode = if eligible { mode } else { AssuredMode::None };
        let pending = if eligible {
            self.coordinator.record_sent(mode);
            Some(self.coordinator.track(stamp))
        } else {
            None
        };

        let msg = WireMessage::Update(UpdateMsg {
            stamp,
            origin: self.config.replica_id,
            entry_key: entry_key.to_string(),
            mods,
            mode: wire_mode,
        });
        if let Err(e) = link.send(&msg).await {
            self.on_link_lost(&link).await;
            return Err(e);
        }

        let outcome = match pending {
            Some(pending) => {
                self.coordinator
                    .wait(pending, mode, self.config.assured_timeout)
                    .await
            }
            None => AckOutcome::SentOnly,
        };
        Ok(PublishResult { stamp, outcome })
    }

    /// Replay one update received from the mesh, returning the effective
    /// modifications after conflict resolution. Callers must have checked
    /// that the current status accepts updates.
    pub fn replay_update(&self, update: &UpdateMsg) -> Vec<Modification> {
        self.clock.observe(update.stamp);

        let mut effective = Vec::with_capacity(update.mods.len());
        {
            let mut entry = self
                .histories
                .entry(update.entry_key.clone())
                .or_insert_with(EntryHistory::new);
            for m in &update.mods {
                let single = self.config.single_valued_attrs.contains(&m.attr);
                match resolve_replayed(&mut entry, m, update.stamp, single) {
                    Some(m) => effective.push(m),
                    None => {
                        self.stats.mods_obsoleted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            entry.purge(self.config.history_purge_limit);
        }
        // The mark advances only once the change is actually in the ledger.
        self.lock_state().update(update.stamp);
        self.stats.updates_replayed.fetch_add(1, Ordering::Relaxed);
        effective
    }

    async fn run_reader(self: Arc<Self>, link: RelayLink) {
        loop {
            match link.recv().await {
                Ok(Some(msg)) => {
                    if self.handle_message(&link, msg).await {
                        return;
                    }
                }
                Ok(None) => {
                    self.on_link_lost(&link).await;
                    return;
                }
                Err(e) => {
                    // Undecodable frame; the link itself is still up.
                    tracing::warn!(error = %e, "ignoring bad frame from relay");
                }
            }
        }
    }

    /// Returns true when the session on this link is over.
    async fn handle_message(&self, link: &RelayLink, msg: WireMessage) -> bool {
        match msg {
            WireMessage::Update(update) => {
                // The gauge mirrors the real inbound queue depth: everything
                // still waiting on the link plus the update in hand.
                self.backlog
                    .store(link.queued().saturating_add(1), Ordering::Relaxed);
                self.handle_update(link, update).await;
                self.backlog.store(link.queued(), Ordering::Relaxed);
                false
            }
            WireMessage::Ack { stamp, info } => {
                if !self.coordinator.complete(stamp, info) {
                    tracing::debug!(stamp = %stamp, "ack for update no longer pending");
                }
                false
            }
            WireMessage::TopologyUpdate { relays } => {
                self.lock_topology().refresh(relays);
                false
            }
            WireMessage::GenerationReset { generation_id } => {
                let local = self.generation.load(Ordering::Relaxed);
                if generation_id == local {
                    tracing::debug!(generation_id, "generation id reset already matches");
                } else {
                    // The local data set is divergent from here on; the new
                    // generation id is only installed by a full update, never
                    // adopted on faith. The link stays up so the full-update
                    // session can arrive on it.
                    tracing::warn!(
                        local,
                        remote = generation_id,
                        "generation id reset, awaiting full update"
                    );
                    self.lock_status().apply(StatusEvent::GenerationReset);
                }
                false
            }
            WireMessage::FullUpdateStart {
                source,
                generation_id,
                total_entries,
            } => {
                self.lock_status().apply(StatusEvent::FullUpdateStarted);
                match fullsync::receive_full_update(link, source, generation_id, total_entries)
                    .await
                {
                    Ok(data) => {
                        self.histories.clear();
                        for (key, history) in data.entries {
                            self.histories.insert(key, history);
                        }
                        self.generation.store(data.generation_id, Ordering::Relaxed);
                        self.lock_status().apply(StatusEvent::FullUpdateEnded);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "full update aborted");
                        self.lock_status().apply(StatusEvent::LinkLost);
                    }
                }
                // Either way the link is gone now.
                self.drop_link(link);
                self.coordinator.cancel_all();
                true
            }
            other => {
                tracing::warn!(?other, "unexpected message on established link");
                false
            }
        }
    }

    async fn handle_update(&self, link: &RelayLink, update: UpdateMsg) {
        let status = self.lock_status().status();
        if !status.accepts_updates() {
            self.stats.updates_discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stamp = %update.stamp, %status, "refusing update in current status");
            if update.mode == AssuredMode::SafeRead {
                self.send_safe_read_ack(link, update.stamp, false).await;
            }
            return;
        }

        let _effective = self.replay_update(&update);

        if update.mode == AssuredMode::SafeRead {
            // A degraded replica replays but must not vouch for durability.
            let positive = status.can_ack_safe_read();
            self.send_safe_read_ack(link, update.stamp, positive).await;
        }
    }

    async fn send_safe_read_ack(&self, link: &RelayLink, stamp: ChangeStamp, positive: bool) {
        let info = if positive {
            AckInfo {
                acked_servers: vec![self.config.replica_id],
                ..Default::default()
            }
        } else {
            AckInfo {
                wrong_status: true,
                failed_servers: vec![self.config.replica_id],
                ..Default::default()
            }
        };
        self.coordinator.record_received(positive);
        if let Err(e) = link.send(&WireMessage::Ack { stamp, info }).await {
            tracing::warn!(stamp = %stamp, error = %e, "could not return safe-read ack");
        }
    }

    async fn on_link_lost(&self, link: &RelayLink) {
        link.close().await;
        self.drop_link(link);
        self.coordinator.cancel_all();
        // The inbound queue dies with the link.
        self.backlog.store(0, Ordering::Relaxed);
        let mut status = self.lock_status();
        if status.status() != ConnectionStatus::NotConnected {
            status.apply(StatusEvent::LinkLost);
        }
    }

    fn drop_link(&self, _link: &RelayLink) {
        *self.link.lock().unwrap_or_else(|p| p.into_inner()) = None;
        *self
            .connected_relay
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Pick the relay to dial for the next connection, from the current
    /// topology view.
    pub fn select_relay(&self) -> Result<RelayId, ReplError> {
        let candidates = self.lock_topology().candidates();
        crate::selector::choose_initial(
            &self.lock_state(),
            &candidates,
            self.config.replica_id,
            self.config.group_id,
        )
        .ok_or(ReplError::NoRelayAvailable)
    }

    /// Evaluate whether this replica should migrate to another relay.
    pub fn evaluate_rebalance(&self) -> RebalanceDecision {
        let current = *self
            .connected_relay
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let Some(current) = current else {
            return RebalanceDecision::KeepCurrent;
        };
        let candidates = self.lock_topology().candidates();
        choose_rebalance(
            &self.config.selector,
            &candidates,
            current,
            self.config.replica_id,
            self.config.group_id,
        )
    }

    /// Install the dialer used to reach relays after a migrate decision.
    pub fn set_connector(&self, connector: Arc<dyn RelayConnector>) {
        *self.connector.lock().unwrap_or_else(|p| p.into_inner()) = Some(connector);
    }

    async fn run_rebalance(self: &Arc<Self>) {
        if let RebalanceDecision::MigrateTo(target) = self.evaluate_rebalance() {
            tracing::info!(target, "migrating to a less loaded relay");
            // Close the old writer first; both links must never be live at
            // once for the same replica.
            if let Some(link) = self.current_link() {
                self.on_link_lost(&link).await;
            }
            self.connect_to(target).await;
        }
    }

    async fn connect_to(self: &Arc<Self>, relay: RelayId) {
        let connector = self
            .connector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(connector) = connector else {
            tracing::warn!(relay, "no connector installed, staying disconnected");
            return;
        };
        let Some(url) = self.lock_topology().get(relay).map(|r| r.url.clone()) else {
            tracing::warn!(relay, "relay vanished from the topology before dialing");
            return;
        };
        match connector.connect(relay, &url).await {
            Ok(link) => {
                if let Err(e) = self.handshake(link).await {
                    tracing::warn!(relay, error = %e, "handshake failed after migrating");
                }
            }
            Err(e) => tracing::warn!(relay, error = %e, "could not reach relay"),
        }
    }

    /// The current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock_status().status()
    }

    /// A clone of the replica state vector.
    pub fn state_vector(&self) -> ReplicaState {
        self.lock_state().clone()
    }

    /// The history ledger of one entry, if any change ever touched it.
    pub fn entry_history(&self, entry_key: &str) -> Option<EntryHistory> {
        self.histories.get(entry_key).map(|h| h.clone())
    }

    /// Monitoring snapshot.
    pub fn status_snapshot(&self) -> DomainStatus {
        DomainStatus {
            replica_id: self.config.replica_id,
            group_id: self.config.group_id,
            generation_id: self.generation.load(Ordering::Relaxed),
            status: self.lock_status().status(),
            connected_relay: *self
                .connected_relay
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
            backlog: self.backlog.load(Ordering::Relaxed),
            pending_acks: self.coordinator.pending_count(),
            entries: self.histories.len(),
            updates_published: self.stats.updates_published.load(Ordering::Relaxed),
            updates_replayed: self.stats.updates_replayed.load(Ordering::Relaxed),
            updates_discarded: self.stats.updates_discarded.load(Ordering::Relaxed),
            mods_obsoleted: self.stats.mods_obsoleted.load(Ordering::Relaxed),
            state_fingerprint: self.lock_state().fingerprint(),
            safe_data: self.coordinator.safe_data_counters(),
            safe_read: self.coordinator.safe_read_counters(),
            receiver: self.coordinator.receiver_counters(),
        }
    }

    /// Stop background tasks and drop the link.
    pub async fn shutdown(&self) {
        if let Some(link) = self.current_link() {
            self.on_link_lost(&link).await;
        }
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            monitor.shutdown();
        }
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::resolver::ModOp;
    use crate::topology::RelayInfo;

    const RELAY: RelayId = 100;

    fn relay_info(generation_id: u64) -> RelayInfo {
        let mut info = RelayInfo::new(RELAY, "relay-100", 1, 1);
        info.generation_id = Some(generation_id);
        info
    }

    /// Play the relay side of a handshake on `link`.
    async fn accept_handshake(link: &RelayLink, generation_id: u64) {
        match link.recv().await.unwrap() {
            Some(WireMessage::HandshakeStart { .. }) => {}
            other => panic!("expected handshake start, got {other:?}"),
        }
        link.send(&WireMessage::HandshakeAck {
            relay_id: RELAY,
            group_id: 1,
            generation_id,
            state: ReplicaState::new(),
            topology: vec![relay_info(generation_id)],
        })
        .await
        .unwrap();
    }

    async fn connected_domain(config: DomainConfig) -> (Arc<ReplicationDomain>, RelayLink) {
        let domain = ReplicationDomain::new(config);
        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let handshaker = relay_end.clone();
        let generation = domain.status_snapshot().generation_id;
        let relay_task = tokio::spawn(async move {
            accept_handshake(&handshaker, generation).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        (domain, relay_end)
    }

    fn add_mail(value: &[u8]) -> Modification {
        Modification::new("mail", ModOp::AddValues(vec![value.to_vec()]))
    }

    #[tokio::test]
    async fn test_handshake_matching_generation_goes_normal() {
        let (domain, _relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Normal);
        let snap = domain.status_snapshot();
        assert_eq!(snap.connected_relay, Some(RELAY));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_generation_mismatch_goes_bad_generation() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let relay_task = tokio::spawn(async move {
            accept_handshake(&relay_end, 99).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        assert_eq!(domain.connection_status(), ConnectionStatus::BadGeneration);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_applies_locally_and_ships_update() {
        let (domain, relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;

        let result = domain
            .publish("uid=alice", vec![add_mail(b"alice@example.com")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::SentOnly);

        match relay.recv().await.unwrap() {
            Some(WireMessage::Update(u)) => {
                assert_eq!(u.stamp, result.stamp);
                assert_eq!(u.origin, 1);
                assert_eq!(u.entry_key, "uid=alice");
                assert_eq!(u.mode, AssuredMode::None);
            }
            other => panic!("expected update, got {other:?}"),
        }

        let history = domain.entry_history("uid=alice").unwrap();
        match history.get("mail").unwrap() {
            crate::history::AttributeHistory::Multi(h) => {
                assert!(h.value_present(b"alice@example.com"))
            }
            other => panic!("unexpected history shape {other:?}"),
        }
        assert_eq!(domain.state_vector().mark(1), Some(result.stamp));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_without_link_is_sent_only() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::SentOnly);
        assert!(domain.entry_history("uid=alice").is_some());
    }

    #[tokio::test]
    async fn test_safe_read_publish_resolves_when_acked() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.assured_mode = AssuredMode::SafeRead;
        config.assured_timeout = Duration::from_secs(3);
        let (domain, relay) = connected_domain(config).await;

        let acker = relay.clone();
        tokio::spawn(async move {
            match acker.recv().await.unwrap() {
                Some(WireMessage::Update(u)) => {
                    assert_eq!(u.mode, AssuredMode::SafeRead);
                    acker
                        .send(&WireMessage::Ack {
                            stamp: u.stamp,
                            info: AckInfo::default(),
                        })
                        .await
                        .unwrap();
                }
                other => panic!("expected update, got {other:?}"),
            }
        });

        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::Acked);
        let snap = domain.status_snapshot();
        assert_eq!(snap.safe_read.sent, 1);
        assert_eq!(snap.safe_read.acknowledged, 1);
        domain.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_data_publish_times_out_without_ack() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.assured_mode = AssuredMode::SafeData(2);
        config.assured_timeout = Duration::from_millis(200);
        let (domain, relay) = connected_domain(config).await;

        // The relay swallows the update and never acks.
        let swallow = relay.clone();
        tokio::spawn(async move {
            let _ = swallow.recv().await;
        });

        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::TimedOut);
        let snap = domain.status_snapshot();
        assert_eq!(snap.safe_data.timed_out, 1);
        assert_eq!(snap.pending_acks, 0);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_safe_data_single_relay_ack_cannot_satisfy_level_two() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.assured_mode = AssuredMode::SafeData(2);
        config.assured_timeout = Duration::from_secs(3);
        let (domain, relay) = connected_domain(config).await;

        // The only relay confirms alone; a level-2 aggregate needs two.
        let acker = relay.clone();
        tokio::spawn(async move {
            match acker.recv().await.unwrap() {
                Some(WireMessage::Update(u)) => {
                    acker
                        .send(&WireMessage::Ack {
                            stamp: u.stamp,
                            info: AckInfo {
                                acked_servers: vec![RELAY],
                                ..Default::default()
                            },
                        })
                        .await
                        .unwrap();
                }
                other => panic!("expected update, got {other:?}"),
            }
        });

        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert!(!result.outcome.is_acknowledged());
        assert!(matches!(result.outcome, AckOutcome::NotAcked(_)));
        let snap = domain.status_snapshot();
        assert_eq!(snap.safe_data.acknowledged, 0);
        assert_eq!(snap.safe_data.not_acknowledged, 1);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_assured_downgraded_without_group_relay() {
        // The only advertised relay is in a foreign group; the contract
        // cannot be enforced so the caller resumes immediately.
        let mut config = DomainConfig::new(1, 5, 7);
        config.assured_mode = AssuredMode::SafeRead;
        let (domain, relay) = connected_domain(config).await;

        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::SentOnly);
        match relay.recv().await.unwrap() {
            Some(WireMessage::Update(u)) => assert_eq!(u.mode, AssuredMode::None),
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(domain.status_snapshot().safe_read.sent, 0);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_incoming_safe_read_update_is_replayed_and_acked() {
        let (domain, relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;

        let stamp = ChangeStamp::new(5000, 0, 2);
        relay
            .send(&WireMessage::Update(UpdateMsg {
                stamp,
                origin: 2,
                entry_key: "uid=bob".to_string(),
                mods: vec![add_mail(b"bob@example.com")],
                mode: AssuredMode::SafeRead,
            }))
            .await
            .unwrap();

        match relay.recv().await.unwrap() {
            Some(WireMessage::Ack { stamp: acked, info }) => {
                assert_eq!(acked, stamp);
                assert!(info.is_positive());
            }
            other => panic!("expected ack, got {other:?}"),
        }

        assert!(domain.entry_history("uid=bob").is_some());
        assert_eq!(domain.state_vector().mark(2), Some(stamp));
        let snap = domain.status_snapshot();
        assert_eq!(snap.updates_replayed, 1);
        assert_eq!(snap.receiver.received, 1);
        assert_eq!(snap.receiver.acked_positive, 1);
        // The local clock must now issue stamps after the observed one.
        assert!(domain.clock.next() > stamp);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_lost_cancels_pending_assured_waits() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.assured_mode = AssuredMode::SafeRead;
        config.assured_timeout = Duration::from_secs(10);
        let (domain, relay) = connected_domain(config).await;

        let dropper = relay.clone();
        tokio::spawn(async move {
            let _ = dropper.recv().await;
            drop(dropper);
            drop(relay);
        });

        let result = domain
            .publish("uid=alice", vec![add_mail(b"a@b")])
            .await
            .unwrap();
        assert_eq!(result.outcome, AckOutcome::LinkLost);
        assert_eq!(domain.connection_status(), ConnectionStatus::NotConnected);
        domain.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_replica_acks_wrong_status() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.monitor = MonitorConfig {
            degraded_threshold: 10,
            poll_interval: Duration::from_millis(50),
        };
        let (domain, relay) = connected_domain(config).await;
        domain.start();

        // Push the gauge over the threshold and let the monitor notice.
        domain.backlog.store(50, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Degraded);
        domain.backlog.store(0, Ordering::Relaxed);

        let stamp = ChangeStamp::new(5000, 0, 2);
        relay
            .send(&WireMessage::Update(UpdateMsg {
                stamp,
                origin: 2,
                entry_key: "uid=bob".to_string(),
                mods: vec![add_mail(b"bob@example.com")],
                mode: AssuredMode::SafeRead,
            }))
            .await
            .unwrap();

        match relay.recv().await.unwrap() {
            Some(WireMessage::Ack { info, .. }) => {
                assert!(info.wrong_status);
                assert_eq!(info.failed_servers, vec![1]);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        // Degraded still replays; it just cannot vouch for safe reads.
        assert!(domain.entry_history("uid=bob").is_some());
        assert_eq!(domain.status_snapshot().receiver.acked_negative, 1);
        domain.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_from_real_traffic_drives_degraded_and_back() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.monitor = MonitorConfig {
            degraded_threshold: 5,
            poll_interval: Duration::from_millis(50),
        };
        let domain = ReplicationDomain::new(config);

        // A one-slot outbound queue wedges the reader on its second ack
        // while the remaining updates pile up inbound.
        let mut replica_cfg = LinkConfig::new(1, RELAY);
        replica_cfg.queue_capacity = 1;
        let (replica_end, relay_end) = RelayLink::new_pair(replica_cfg, LinkConfig::new(RELAY, 1));
        let handshaker = relay_end.clone();
        let relay_task = tokio::spawn(async move {
            accept_handshake(&handshaker, 7).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        domain.start();

        for i in 0..20u64 {
            relay_end
                .send(&WireMessage::Update(UpdateMsg {
                    stamp: ChangeStamp::new(1000 + i, 0, 2),
                    origin: 2,
                    entry_key: format!("uid=user{i}"),
                    mods: vec![add_mail(b"u@x")],
                    mode: AssuredMode::SafeRead,
                }))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Degraded);
        assert!(domain.status_snapshot().backlog > 5);

        // Draining the acks lets the reader work the queue back down.
        for _ in 0..20 {
            match relay_end.recv().await.unwrap() {
                Some(WireMessage::Ack { .. }) => {}
                other => panic!("expected ack, got {other:?}"),
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Normal);
        assert_eq!(domain.status_snapshot().backlog, 0);
        assert_eq!(domain.status_snapshot().updates_replayed, 20);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_with_existing_backlog_goes_degraded() {
        let mut config = DomainConfig::new(1, 1, 7);
        config.monitor.degraded_threshold = 5;
        let domain = ReplicationDomain::new(config);
        domain.backlog.store(50, Ordering::Relaxed);

        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let relay_task = tokio::spawn(async move {
            accept_handshake(&relay_end, 7).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        assert_eq!(domain.connection_status(), ConnectionStatus::Degraded);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_generation_refuses_updates() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let handshaker = relay_end.clone();
        let relay_task = tokio::spawn(async move {
            accept_handshake(&handshaker, 99).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();

        let stamp = ChangeStamp::new(5000, 0, 2);
        relay_end
            .send(&WireMessage::Update(UpdateMsg {
                stamp,
                origin: 2,
                entry_key: "uid=bob".to_string(),
                mods: vec![add_mail(b"bob@example.com")],
                mode: AssuredMode::SafeRead,
            }))
            .await
            .unwrap();

        match relay_end.recv().await.unwrap() {
            Some(WireMessage::Ack { info, .. }) => assert!(info.wrong_status),
            other => panic!("expected negative ack, got {other:?}"),
        }
        assert!(domain.entry_history("uid=bob").is_none());
        assert_eq!(domain.status_snapshot().updates_discarded, 1);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_generation_reset_poisons_status_without_adopting_value() {
        let (domain, relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Normal);

        relay
            .send(&WireMessage::GenerationReset { generation_id: 99 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::BadGeneration);
        // The new value is never taken on faith; only a full update may
        // install it.
        assert_eq!(domain.status_snapshot().generation_id, 7);

        // The session stays up, so the full update rides the same link.
        let mut history = EntryHistory::new();
        history
            .multi_mut("cn")
            .record_add(b"Bob", ChangeStamp::new(1, 0, 2));
        let entries = vec![("uid=bob".to_string(), history.encode().unwrap())];
        fullsync::send_full_update(&relay, 2, 99, entries)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = domain.status_snapshot();
        assert_eq!(snap.generation_id, 99);
        assert_eq!(snap.status, ConnectionStatus::NotConnected);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_generation_reset_matching_local_value_changes_nothing() {
        let (domain, relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        relay
            .send(&WireMessage::GenerationReset { generation_id: 7 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(domain.connection_status(), ConnectionStatus::Normal);
        assert_eq!(domain.status_snapshot().generation_id, 7);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_update_installs_data_and_generation() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let handshaker = relay_end.clone();
        let relay_task = tokio::spawn(async move {
            accept_handshake(&handshaker, 99).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        assert_eq!(domain.connection_status(), ConnectionStatus::BadGeneration);

        let mut history = EntryHistory::new();
        history
            .multi_mut("cn")
            .record_add(b"Bob", ChangeStamp::new(1, 0, 2));
        let entries = vec![("uid=bob".to_string(), history.encode().unwrap())];
        fullsync::send_full_update(&relay_end, 2, 99, entries)
            .await
            .unwrap();

        // Give the reader task time to finish the session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = domain.status_snapshot();
        assert_eq!(snap.generation_id, 99);
        assert_eq!(snap.status, ConnectionStatus::NotConnected);
        assert_eq!(snap.entries, 1);
        assert!(domain.entry_history("uid=bob").is_some());

        // A fresh handshake with the adopted generation now goes normal.
        let (replica_end, relay_end) =
            RelayLink::new_pair(LinkConfig::new(1, RELAY), LinkConfig::new(RELAY, 1));
        let relay_task = tokio::spawn(async move {
            accept_handshake(&relay_end, 99).await;
        });
        domain.handshake(replica_end).await.unwrap();
        relay_task.await.unwrap();
        assert_eq!(domain.connection_status(), ConnectionStatus::Normal);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_adds_converge_across_two_domains() {
        // Two replicas change the same attribute concurrently; replaying each
        // other's update must leave identical ledgers.
        let a = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let b = ReplicationDomain::new(DomainConfig::new(2, 1, 7));

        let ra = a.publish("uid=x", vec![add_mail(b"a@x")]).await.unwrap();
        let rb = b.publish("uid=x", vec![add_mail(b"b@x")]).await.unwrap();

        b.replay_update(&UpdateMsg {
            stamp: ra.stamp,
            origin: 1,
            entry_key: "uid=x".to_string(),
            mods: vec![add_mail(b"a@x")],
            mode: AssuredMode::None,
        });
        a.replay_update(&UpdateMsg {
            stamp: rb.stamp,
            origin: 2,
            entry_key: "uid=x".to_string(),
            mods: vec![add_mail(b"b@x")],
            mode: AssuredMode::None,
        });

        assert_eq!(a.entry_history("uid=x"), b.entry_history("uid=x"));
        assert_eq!(
            a.state_vector().fingerprint(),
            b.state_vector().fingerprint()
        );
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_at_domain_level() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        let update = UpdateMsg {
            stamp: ChangeStamp::new(100, 0, 2),
            origin: 2,
            entry_key: "uid=x".to_string(),
            mods: vec![add_mail(b"v")],
            mode: AssuredMode::None,
        };
        let first = domain.replay_update(&update);
        assert_eq!(first.len(), 1);
        let second = domain.replay_update(&update);
        assert!(second.is_empty());
        assert_eq!(domain.status_snapshot().mods_obsoleted, 1);
    }

    #[tokio::test]
    async fn test_select_relay_needs_topology() {
        let domain = ReplicationDomain::new(DomainConfig::new(1, 1, 7));
        assert!(matches!(
            domain.select_relay(),
            Err(ReplError::NoRelayAvailable)
        ));
        let (domain, _relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        assert_eq!(domain.select_relay().unwrap(), RELAY);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_rebalance_keeps_current_without_pressure() {
        let (domain, _relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        assert_eq!(domain.evaluate_rebalance(), RebalanceDecision::KeepCurrent);
        domain.shutdown().await;
    }

    struct SecondRelayConnector;

    #[async_trait::async_trait]
    impl RelayConnector for SecondRelayConnector {
        async fn connect(&self, relay: RelayId, url: &str) -> Result<RelayLink, ReplError> {
            assert_eq!(relay, 200);
            assert_eq!(url, "relay-200");
            let (replica_end, relay_end) =
                RelayLink::new_pair(LinkConfig::new(1, relay), LinkConfig::new(relay, 1));
            tokio::spawn(async move {
                match relay_end.recv().await.unwrap() {
                    Some(WireMessage::HandshakeStart { .. }) => {}
                    other => panic!("expected handshake start, got {other:?}"),
                }
                relay_end
                    .send(&WireMessage::HandshakeAck {
                        relay_id: 200,
                        group_id: 1,
                        generation_id: 7,
                        state: ReplicaState::new(),
                        topology: vec![RelayInfo::new(200, "relay-200", 1, 1)],
                    })
                    .await
                    .unwrap();
            });
            Ok(replica_end)
        }
    }

    #[tokio::test]
    async fn test_rebalance_migrates_and_reconnects_to_target() {
        let (domain, _relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        domain.set_connector(Arc::new(SecondRelayConnector));

        // Relay 100 carries three replicas while relay 200 sits idle; this
        // replica has the lowest id, so it is the one that moves.
        {
            let mut topo = domain.lock_topology();
            let mut overloaded = relay_info(7);
            overloaded.connected_replicas = vec![1, 2, 3];
            topo.upsert(overloaded);
            let mut idle = RelayInfo::new(200, "relay-200", 1, 1);
            idle.generation_id = Some(7);
            topo.upsert(idle);
        }
        assert_eq!(domain.evaluate_rebalance(), RebalanceDecision::MigrateTo(200));

        domain.run_rebalance().await;
        let snap = domain.status_snapshot();
        assert_eq!(snap.connected_relay, Some(200));
        assert_eq!(snap.status, ConnectionStatus::Normal);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_rebalance_without_connector_stays_disconnected() {
        let (domain, _relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        {
            let mut topo = domain.lock_topology();
            let mut overloaded = relay_info(7);
            overloaded.connected_replicas = vec![1, 2, 3];
            topo.upsert(overloaded);
            let mut idle = RelayInfo::new(200, "relay-200", 1, 1);
            idle.generation_id = Some(7);
            topo.upsert(idle);
        }
        domain.run_rebalance().await;
        assert_eq!(domain.connection_status(), ConnectionStatus::NotConnected);
        assert_eq!(domain.status_snapshot().connected_relay, None);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_topology_update_refreshes_view() {
        let (domain, relay) = connected_domain(DomainConfig::new(1, 1, 7)).await;
        relay
            .send(&WireMessage::TopologyUpdate {
                relays: vec![relay_info(7), RelayInfo::new(101, "relay-101", 1, 2)],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(domain.lock_topology().len(), 2);
        domain.shutdown().await;
    }
}
