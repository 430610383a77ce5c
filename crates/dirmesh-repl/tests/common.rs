//! Common test utilities: an in-process relay hub for multi-replica
//! scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;

use dirmesh_repl::assured::{AckInfo, AssuredMode};
use dirmesh_repl::domain::ReplicationDomain;
use dirmesh_repl::link::{LinkConfig, RelayLink};
use dirmesh_repl::stamp::{ChangeStamp, RelayId, ReplicaId};
use dirmesh_repl::state::ReplicaState;
use dirmesh_repl::topology::RelayInfo;
use dirmesh_repl::wire::WireMessage;

/// Install a fmt subscriber for test debugging. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

struct HubInner {
    relay_id: RelayId,
    group_id: u8,
    generation_id: u64,
    links: Mutex<Vec<(ReplicaId, RelayLink)>>,
    // Origin of each in-flight safe-read update, for ack routing.
    pending: Mutex<HashMap<ChangeStamp, ReplicaId>>,
}

/// A single in-process relay serving any number of replicas.
pub struct TestRelay {
    inner: Arc<HubInner>,
}

impl TestRelay {
    pub fn new(relay_id: RelayId, group_id: u8, generation_id: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                relay_id,
                group_id,
                generation_id,
                links: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn relay_info(&self) -> RelayInfo {
        let mut info = RelayInfo::new(
            self.inner.relay_id,
            format!("relay-{}", self.inner.relay_id),
            self.inner.group_id,
            1,
        );
        info.generation_id = Some(self.inner.generation_id);
        info.connected_replicas = self
            .inner
            .links
            .lock()
            .await
            .iter()
            .map(|(id, _)| *id)
            .collect();
        info
    }

    /// Connect a domain to this relay: run the relay side of the handshake
    /// and start serving the link.
    pub async fn connect(&self, domain: &Arc<ReplicationDomain>) -> Result<()> {
        let (replica_end, relay_end) = RelayLink::new_pair(
            LinkConfig::new(0, self.inner.relay_id),
            LinkConfig::new(self.inner.relay_id, 0),
        );

        let inner = Arc::clone(&self.inner);
        let info = self.relay_info().await;
        let acceptor = relay_end.clone();
        let accept = tokio::spawn(async move {
            let replica_id = match acceptor.recv().await {
                Ok(Some(WireMessage::HandshakeStart { replica_id, .. })) => replica_id,
                other => anyhow::bail!("expected handshake start, got {other:?}"),
            };
            acceptor
                .send(&WireMessage::HandshakeAck {
                    relay_id: inner.relay_id,
                    group_id: inner.group_id,
                    generation_id: inner.generation_id,
                    state: ReplicaState::new(),
                    topology: vec![info],
                })
                .await?;
            inner.links.lock().await.push((replica_id, acceptor.clone()));
            tokio::spawn(serve_link(inner, replica_id, acceptor));
            Ok(())
        });

        domain.handshake(replica_end).await?;
        accept.await??;
        Ok(())
    }
}

async fn serve_link(hub: Arc<HubInner>, replica_id: ReplicaId, link: RelayLink) {
    loop {
        match link.recv().await {
            Ok(Some(WireMessage::Update(update))) => {
                let mut forwarded = update.clone();
                match update.mode {
                    AssuredMode::SafeData(_) => {
                        // The relay itself carries the safe-data contract;
                        // receivers replay without blocking anyone.
                        forwarded.mode = AssuredMode::None;
                        let _ = link
                            .send(&WireMessage::Ack {
                                stamp: update.stamp,
                                info: AckInfo {
                                    acked_servers: vec![hub.relay_id],
                                    ..Default::default()
                                },
                            })
                            .await;
                    }
                    AssuredMode::SafeRead => {
                        hub.pending.lock().await.insert(update.stamp, update.origin);
                    }
                    AssuredMode::None => {}
                }
                let links = hub.links.lock().await;
                for (id, peer) in links.iter() {
                    if *id != update.origin {
                        let _ = peer
                            .send(&WireMessage::Update(forwarded.clone()))
                            .await;
                    }
                }
            }
            Ok(Some(WireMessage::Ack { stamp, info })) => {
                let origin = hub.pending.lock().await.remove(&stamp);
                if let Some(origin) = origin {
                    let links = hub.links.lock().await;
                    if let Some((_, peer)) = links.iter().find(|(id, _)| *id == origin) {
                        let _ = peer.send(&WireMessage::Ack { stamp, info }).await;
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                hub.links.lock().await.retain(|(id, _)| *id != replica_id);
                return;
            }
            Err(_) => {}
        }
    }
}

/// Present values of a multi-valued attribute, as the domain would expose
/// them after conflict resolution.
pub fn present_values(
    domain: &ReplicationDomain,
    entry_key: &str,
    attr: &str,
) -> Vec<Vec<u8>> {
    use dirmesh_repl::history::AttributeHistory;
    match domain.entry_history(entry_key).and_then(|h| h.get(attr).cloned()) {
        Some(AttributeHistory::Multi(h)) => h.present_values(),
        Some(AttributeHistory::Single(_)) | None => Vec::new(),
    }
}

/// Poll `cond` until it holds or the budget runs out.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Duration::from_secs(2);
    let result = tokio::time::timeout(deadline, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached within {deadline:?}");
}
