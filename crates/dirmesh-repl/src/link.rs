//! Replication link: the transport between a replica and its relay.
//!
//! In production this wraps a TCP stream carrying length-delimited frames.
//! In tests it uses tokio mpsc channels for in-process simulation; both ends
//! still go through the full frame encoding so the wire format is exercised
//! on every message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::ReplError;
use crate::stamp::RelayId;
use crate::wire::WireMessage;

/// Dials relays on behalf of a replication domain.
///
/// The transport itself belongs to the embedder; the domain only decides
/// when and where to connect, then runs its handshake over whatever link the
/// connector hands back.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a fresh link to `relay` at `url`.
    async fn connect(&self, relay: RelayId, url: &str) -> Result<RelayLink, ReplError>;
}

/// Configuration for one end of a replication link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Identity of the local end, for logging.
    pub local_id: u16,
    /// Identity of the peer, for logging.
    pub peer_id: u16,
    /// Capacity of the outbound frame queue.
    pub queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            peer_id: 0,
            queue_capacity: 1024,
        }
    }
}

impl LinkConfig {
    /// Create a config for a link between the given endpoints.
    pub fn new(local_id: u16, peer_id: u16) -> Self {
        Self {
            local_id,
            peer_id,
            ..Default::default()
        }
    }
}

/// Whether the link is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Open and passing frames.
    #[default]
    Open,
    /// Closed locally; sends fail, receives drain then end.
    Closed,
}

#[derive(Debug)]
struct LinkStatsInner {
    msgs_sent: AtomicU64,
    msgs_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    decode_errors: AtomicU64,
}

impl LinkStatsInner {
    fn new() -> Self {
        Self {
            msgs_sent: AtomicU64::new(0),
            msgs_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }
}

/// Snapshot of link traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LinkStats {
    /// Messages sent from this end.
    pub msgs_sent: u64,
    /// Messages received on this end.
    pub msgs_received: u64,
    /// Encoded bytes sent.
    pub bytes_sent: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
    /// Sends that failed because the link was down.
    pub send_errors: u64,
    /// Frames that failed to decode.
    pub decode_errors: u64,
}

/// One end of a replication link.
pub struct RelayLink {
    config: LinkConfig,
    state: Arc<Mutex<LinkState>>,
    stats: Arc<LinkStatsInner>,
    sender: mpsc::Sender<Bytes>,
    receiver: Arc<Mutex<mpsc::Receiver<Bytes>>>,
}

impl Clone for RelayLink {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            sender: self.sender.clone(),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl RelayLink {
    /// Create a connected pair for in-process use.
    /// Returns (end_a, end_b); frames sent on one come out the other.
    pub fn new_pair(config_a: LinkConfig, config_b: LinkConfig) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel::<Bytes>(config_a.queue_capacity);
        let (tx_b, rx_b) = mpsc::channel::<Bytes>(config_b.queue_capacity);

        let end_a = Self {
            config: config_a,
            state: Arc::new(Mutex::new(LinkState::Open)),
            stats: Arc::new(LinkStatsInner::new()),
            sender: tx_a,
            receiver: Arc::new(Mutex::new(rx_b)),
        };
        let end_b = Self {
            config: config_b,
            state: Arc::new(Mutex::new(LinkState::Open)),
            stats: Arc::new(LinkStatsInner::new()),
            sender: tx_b,
            receiver: Arc::new(Mutex::new(rx_a)),
        };
        (end_a, end_b)
    }

    /// Send one message. Fails once this end is closed or the peer is gone.
    pub async fn send(&self, msg: &WireMessage) -> Result<(), ReplError> {
        {
            let state = self.state.lock().await;
            if *state == LinkState::Closed {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return Err(ReplError::Link {
                    msg: "link is closed".to_string(),
                });
            }
        }

        let frame = Bytes::from(msg.encode()?);
        let len = frame.len() as u64;
        self.sender.send(frame).await.map_err(|_| {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            ReplError::Link {
                msg: format!("peer {} went away", self.config.peer_id),
            }
        })?;
        self.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Receive the next message. `Ok(None)` means the peer closed the link.
    /// A frame that fails to decode is an error but leaves the link open.
    pub async fn recv(&self) -> Result<Option<WireMessage>, ReplError> {
        let frame = {
            let mut receiver = self.receiver.lock().await;
            match receiver.recv().await {
                Some(frame) => frame,
                None => return Ok(None),
            }
        };
        self.stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        match WireMessage::decode(&frame) {
            Ok(msg) => {
                self.stats.msgs_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some(msg))
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(peer = self.config.peer_id, error = %e, "dropping undecodable frame");
                Err(e)
            }
        }
    }

    /// Frames sitting in the inbound queue, not yet picked up by a receive.
    /// Reports zero while a receive is parked on the empty channel.
    pub fn queued(&self) -> u64 {
        match self.receiver.try_lock() {
            Ok(receiver) => receiver.len() as u64,
            Err(_) => 0,
        }
    }

    /// Close this end. Pending inbound frames can still be drained; further
    /// sends fail and the peer's receive stream ends.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if *state == LinkState::Closed {
            return;
        }
        *state = LinkState::Closed;
        tracing::debug!(
            local = self.config.local_id,
            peer = self.config.peer_id,
            "link closed"
        );
    }

    /// Current state of this end.
    pub async fn state(&self) -> LinkState {
        *self.state.lock().await
    }

    /// Snapshot of traffic counters.
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            msgs_sent: self.stats.msgs_sent.load(Ordering::Relaxed),
            msgs_received: self.stats.msgs_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
        }
    }
}
