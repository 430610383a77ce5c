//! Backlog monitoring.
//!
//! A single periodic task samples the replay backlog gauge and emits
//! degraded/cleared events on threshold crossings. Only edges are reported;
//! a replica sitting above the threshold produces one event, not one per
//! tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::status::StatusEvent;

/// Settings for the backlog monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Number of queued-but-unreplayed updates above which the replica is
    /// considered degraded.
    pub degraded_threshold: u64,
    /// How often the backlog gauge is sampled.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 5000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Periodic sampler of a shared backlog gauge.
pub struct BacklogMonitor {
    handle: JoinHandle<()>,
}

impl BacklogMonitor {
    /// Spawn the monitor task. It runs until `events` has no receiver left.
    pub fn spawn(
        backlog: Arc<AtomicU64>,
        config: MonitorConfig,
        events: mpsc::Sender<StatusEvent>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut above = false;
            loop {
                ticker.tick().await;
                let depth = backlog.load(Ordering::Relaxed);
                let now_above = depth > config.degraded_threshold;
                if now_above == above {
                    continue;
                }
                above = now_above;
                let event = if now_above {
                    tracing::warn!(
                        backlog = depth,
                        threshold = config.degraded_threshold,
                        "replay backlog exceeded threshold"
                    );
                    StatusEvent::BacklogExceeded
                } else {
                    tracing::info!(backlog = depth, "replay backlog back under threshold");
                    StatusEvent::BacklogCleared
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        });
        Self { handle }
    }

    /// Stop the monitor task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for BacklogMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
