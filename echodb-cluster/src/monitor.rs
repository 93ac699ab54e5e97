//! # Leader Monitor
//!
//! Follower-side liveness watch over a designated leader's registry record.
//! Polls on a timer and tracks the alive/dead edge so transitions are logged
//! once, not every tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::LeaderRegistry;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderMonitor {
    registry: Arc<LeaderRegistry>,
    leader_node_id: String,
    poll_interval: Duration,
    leader_alive: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeaderMonitor {
    pub fn new(registry: Arc<LeaderRegistry>, leader_node_id: impl Into<String>) -> Arc<Self> {
        Self::with_poll_interval(registry, leader_node_id, POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        registry: Arc<LeaderRegistry>,
        leader_node_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            leader_node_id: leader_node_id.into(),
            poll_interval,
            leader_alive: AtomicBool::new(false),
            shutdown_tx,
            worker: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut timer = interval(monitor.poll_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => monitor.check_leader_health().await,
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down leader monitor");
                        break;
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);

        info!(leader = %self.leader_node_id, "monitoring leader");
    }

    /// Result of the most recent poll.
    pub fn is_leader_alive(&self) -> bool {
        self.leader_alive.load(Ordering::Acquire)
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
    }

    pub async fn check_leader_health(&self) {
        let alive = match self.registry.leader_info(&self.leader_node_id).await {
            Ok(Some(record)) => !record.is_expired(),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "leader health check failed");
                false
            }
        };

        let was_alive = self.leader_alive.swap(alive, Ordering::AcqRel);
        if alive && !was_alive {
            info!(leader = %self.leader_node_id, "leader is alive");
        } else if !alive && was_alive {
            warn!(leader = %self.leader_node_id, "leader lease lost or expired");
        }
    }
}
