//! # Leader Lease Election
//!
//! A single record at `leader/current` carries `(nodeId, leaseStart,
//! leaseExpiry)` as JSON. Candidates poll it; when it is absent or expired
//! they sleep a random jitter, PUT themselves, then read back to verify the
//! claim stuck. Under concurrent claims last-writer-wins decides; every
//! loser sees a foreign node id on the verification read and stays a
//! candidate.
//!
//! Winning fires the recovery callback (WAL replay) exactly once per
//! acquisition — the callback must be idempotent, and replay is.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use echodb_core::config::LeaseConfig;
use echodb_core::traits::Leadership;
use echodb_core::types::now_secs;
use echodb_core::{metrics::Metrics, Result};
use echodb_store::ObjectStore;

/// Object key holding the current leader record.
pub const LEADER_KEY: &str = "leader/current";

/// Upper bound on the pre-claim jitter.
const ACQUIRE_JITTER: Duration = Duration::from_millis(1000);
/// Settle delay between claiming and verifying.
const VERIFY_DELAY: Duration = Duration::from_millis(100);

/// Async hook fired on every acquisition; drives WAL replay.
pub type RecoveryCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// The JSON record stored at [`LEADER_KEY`], timestamps in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub node_id: String,
    pub lease_start: u64,
    pub lease_expiry: u64,
}

impl LeaderRecord {
    pub fn claim(node_id: &str, lease_duration: Duration) -> Self {
        let now = now_secs();
        Self {
            node_id: node_id.to_string(),
            lease_start: now,
            lease_expiry: now + lease_duration.as_secs(),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_secs() > self.lease_expiry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Contend for the lease.
    Candidate,
    /// Single-node deployment: leader without contention, heartbeats only.
    Designated,
    /// Watch the record, never attempt to acquire.
    Observer,
}

pub struct LeaderElection {
    store: Arc<dyn ObjectStore>,
    node_id: String,
    lease_duration: Duration,
    heartbeat_interval: Duration,
    election_interval: Duration,
    mode: Mode,
    is_leader: AtomicBool,
    running: AtomicBool,
    recovery_callback: parking_lot::Mutex<Option<RecoveryCallback>>,
    metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LeaderElection {
    /// Contending candidate.
    pub fn new(
        config: &LeaseConfig,
        store: Arc<dyn ObjectStore>,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_mode(config, store, node_id, Mode::Candidate)
    }

    /// Designated leader for single-node deployments.
    pub fn designated(
        config: &LeaseConfig,
        store: Arc<dyn ObjectStore>,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_mode(config, store, node_id, Mode::Designated)
    }

    /// Observer that never contends.
    pub fn observer(
        config: &LeaseConfig,
        store: Arc<dyn ObjectStore>,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_mode(config, store, node_id, Mode::Observer)
    }

    fn with_mode(
        config: &LeaseConfig,
        store: Arc<dyn ObjectStore>,
        node_id: impl Into<String>,
        mode: Mode,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            node_id: node_id.into(),
            lease_duration: config.duration,
            heartbeat_interval: config.heartbeat,
            election_interval: config.election_interval,
            mode,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            recovery_callback: parking_lot::Mutex::new(None),
            metrics: Metrics::new(),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Hook fired once per acquisition, before the first heartbeat refresh.
    pub fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self.recovery_callback.lock() = Some(callback);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Start the workers for this node's mode.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);

        match self.mode {
            Mode::Designated => {
                self.is_leader.store(true, Ordering::Release);
                self.metrics.record_election_won();
                info!(node = %self.node_id, "started as designated leader");
                self.spawn_heartbeat();
            }
            Mode::Candidate => {
                info!(node = %self.node_id, "started leader election");
                self.spawn_election();
                self.spawn_heartbeat();
            }
            Mode::Observer => {
                info!(node = %self.node_id, "started as observer");
                self.spawn_observer();
            }
        }
    }

    /// One candidate round: inspect the record, attempt a claim if it is
    /// absent or expired. Returns whether this node is the leader afterward.
    pub async fn try_acquire(&self) -> bool {
        match self.read_record().await {
            Some(record) if !record.is_expired() => {
                if record.node_id == self.node_id {
                    if !self.is_leader.swap(true, Ordering::AcqRel) {
                        info!(node = %self.node_id, "confirmed existing leadership");
                    }
                } else if self.is_leader.swap(false, Ordering::AcqRel) {
                    info!(
                        node = %self.node_id,
                        leader = %record.node_id,
                        "stepping back, another node holds the lease"
                    );
                }
            }
            _ => {
                if self.attempt_claim().await {
                    return true;
                }
                self.is_leader.store(false, Ordering::Release);
            }
        }
        self.is_leader()
    }

    /// Leader record currently on the store, if any.
    pub async fn current_leader(&self) -> Option<String> {
        self.read_record().await.map(|record| record.node_id)
    }

    /// Drop the lease: clear the local flag, delete the record.
    pub async fn step_down(&self) {
        self.is_leader.store(false, Ordering::Release);
        if let Err(e) = self.store.delete(LEADER_KEY).await {
            warn!(error = %e, "failed to delete leader record while stepping down");
        } else {
            info!(node = %self.node_id, "stepped down as leader");
        }
    }

    /// Stop the workers, releasing the lease if held.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if self.is_leader() {
            self.step_down().await;
        }

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                abort.abort();
                warn!("election worker did not stop in time");
            }
        }
    }

    async fn attempt_claim(&self) -> bool {
        // Random back-off shrinks the window where two candidates claim over
        // each other and both fail verification.
        let jitter_ms = rand::thread_rng().gen_range(0..ACQUIRE_JITTER.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        // The record may have appeared while this candidate slept.
        if let Some(existing) = self.read_record().await {
            if !existing.is_expired() {
                return false;
            }
        }

        let claim = LeaderRecord::claim(&self.node_id, self.lease_duration);
        let payload = match serde_json::to_vec(&claim) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode leader record");
                return false;
            }
        };
        if let Err(e) = self.store.put(LEADER_KEY, payload.into()).await {
            warn!(error = %e, "leader claim PUT failed");
            return false;
        }

        // Last-writer-wins: whoever's PUT landed last is on the record now.
        tokio::time::sleep(VERIFY_DELAY).await;
        match self.read_record().await {
            Some(record) if record.node_id == self.node_id => {
                self.is_leader.store(true, Ordering::Release);
                self.metrics.record_election_won();
                info!(node = %self.node_id, "claimed leadership");
                self.fire_recovery().await;
                true
            }
            Some(record) => {
                debug!(
                    node = %self.node_id,
                    winner = %record.node_id,
                    "lost claim verification"
                );
                false
            }
            None => false,
        }
    }

    async fn fire_recovery(&self) {
        let callback = self.recovery_callback.lock().clone();
        if let Some(callback) = callback {
            info!(node = %self.node_id, "running recovery for new leader");
            if let Err(e) = callback().await {
                error!(error = %e, "leader recovery failed");
            }
        }
    }

    async fn send_heartbeat(&self) {
        if !self.is_leader() || !self.running.load(Ordering::Acquire) {
            return;
        }

        let refreshed = LeaderRecord::claim(&self.node_id, self.lease_duration);
        let payload = match serde_json::to_vec(&refreshed) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode heartbeat record");
                return;
            }
        };

        if let Err(e) = self.store.put(LEADER_KEY, payload.into()).await {
            warn!(error = %e, "heartbeat failed, stepping back to candidate");
            self.is_leader.store(false, Ordering::Release);
            return;
        }

        // A concurrent usurper may have overwritten the refresh.
        match self.read_record().await {
            Some(record) if record.node_id != self.node_id => {
                warn!(
                    leader = %record.node_id,
                    "lease taken over, stepping back to candidate"
                );
                self.is_leader.store(false, Ordering::Release);
            }
            _ => {}
        }
    }

    async fn read_record(&self) -> Option<LeaderRecord> {
        match self.store.get(LEADER_KEY).await {
            Ok(Some(blob)) => match serde_json::from_slice(&blob) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "unreadable leader record, treating as absent");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read leader record");
                None
            }
        }
    }

    fn spawn_election(self: &Arc<Self>) {
        let election = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.workers.lock().push(tokio::spawn(async move {
            let mut timer = interval(election.election_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if election.running.load(Ordering::Acquire) {
                            election.try_acquire().await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down election worker");
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let election = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.workers.lock().push(tokio::spawn(async move {
            let mut timer = interval(election.heartbeat_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        election.send_heartbeat().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down heartbeat worker");
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_observer(self: &Arc<Self>) {
        let election = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.workers.lock().push(tokio::spawn(async move {
            let mut timer = interval(election.election_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match election.read_record().await {
                            Some(record) if !record.is_expired() => {
                                debug!(leader = %record.node_id, "observed live leader");
                            }
                            _ => debug!("observed no live leader"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down observer worker");
                        break;
                    }
                }
            }
        }));
    }
}

impl Leadership for LeaderElection {
    fn is_leader(&self) -> bool {
        LeaderElection::is_leader(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echodb_store::MemoryStore;

    fn fast_lease() -> LeaseConfig {
        LeaseConfig {
            duration: Duration::from_secs(30),
            heartbeat: Duration::from_millis(50),
            election_interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn record_json_uses_camel_case_fields() {
        let record = LeaderRecord {
            node_id: "node-1".into(),
            lease_start: 100,
            lease_expiry: 130,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"nodeId\":\"node-1\""));
        assert!(json.contains("\"leaseStart\":100"));
        assert!(json.contains("\"leaseExpiry\":130"));
        assert_eq!(serde_json::from_str::<LeaderRecord>(&json).unwrap(), record);
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let record = LeaderRecord::claim("n", Duration::from_secs(30));
        assert!(!record.is_expired());
        let stale = LeaderRecord {
            node_id: "n".into(),
            lease_start: 0,
            lease_expiry: 1,
        };
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn lone_candidate_acquires_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let election = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-a",
        );

        assert!(election.try_acquire().await);
        assert!(election.is_leader());
        assert_eq!(election.current_leader().await.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn second_candidate_defers_to_a_live_leader() {
        let store = Arc::new(MemoryStore::new());
        let first = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-a",
        );
        let second = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-b",
        );

        assert!(first.try_acquire().await);
        assert!(!second.try_acquire().await);
        assert!(!second.is_leader());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let stale = LeaderRecord {
            node_id: "dead-node".into(),
            lease_start: 0,
            lease_expiry: 1,
        };
        store
            .put(LEADER_KEY, serde_json::to_vec(&stale).unwrap().into())
            .await
            .unwrap();

        let election = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-a",
        );
        assert!(election.try_acquire().await);
        assert_eq!(election.current_leader().await.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn step_down_releases_the_record() {
        let store = Arc::new(MemoryStore::new());
        let first = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-a",
        );
        let second = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-b",
        );

        assert!(first.try_acquire().await);
        first.step_down().await;
        assert!(!first.is_leader());

        assert!(second.try_acquire().await);
        assert_eq!(second.current_leader().await.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn recovery_callback_fires_once_per_acquisition() {
        let store = Arc::new(MemoryStore::new());
        let election = LeaderElection::new(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "node-a",
        );

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        election.set_recovery_callback(Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, echodb_core::Error>(())
            })
        }));

        assert!(election.try_acquire().await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Still the leader: subsequent rounds confirm, they do not re-fire.
        assert!(election.try_acquire().await);
        assert!(election.try_acquire().await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Losing and re-winning the lease fires again.
        election.step_down().await;
        assert!(election.try_acquire().await);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn designated_leader_skips_contention() {
        let store = Arc::new(MemoryStore::new());
        let election = LeaderElection::designated(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "solo",
        );

        election.start();
        assert!(election.is_leader());

        // Heartbeats publish the record even though no election ran.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(election.current_leader().await.as_deref(), Some("solo"));
        election.stop().await;
        assert!(!election.is_leader());
    }

    #[tokio::test]
    async fn observer_never_acquires() {
        let store = Arc::new(MemoryStore::new());
        let observer = LeaderElection::observer(
            &fast_lease(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            "watcher",
        );

        observer.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!observer.is_leader());
        assert_eq!(observer.current_leader().await, None);
        observer.stop().await;
    }
}
