//! # Sequence Allocator
//!
//! Single source of truth for mutation ordering: a process-wide atomic
//! counter handing out strictly increasing 64-bit sequences, persisted to
//! the object store in batches.
//!
//! Crash safety comes from batch reservation rather than per-allocation
//! persistence: the persisted value is always at or above the last batch
//! boundary, and a restart skips a full batch past it, so no sequence is
//! ever handed out twice — at the cost of burning up to one batch of
//! sequence space per crash.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use echodb_core::{Error, Result};
use echodb_store::ObjectStore;

/// Object key holding the persisted counter (8-byte big-endian u64).
pub const SEQUENCE_KEY: &str = "system/sequence/global";

/// Sequences reserved ahead of the persisted value.
const BATCH_SIZE: u64 = 1000;
/// Distance from the batch edge at which an eager persist is requested.
const EAGER_PERSIST_MARGIN: u64 = 100;
/// Background persistence cadence.
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// Global monotonic sequence allocator.
///
/// Exactly one instance per process should point at a given store key; the
/// top-level database handle owns it.
pub struct SequenceAllocator {
    store: Arc<dyn ObjectStore>,
    current: AtomicU64,
    last_persisted: AtomicU64,
    closed: AtomicBool,
    persist_tx: mpsc::UnboundedSender<()>,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SequenceAllocator {
    /// Load the persisted counter and start handing out from one batch past
    /// it. Spawns the background persistence worker.
    pub async fn new(store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        let last_persisted = Self::load_persisted(store.as_ref()).await?;
        let start = last_persisted + BATCH_SIZE;

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let allocator = Arc::new(Self {
            store,
            current: AtomicU64::new(start),
            last_persisted: AtomicU64::new(last_persisted),
            closed: AtomicBool::new(false),
            persist_tx,
            shutdown_tx,
            worker: parking_lot::Mutex::new(None),
        });

        info!(
            last_persisted,
            start, "sequence allocator initialized"
        );

        let handle = tokio::spawn(Self::persistence_loop(
            Arc::clone(&allocator),
            persist_rx,
            shutdown_rx,
        ));
        *allocator.worker.lock() = Some(handle);

        Ok(allocator)
    }

    /// Hand out the next sequence. Never blocks on the store.
    pub fn next(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed {
                component: "sequence allocator",
            });
        }

        let seq = self.current.fetch_add(1, Ordering::SeqCst) + 1;

        // Approaching the edge of the reserved batch: ask the worker to
        // persist now rather than waiting for the timer.
        let last_persisted = self.last_persisted.load(Ordering::Acquire);
        if seq.saturating_sub(last_persisted) > BATCH_SIZE - EAGER_PERSIST_MARGIN {
            let _ = self.persist_tx.send(());
        }

        Ok(seq)
    }

    /// Highest sequence handed out so far.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Persist the counter and stop the worker. Persist failures are logged:
    /// the batch reservation bounds the damage and shutdown proceeds.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        if let Err(e) = self.persist().await {
            error!(error = %e, "final sequence persist failed");
        }

        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                abort.abort();
                warn!("sequence persistence worker did not stop in time");
            }
        }

        info!(final_sequence = self.current(), "sequence allocator closed");
    }

    async fn load_persisted(store: &dyn ObjectStore) -> Result<u64> {
        match store.get(SEQUENCE_KEY).await {
            Ok(Some(blob)) => {
                if blob.len() != 8 {
                    return Err(Error::corrupt(
                        SEQUENCE_KEY,
                        format!("expected 8-byte sequence blob, got {} bytes", blob.len()),
                    ));
                }
                Ok(BigEndian::read_u64(&blob))
            }
            Ok(None) => Ok(0),
            Err(e) => {
                warn!(error = %e, "failed to load persisted sequence, starting from 0");
                Ok(0)
            }
        }
    }

    async fn persist(&self) -> Result<()> {
        let current = self.current.load(Ordering::Acquire);
        let mut blob = [0u8; 8];
        BigEndian::write_u64(&mut blob, current);

        self.store
            .put(SEQUENCE_KEY, Bytes::copy_from_slice(&blob))
            .await?;
        self.last_persisted.store(current, Ordering::Release);
        debug!(sequence = current, "persisted sequence");
        Ok(())
    }

    async fn persistence_loop(
        allocator: Arc<Self>,
        mut persist_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut timer = interval(PERSIST_INTERVAL);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the cadence starts one
        // interval after startup.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                request = persist_rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    // Coalesce a burst of eager requests into one persist.
                    while persist_rx.try_recv().is_ok() {}
                }
                _ = shutdown_rx.changed() => {
                    debug!("shutting down sequence persistence worker");
                    break;
                }
            }

            if let Err(e) = allocator.persist().await {
                // Counters keep advancing in memory; the next crash re-skips
                // a batch, so continuing is safe.
                error!(error = %e, "sequence persistence failed");
            }
        }
    }
}
