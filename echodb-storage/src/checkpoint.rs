//! # Checkpointer
//!
//! Ties WAL position to LSM flush progress: a persisted
//! `(last_flushed_seq, last_flushed_wal_offset, ts)` triple bounding how far
//! back replay must go. Every sequence at or below `last_flushed_seq` is
//! durable in some SST (or shadowed by a later entry at the same key), so
//! recovery skips it.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use echodb_core::types::now_millis;
use echodb_core::{metrics::Metrics, Error, Result};
use echodb_store::ObjectStore;

/// Object key holding the persisted checkpoint.
pub const CHECKPOINT_KEY: &str = "checkpoint/latest";

const ENCODED_LEN: usize = 24;

/// Persisted checkpoint state: three big-endian u64s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_flushed_seq: u64,
    pub last_flushed_wal_offset: u64,
    pub timestamp: u64,
}

impl Checkpoint {
    pub fn initial() -> Self {
        Self {
            last_flushed_seq: 0,
            last_flushed_wal_offset: 0,
            timestamp: now_millis(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = [0u8; ENCODED_LEN];
        BigEndian::write_u64(&mut buf[0..8], self.last_flushed_seq);
        BigEndian::write_u64(&mut buf[8..16], self.last_flushed_wal_offset);
        BigEndian::write_u64(&mut buf[16..24], self.timestamp);
        Bytes::copy_from_slice(&buf)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() != ENCODED_LEN {
            return Err(Error::corrupt(
                CHECKPOINT_KEY,
                format!("expected {}-byte checkpoint, got {} bytes", ENCODED_LEN, blob.len()),
            ));
        }
        Ok(Self {
            last_flushed_seq: BigEndian::read_u64(&blob[0..8]),
            last_flushed_wal_offset: BigEndian::read_u64(&blob[8..16]),
            timestamp: BigEndian::read_u64(&blob[16..24]),
        })
    }
}

pub struct Checkpointer {
    store: Arc<dyn ObjectStore>,
    persist_interval: Duration,
    /// Held during update and persist, per the lock hierarchy.
    current: tokio::sync::Mutex<Checkpoint>,
    metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn ObjectStore>, persist_interval: Duration, metrics: Metrics) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            persist_interval,
            current: tokio::sync::Mutex::new(Checkpoint::initial()),
            metrics,
            shutdown_tx,
            worker: parking_lot::Mutex::new(None),
        })
    }

    /// Install the persisted checkpoint if one exists, then start the
    /// periodic persist worker.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.store.get(CHECKPOINT_KEY).await? {
            Some(blob) => {
                let loaded = Checkpoint::decode(&blob)?;
                info!(
                    sequence = loaded.last_flushed_seq,
                    offset = loaded.last_flushed_wal_offset,
                    "loaded checkpoint"
                );
                *self.current.lock().await = loaded;
            }
            None => {
                info!("no existing checkpoint, starting from the beginning");
            }
        }

        let checkpointer = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut timer = interval(checkpointer.persist_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let current = *checkpointer.current.lock().await;
                        if let Err(e) = checkpointer.persist(&current).await {
                            warn!(error = %e, "periodic checkpoint persist failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down checkpoint worker");
                        break;
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);

        Ok(())
    }

    /// Advance the checkpoint. Non-advancing sequences are ignored, which
    /// makes concurrent flush completions safe to report in any order.
    pub async fn update(&self, last_flushed_seq: u64, wal_offset: u64) -> Result<()> {
        let mut current = self.current.lock().await;
        if last_flushed_seq <= current.last_flushed_seq {
            return Ok(());
        }

        let updated = Checkpoint {
            last_flushed_seq,
            last_flushed_wal_offset: wal_offset,
            timestamp: now_millis(),
        };
        debug!(
            old_seq = current.last_flushed_seq,
            new_seq = last_flushed_seq,
            "advancing checkpoint"
        );
        *current = updated;

        // Persist while still holding the lock so a concurrent update cannot
        // write an older checkpoint after a newer one.
        self.persist(&updated).await
    }

    pub async fn current(&self) -> Checkpoint {
        *self.current.lock().await
    }

    /// Final persist, then stop the worker. Persist failure is logged; stop
    /// proceeds regardless.
    pub async fn stop(&self) {
        let current = *self.current.lock().await;
        if let Err(e) = self.persist(&current).await {
            warn!(error = %e, "final checkpoint persist failed");
        }

        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                abort.abort();
                warn!("checkpoint worker did not stop in time");
            }
        }
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.put(CHECKPOINT_KEY, checkpoint.encode()).await?;
        self.metrics.record_checkpoint();
        debug!(
            sequence = checkpoint.last_flushed_seq,
            offset = checkpoint.last_flushed_wal_offset,
            "checkpoint persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echodb_store::MemoryStore;

    fn checkpointer(store: Arc<MemoryStore>) -> Arc<Checkpointer> {
        Checkpointer::new(
            store as Arc<dyn ObjectStore>,
            Duration::from_secs(300),
            Metrics::new(),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let checkpoint = Checkpoint {
            last_flushed_seq: 42,
            last_flushed_wal_offset: 7,
            timestamp: 1_700_000_000_000,
        };
        assert_eq!(Checkpoint::decode(&checkpoint.encode()).unwrap(), checkpoint);
    }

    #[test]
    fn wrong_length_blob_is_corrupt() {
        assert!(matches!(
            Checkpoint::decode(b"short"),
            Err(Error::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn update_advances_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let checkpointer = checkpointer(Arc::clone(&store));
        checkpointer.start().await.unwrap();

        checkpointer.update(10, 111).await.unwrap();
        assert_eq!(checkpointer.current().await.last_flushed_seq, 10);

        let blob = store.get(CHECKPOINT_KEY).await.unwrap().unwrap();
        assert_eq!(Checkpoint::decode(&blob).unwrap().last_flushed_seq, 10);
        checkpointer.stop().await;
    }

    #[tokio::test]
    async fn non_advancing_updates_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let checkpointer = checkpointer(Arc::clone(&store));
        checkpointer.start().await.unwrap();

        checkpointer.update(10, 1).await.unwrap();
        checkpointer.update(5, 2).await.unwrap();
        checkpointer.update(10, 3).await.unwrap();

        let current = checkpointer.current().await;
        assert_eq!(current.last_flushed_seq, 10);
        assert_eq!(current.last_flushed_wal_offset, 1);
        checkpointer.stop().await;
    }

    #[tokio::test]
    async fn restart_reloads_persisted_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        {
            let first = checkpointer(Arc::clone(&store));
            first.start().await.unwrap();
            first.update(77, 5).await.unwrap();
            first.stop().await;
        }

        let second = checkpointer(store);
        second.start().await.unwrap();
        assert_eq!(second.current().await.last_flushed_seq, 77);
        second.stop().await;
    }
}
