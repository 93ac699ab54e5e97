//! # Write-Ahead Log
//!
//! Durable record of mutations ahead of their flush into SSTs. Appends land
//! in an in-memory buffer; a flush (periodic or explicit) drains the buffer,
//! serializes every entry into one blob, and uploads it under
//! `wal/wal-<ms-timestamp>`.
//!
//! Durability contract: an acknowledged `append` is durable only once a
//! flush covering it returns. The write path accepts this because the
//! memtable holding the same row is equally volatile — recovery replays
//! whatever the last flush made durable.

pub mod codec;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use echodb_core::types::{now_millis, Row};
use echodb_core::{config::EchoConfig, metrics::Metrics, Error, Result};
use echodb_store::ObjectStore;

pub struct WriteAheadLog {
    store: Arc<dyn ObjectStore>,
    wal_prefix: String,
    flush_interval: Duration,
    /// Append buffer. Held only for push/swap; never across I/O.
    buffer: parking_lot::Mutex<Vec<Row>>,
    /// Serializes drain + PUT so concurrent flushes cannot reorder blobs.
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    /// Disambiguates blobs flushed within the same millisecond.
    flush_seq: AtomicU64,
    metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WriteAheadLog {
    pub fn new(config: &EchoConfig, store: Arc<dyn ObjectStore>, metrics: Metrics) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            wal_prefix: config.store.wal_prefix.clone(),
            flush_interval: config.wal.flush_interval,
            buffer: parking_lot::Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            flush_seq: AtomicU64::new(0),
            metrics,
            shutdown_tx,
            worker: parking_lot::Mutex::new(None),
        })
    }

    /// Buffer a PUT row. The caller supplies the sequence so WAL and memtable
    /// agree on ordering.
    pub fn append_put(&self, key: &str, value: Bytes, sequence: u64) -> Result<()> {
        self.append(Row::put(sequence, key, value))
    }

    /// Buffer a tombstone.
    pub fn append_tombstone(&self, key: &str, sequence: u64) -> Result<()> {
        self.append(Row::tombstone(sequence, key))
    }

    pub fn append(&self, row: Row) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed { component: "wal" });
        }
        self.buffer.lock().push(row);
        Ok(())
    }

    /// Drain the buffer into a single `wal/wal-<ms>` blob.
    ///
    /// On a failed upload the drained rows are put back at the head of the
    /// buffer, ahead of anything appended meanwhile, so sequence order is
    /// preserved for the retry.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let drained: Vec<Row> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let blob = codec::encode_rows(&drained);
        let blob_len = blob.len() as u64;
        let key = format!(
            "{}wal-{}-{}",
            self.wal_prefix,
            now_millis(),
            self.flush_seq.fetch_add(1, Ordering::Relaxed)
        );

        match self.store.put(&key, blob).await {
            Ok(()) => {
                self.metrics.record_wal_flush(blob_len);
                debug!(key = %key, entries = drained.len(), "wal flushed");
                Ok(())
            }
            Err(e) => {
                let mut buffer = self.buffer.lock();
                let mut restored = drained;
                restored.append(&mut buffer);
                *buffer = restored;
                Err(e)
            }
        }
    }

    /// WAL position recorded into checkpoints. The durable unit here is a
    /// timestamped blob, so the offset is the current wall clock in ms.
    pub fn current_offset(&self) -> u64 {
        now_millis()
    }

    /// Number of buffered, not-yet-flushed rows.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Spawn the periodic flush worker.
    pub fn start_periodic_flush(self: &Arc<Self>) {
        let wal = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut timer = interval(wal.flush_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = wal.flush().await {
                            warn!(error = %e, "periodic wal flush failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down wal flush worker");
                        break;
                    }
                }
            }
        });

        *self.worker.lock() = Some(handle);
    }

    /// Final flush, then stop the worker. Further appends fail with `Closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        if let Err(e) = self.flush().await {
            warn!(error = %e, pending = self.pending(), "final wal flush failed");
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
                warn!("wal flush worker did not stop in time");
            }
        }

        info!("wal closed");
    }
}
