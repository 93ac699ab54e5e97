//! # EchoDb
//!
//! The top-level database handle: one sequence allocator, one WAL, one LSM
//! tree, one checkpointer, one cache, all over one object store.
//!
//! Every mutation takes a single sequence and applies it to the WAL and the
//! memtable, so replay and the live tree always agree on ordering. Reads go
//! cache → LSM. Mutations on a node that does not hold the lease fail with
//! `NotLeader`; a database without a leadership provider attached acts as an
//! embedded single-node leader.
//!
//! Lock modes: `put`/`get`/`delete` hold the database lock in read mode (the
//! memtable is internally synchronized, so writers run concurrently);
//! `flush` and `close` take it in write mode to freeze the world.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::info;

use echodb_core::traits::Leadership;
use echodb_core::{config::EchoConfig, metrics::Metrics, Error, Result};
use echodb_store::ObjectStore;

use crate::cache::CacheManager;
use crate::checkpoint::Checkpointer;
use crate::lsm::LsmTree;
use crate::recovery::WalRecovery;
use crate::sequence::SequenceAllocator;
use crate::wal::WriteAheadLog;

pub struct EchoDb {
    config: EchoConfig,
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheManager>,
    sequence: Arc<SequenceAllocator>,
    wal: Arc<WriteAheadLog>,
    lsm: Arc<LsmTree>,
    checkpointer: Arc<Checkpointer>,
    metrics: Metrics,
    /// Read mode for key operations, write mode for flush/close.
    db_lock: RwLock<()>,
    leadership: parking_lot::RwLock<Option<Arc<dyn Leadership>>>,
    closed: AtomicBool,
}

impl EchoDb {
    /// Open the database: register existing SSTs, replay the WAL past the
    /// checkpoint, then start the background workers.
    pub async fn open(config: EchoConfig, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        let metrics = Metrics::new();
        let cache = Arc::new(CacheManager::new(&config.cache, metrics.clone()));
        let sequence = SequenceAllocator::new(Arc::clone(&store)).await?;
        let checkpointer = Checkpointer::new(
            Arc::clone(&store),
            config.checkpoint.interval,
            metrics.clone(),
        );
        let wal = WriteAheadLog::new(&config, Arc::clone(&store), metrics.clone());
        let lsm = LsmTree::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&checkpointer),
            Arc::clone(&wal),
            metrics.clone(),
        );

        // Checkpoint first: recovery is anchored on it.
        checkpointer.start().await?;
        lsm.recover().await?;

        let db = Arc::new(Self {
            config,
            store,
            cache,
            sequence,
            wal,
            lsm,
            checkpointer,
            metrics,
            db_lock: RwLock::new(()),
            leadership: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        db.recover_from_wal().await?;

        db.wal.start_periodic_flush();
        db.lsm.start_background_tasks();

        info!("echodb opened");
        Ok(db)
    }

    /// Attach the leadership provider consulted by the write path.
    pub fn set_leadership(&self, leadership: Arc<dyn Leadership>) {
        *self.leadership.write() = Some(leadership);
    }

    pub fn is_leader(&self) -> bool {
        self.leadership
            .read()
            .as_ref()
            .map(|l| l.is_leader())
            .unwrap_or(true)
    }

    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.check_leader()?;
        let _guard = self.db_lock.read().await;

        let value = value.into();
        // One sequence for WAL and memtable: replay must agree with the tree.
        let sequence = self.sequence.next()?;
        self.wal.append_put(key, value.clone(), sequence)?;
        self.lsm.put_with_seq(key, value, sequence).await?;

        // The read path repopulates; a stale cached value must not survive
        // the write.
        self.cache.evict(key);
        self.metrics.record_put();
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_open()?;
        let _guard = self.db_lock.read().await;
        self.metrics.record_get();

        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let result = self.lsm.get(key).await?;
        if let Some(value) = &result {
            self.cache.put(key, value.clone());
        }
        Ok(result)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.check_leader()?;
        let _guard = self.db_lock.read().await;

        let sequence = self.sequence.next()?;
        self.wal.append_tombstone(key, sequence)?;
        self.lsm.delete_with_seq(key, sequence).await?;

        self.cache.evict(key);
        self.metrics.record_delete();
        Ok(())
    }

    /// Freeze all writers, force the WAL to the store, and flush every
    /// memtable to L0.
    pub async fn flush(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.db_lock.write().await;

        self.wal.flush().await?;
        self.lsm.flush().await?;
        Ok(())
    }

    /// Checkpoint-anchored WAL replay. Runs on open and again whenever this
    /// node wins leadership; replay is idempotent so both are safe.
    pub async fn recover_from_wal(&self) -> Result<u64> {
        let recovery = WalRecovery::new(
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.checkpointer),
            Arc::clone(&self.lsm),
            self.metrics.clone(),
        );
        recovery.recover().await
    }

    /// Drain pending writes, stop the workers, persist the final sequence
    /// and checkpoint. Idempotent; failures are logged and shutdown keeps
    /// going.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.db_lock.write().await;

        self.wal.close().await;
        self.lsm.close().await;
        self.checkpointer.stop().await;
        self.sequence.close().await;
        self.cache.clear();

        info!("echodb closed");
        Ok(())
    }

    /// Run a compaction round now instead of waiting for the timer. Returns
    /// whether anything was merged.
    pub async fn compact(&self) -> Result<bool> {
        self.check_open()?;
        self.lsm.maybe_compact().await
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Byte footprint of the active memtable (admin surface).
    pub async fn memtable_bytes(&self) -> u64 {
        self.lsm.active_memtable_bytes().await
    }

    pub async fn l0_table_count(&self) -> usize {
        self.lsm.l0_table_count().await
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed {
                component: "database",
            });
        }
        Ok(())
    }

    fn check_leader(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echodb_store::MemoryStore;

    struct NeverLeader;
    impl Leadership for NeverLeader {
        fn is_leader(&self) -> bool {
            false
        }
    }

    async fn open_db(store: Arc<MemoryStore>) -> Arc<EchoDb> {
        EchoDb::open(EchoConfig::default(), store as Arc<dyn ObjectStore>)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let db = open_db(store).await;

        db.put("a", Bytes::from_static(b"1")).await.unwrap();
        db.put("b", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(db.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(db.get("c").await.unwrap(), None);

        db.delete("a").await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), None);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_then_delete_reads_none() {
        let store = Arc::new(MemoryStore::new());
        let db = open_db(store).await;

        db.put("k", Bytes::from_static(b"v1")).await.unwrap();
        db.put("k", Bytes::from_static(b"v2")).await.unwrap();
        db.delete("k").await.unwrap();

        assert_eq!(db.get("k").await.unwrap(), None);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn cached_reads_do_not_go_stale_after_overwrite() {
        let store = Arc::new(MemoryStore::new());
        let db = open_db(store).await;

        db.put("k", Bytes::from_static(b"v1")).await.unwrap();
        // Populate the cache.
        assert_eq!(db.get("k").await.unwrap(), Some(Bytes::from_static(b"v1")));
        db.put("k", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(db.get("k").await.unwrap(), Some(Bytes::from_static(b"v2")));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_leader_rejects_writes_but_serves_reads() {
        let store = Arc::new(MemoryStore::new());
        let db = open_db(store).await;

        db.put("k", Bytes::from_static(b"v")).await.unwrap();
        db.set_leadership(Arc::new(NeverLeader));

        assert!(matches!(
            db.put("k2", Bytes::from_static(b"v")).await,
            Err(Error::NotLeader)
        ));
        assert!(matches!(db.delete("k").await, Err(Error::NotLeader)));
        assert_eq!(db.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn operations_after_close_fail_fast() {
        let store = Arc::new(MemoryStore::new());
        let db = open_db(store).await;
        db.close().await.unwrap();

        assert!(matches!(
            db.put("k", Bytes::new()).await,
            Err(Error::Closed { .. })
        ));
        assert!(matches!(db.get("k").await, Err(Error::Closed { .. })));
        // Closing again is a no-op.
        db.close().await.unwrap();
    }
}
