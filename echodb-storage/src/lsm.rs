//! # LSM Coordinator
//!
//! Ties the memtable tier to the SST tiers and keeps the checkpoint honest.
//!
//! ```text
//!   put/delete ──> active memtable ──rotate──> immutable list
//!                                                   │ flush
//!                                                   ▼
//!                        L0 (newest first) <── data/l0/*.{data,index}
//!                                                   │ compaction (L0+L1 merge)
//!                                                   ▼
//!                                   L1..Ln (full tables per level)
//! ```
//!
//! Reads probe newest-to-oldest: active, immutables (newest first), L0
//! (newest first), then L1..Ln in ascending level order. A tombstone found
//! in any memtable answers "not found" immediately — older levels must not
//! resurrect the key.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use echodb_core::types::{now_millis, RowKind};
use echodb_core::{config::EchoConfig, metrics::Metrics, Result};
use echodb_store::ObjectStore;

use crate::cache::CacheManager;
use crate::checkpoint::Checkpointer;
use crate::memtable::Memtable;
use crate::sstable::{index_interval_for_level, SsTable, SsTableBuilder};
use crate::wal::WriteAheadLog;

/// Highest level registered during startup recovery.
const MAX_RECOVERED_LEVEL: u32 = 7;

struct TreeState {
    active: Arc<Memtable>,
    /// Frozen tables awaiting flush, oldest first.
    immutable: Vec<Arc<Memtable>>,
    /// L0 tables, newest first. Tables here may overlap in key range.
    l0: Vec<Arc<SsTable>>,
    /// Levels 1.. produced by compaction, probed in ascending order.
    levels: BTreeMap<u32, Vec<Arc<SsTable>>>,
    /// Every table id ever registered, including ones compacted away.
    /// Discovery consults this so it never resurrects replaced tables
    /// whose blobs are still in the store.
    known_tables: HashSet<String>,
}

pub struct LsmTree {
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheManager>,
    checkpointer: Arc<Checkpointer>,
    /// Consulted for the WAL position recorded into checkpoints at flush.
    wal: Arc<WriteAheadLog>,
    metrics: Metrics,
    data_prefix: String,
    memtable_max_bytes: u64,
    max_immutable: usize,
    l0_trigger: usize,
    compaction_interval: Duration,
    discovery_interval: Duration,
    /// Monotonic table-id clock: ids must sort in publication order even
    /// when two flushes land in the same millisecond, or recovery would
    /// probe same-stamp tables in arbitrary order.
    table_clock: AtomicU64,
    state: tokio::sync::RwLock<TreeState>,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LsmTree {
    pub fn new(
        config: &EchoConfig,
        store: Arc<dyn ObjectStore>,
        cache: Arc<CacheManager>,
        checkpointer: Arc<Checkpointer>,
        wal: Arc<WriteAheadLog>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            cache,
            checkpointer,
            wal,
            metrics,
            data_prefix: config.store.data_prefix.clone(),
            memtable_max_bytes: config.memtable.max_bytes,
            max_immutable: config.memtable.max_immutable,
            l0_trigger: config.compaction.l0_trigger,
            compaction_interval: config.compaction.interval,
            discovery_interval: config.compaction.discovery_interval,
            table_clock: AtomicU64::new(0),
            state: tokio::sync::RwLock::new(TreeState {
                active: Arc::new(Memtable::new()),
                immutable: Vec::new(),
                l0: Vec::new(),
                levels: BTreeMap::new(),
                known_tables: HashSet::new(),
            }),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Apply a PUT at the given sequence, rotating the memtable first if it
    /// is over the byte threshold.
    pub async fn put_with_seq(&self, key: &str, value: Bytes, sequence: u64) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.active.approx_bytes() < self.memtable_max_bytes {
                state.active.put(key, value, sequence);
                return Ok(());
            }
        }
        self.rotate().await?;
        let state = self.state.read().await;
        state.active.put(key, value, sequence);
        Ok(())
    }

    /// Apply a tombstone at the given sequence.
    pub async fn delete_with_seq(&self, key: &str, sequence: u64) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.active.approx_bytes() < self.memtable_max_bytes {
                state.active.delete(key, sequence);
                return Ok(());
            }
        }
        self.rotate().await?;
        let state = self.state.read().await;
        state.active.delete(key, sequence);
        Ok(())
    }

    /// Probe newest-to-oldest and return on the first hit. A tombstone hit
    /// short-circuits with `None` even when older levels still hold the key.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let state = self.state.read().await;

        if let Some(row) = state.active.get(key) {
            return Ok(row.value);
        }
        for memtable in state.immutable.iter().rev() {
            if let Some(row) = memtable.get(key) {
                return Ok(row.value);
            }
        }
        for table in &state.l0 {
            if let Some(entry) = table.get(key).await? {
                return Ok(entry.into_value());
            }
        }
        for tables in state.levels.values() {
            for table in tables {
                if let Some(entry) = table.get(key).await? {
                    return Ok(entry.into_value());
                }
            }
        }

        Ok(None)
    }

    /// Freeze the active memtable and flush every frozen table to L0.
    /// Holding the tree in write mode for the duration freezes all writers,
    /// which is what makes the checkpoint update at the end sound.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut TreeState) -> Result<()> {
        if !state.active.is_empty() {
            let frozen = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
            state.immutable.push(frozen);
        }

        let mut max_seq_flushed = 0u64;
        while let Some(memtable) = state.immutable.first().cloned() {
            if memtable.is_empty() {
                state.immutable.remove(0);
                continue;
            }

            let table = self.publish_memtable(&memtable).await?;
            max_seq_flushed = max_seq_flushed.max(memtable.max_seq());

            info!(
                table = table.table_id(),
                entries = memtable.entry_count(),
                "flushed memtable to sstable"
            );
            state.known_tables.insert(table.table_id().to_string());
            state.l0.insert(0, table);
            state.immutable.remove(0);
            self.metrics.record_flush();
        }

        // The SSTs covering these sequences are durably in the store by now;
        // only then may replay skip them.
        if max_seq_flushed > 0 {
            self.checkpointer
                .update(max_seq_flushed, self.wal.current_offset())
                .await?;
        }

        Ok(())
    }

    /// Wall-clock milliseconds, bumped past the previous stamp so table ids
    /// sort in publication order.
    fn next_table_timestamp(&self) -> u64 {
        let now = now_millis();
        loop {
            let prev = self.table_clock.load(Ordering::Acquire);
            let next = now.max(prev + 1);
            if self
                .table_clock
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    async fn publish_memtable(&self, memtable: &Memtable) -> Result<Arc<SsTable>> {
        let table_id = format!("sstable-{}-{}", self.next_table_timestamp(), Uuid::new_v4());
        let data_key = format!("{}l0/{}.data", self.data_prefix, table_id);
        let index_key = format!("{}l0/{}.index", self.data_prefix, table_id);

        // Tombstones flush too: the published table must keep shadowing
        // older tables that still hold the deleted keys.
        let mut builder = SsTableBuilder::new(index_interval_for_level(0));
        for row in memtable.rows() {
            match row.kind {
                RowKind::Put => builder.add(row.key, row.value.unwrap_or_default()),
                RowKind::Delete => builder.add_tombstone(row.key),
            }
        }
        let blobs = builder.build()?;

        self.store.put(&data_key, blobs.data).await?;
        self.store.put(&index_key, blobs.index).await?;

        Ok(Arc::new(SsTable::new(
            table_id,
            data_key,
            index_key,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
        )))
    }

    /// Merge all of L0 with L1 into a single L1 table once L0 grows past the
    /// trigger. The merge reads outside the tree lock; only the in-memory
    /// swap takes it in write mode, so reads keep flowing during the fold.
    pub async fn maybe_compact(&self) -> Result<bool> {
        let (l0_snapshot, l1_snapshot) = {
            let state = self.state.read().await;
            if state.l0.len() <= self.l0_trigger {
                return Ok(false);
            }
            (
                state.l0.clone(),
                state.levels.get(&1).cloned().unwrap_or_default(),
            )
        };

        info!(
            l0 = l0_snapshot.len(),
            l1 = l1_snapshot.len(),
            "compacting L0 into L1"
        );

        // Fold oldest data first so the newest write wins: existing L1, then
        // L0 from oldest to newest (the list is newest-first). Tombstones are
        // folded like values and retained in the merged table — nothing is
        // dropped at any level.
        let mut builder = SsTableBuilder::new(index_interval_for_level(1));
        for table in &l1_snapshot {
            for (key, entry) in table.rows().await? {
                builder.add_entry(key, entry);
            }
        }
        for table in l0_snapshot.iter().rev() {
            for (key, entry) in table.rows().await? {
                builder.add_entry(key, entry);
            }
        }

        let table_id = format!("sstable-l1-{}", self.next_table_timestamp());
        let data_key = format!("{}l1/{}.data", self.data_prefix, table_id);
        let index_key = format!("{}l1/{}.index", self.data_prefix, table_id);

        let blobs = builder.build()?;
        self.store.put(&data_key, blobs.data).await?;
        self.store.put(&index_key, blobs.index).await?;

        let merged = Arc::new(SsTable::new(
            table_id.clone(),
            data_key,
            index_key,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
        ));

        {
            let mut state = self.state.write().await;
            let compacted: HashSet<&str> =
                l0_snapshot.iter().map(|t| t.table_id()).collect();
            state.l0.retain(|t| !compacted.contains(t.table_id()));
            state.levels.insert(1, vec![merged]);
            state.known_tables.insert(table_id);
            // Replaced blobs stay in the store; sweeping them is future work.
        }

        self.metrics.record_compaction();
        Ok(true)
    }

    /// Register L0 tables published by the leader that this node has not
    /// seen yet. This is how followers converge without running the write
    /// path.
    pub async fn discover(&self) -> Result<usize> {
        let prefix = format!("{}l0/", self.data_prefix);
        let keys = self.store.list(&prefix).await?;

        let candidates: Vec<(String, String)> = {
            let state = self.state.read().await;
            keys.iter()
                .filter(|key| key.ends_with(".data"))
                .filter_map(|key| {
                    let table_id = table_id_from_key(key);
                    (!state.known_tables.contains(&table_id))
                        .then(|| (table_id, key.clone()))
                })
                .collect()
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write().await;
        let mut added = 0usize;
        // Listing order is ascending by name (so by timestamp); inserting
        // each at the front leaves the newest table frontmost.
        for (table_id, data_key) in candidates {
            if !state.known_tables.insert(table_id.clone()) {
                continue;
            }
            let index_key = index_key_for(&data_key);
            debug!(table = %table_id, "discovered sstable");
            state.l0.insert(
                0,
                Arc::new(SsTable::new(
                    table_id,
                    data_key,
                    index_key,
                    Arc::clone(&self.store),
                    Arc::clone(&self.cache),
                )),
            );
            added += 1;
        }

        if added > 0 {
            self.metrics.record_discovery(added as u64);
            info!(added, "registered discovered sstables");
        }
        Ok(added)
    }

    /// Startup registration of every published table, L0 and L1..L7.
    /// Metadata only — no blob is read until a query touches it.
    pub async fn recover(&self) -> Result<()> {
        let mut state = self.state.write().await;

        let l0_keys = self.store.list(&format!("{}l0/", self.data_prefix)).await?;
        for key in l0_keys.iter().filter(|k| k.ends_with(".data")) {
            let table_id = table_id_from_key(key);
            if state.known_tables.insert(table_id.clone()) {
                state.l0.insert(
                    0,
                    Arc::new(SsTable::new(
                        table_id,
                        key.clone(),
                        index_key_for(key),
                        Arc::clone(&self.store),
                        Arc::clone(&self.cache),
                    )),
                );
            }
        }

        for level in 1..=MAX_RECOVERED_LEVEL {
            let keys = self
                .store
                .list(&format!("{}l{}/", self.data_prefix, level))
                .await?;
            let mut tables = Vec::new();
            for key in keys.iter().filter(|k| k.ends_with(".data")) {
                let table_id = table_id_from_key(key);
                if state.known_tables.insert(table_id.clone()) {
                    tables.push(Arc::new(SsTable::new(
                        table_id,
                        key.clone(),
                        index_key_for(key),
                        Arc::clone(&self.store),
                        Arc::clone(&self.cache),
                    )));
                }
            }
            if !tables.is_empty() {
                state.levels.insert(level, tables);
            }
        }

        info!(
            l0 = state.l0.len(),
            levels = state.levels.len(),
            "registered existing sstables"
        );
        Ok(())
    }

    /// Spawn the compaction and discovery workers.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut workers = self.workers.lock();

        let tree = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move {
            let mut timer = interval(tree.compaction_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = tree.maybe_compact().await {
                            error!(error = %e, "compaction failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down compaction worker");
                        break;
                    }
                }
            }
        }));

        let tree = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move {
            let mut timer = interval(tree.discovery_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = tree.discover().await {
                            warn!(error = %e, "sstable discovery failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("shutting down discovery worker");
                        break;
                    }
                }
            }
        }));
    }

    /// Final flush, then stop the workers. Flush failure is logged; shutdown
    /// proceeds so the process can exit.
    pub async fn close(&self) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "final lsm flush failed");
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
                warn!("lsm worker did not stop in time");
            }
        }
    }

    async fn rotate(&self) -> Result<()> {
        let mut state = self.state.write().await;
        // Another writer may have rotated while this one waited.
        if state.active.approx_bytes() < self.memtable_max_bytes {
            return Ok(());
        }

        let frozen = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
        state.immutable.push(frozen);
        self.metrics.record_rotation();
        debug!(immutable = state.immutable.len(), "rotated memtable");

        if state.immutable.len() >= self.max_immutable {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn active_memtable_bytes(&self) -> u64 {
        self.state.read().await.active.approx_bytes()
    }

    /// Active plus immutable tables currently held in memory.
    pub async fn memtable_count(&self) -> usize {
        let state = self.state.read().await;
        1 + state.immutable.len()
    }

    pub async fn l0_table_count(&self) -> usize {
        self.state.read().await.l0.len()
    }

    pub async fn level_table_count(&self, level: u32) -> usize {
        self.state
            .read()
            .await
            .levels
            .get(&level)
            .map(|tables| tables.len())
            .unwrap_or(0)
    }
}

fn table_id_from_key(key: &str) -> String {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    file_name
        .strip_suffix(".data")
        .unwrap_or(file_name)
        .to_string()
}

fn index_key_for(data_key: &str) -> String {
    match data_key.strip_suffix(".data") {
        Some(stem) => format!("{}.index", stem),
        None => format!("{}.index", data_key),
    }
}
