//! # Memtable
//!
//! In-memory sorted buffer for recent writes, backed by a concurrent skip
//! list so writers never block readers. A later row replaces the earlier one
//! at the same key; tombstones occupy space and shadow older values until
//! the table is flushed.
//!
//! Lifecycle: *active* (writable) → *immutable* (frozen, pending flush) →
//! discarded. The LSM coordinator owns rotation; the table itself only
//! tracks its contents, its approximate byte footprint, and the highest
//! sequence it has absorbed.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use echodb_core::types::{Row, RowKind};

pub struct Memtable {
    rows: SkipMap<String, Row>,
    /// Approximate memory footprint: subtract the replaced entry, add the new.
    approx_bytes: AtomicU64,
    /// Highest sequence ever inserted; monotonic for the table's lifetime.
    max_seq: AtomicU64,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            rows: SkipMap::new(),
            approx_bytes: AtomicU64::new(0),
            max_seq: AtomicU64::new(0),
        }
    }

    pub fn put(&self, key: &str, value: Bytes, sequence: u64) {
        self.insert(Row::put(sequence, key, value));
    }

    pub fn delete(&self, key: &str, sequence: u64) {
        self.insert(Row::tombstone(sequence, key));
    }

    fn insert(&self, row: Row) {
        let old_size = self
            .rows
            .get(&row.key)
            .map(|entry| entry.value().approx_size());

        self.max_seq.fetch_max(row.sequence, Ordering::AcqRel);
        let new_size = row.approx_size();
        self.rows.insert(row.key.clone(), row);

        if let Some(old) = old_size {
            self.approx_bytes.fetch_sub(old, Ordering::AcqRel);
        }
        self.approx_bytes.fetch_add(new_size, Ordering::AcqRel);
    }

    /// Latest row for `key`, tombstones included. Callers that only want live
    /// values should check [`Row::is_tombstone`] — the LSM read path relies
    /// on seeing tombstones to short-circuit older levels.
    pub fn get(&self, key: &str) -> Option<Row> {
        self.rows.get(key).map(|entry| entry.value().clone())
    }

    /// Live `(key, value)` pairs in key order; tombstoned keys are skipped.
    pub fn live_entries(&self) -> Vec<(String, Bytes)> {
        self.rows
            .iter()
            .filter(|entry| entry.value().kind == RowKind::Put)
            .map(|entry| {
                let value = entry
                    .value()
                    .value
                    .clone()
                    .unwrap_or_else(Bytes::new);
                (entry.key().clone(), value)
            })
            .collect()
    }

    /// Every row in key order, tombstones included. Flush consumes this so
    /// deletions make it into the published table.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Acquire)
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Acquire)
    }
}
