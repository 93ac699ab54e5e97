//! # Metrics
//!
//! Lightweight counter registry shared across components. Everything is a
//! relaxed atomic; `snapshot()` gives a consistent-enough view for logging
//! and admin endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Write path
    puts: AtomicU64,
    deletes: AtomicU64,
    wal_flushes: AtomicU64,
    wal_bytes: AtomicU64,

    // LSM
    memtable_rotations: AtomicU64,
    memtable_flushes: AtomicU64,
    compactions: AtomicU64,
    ssts_discovered: AtomicU64,

    // Read path
    gets: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Coordination
    checkpoints_persisted: AtomicU64,
    elections_won: AtomicU64,
    rows_recovered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&self) {
        self.inner.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.inner.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_flush(&self, bytes: u64) {
        self.inner.wal_flushes.fetch_add(1, Ordering::Relaxed);
        self.inner.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.inner.memtable_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.inner.memtable_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.inner.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery(&self, count: u64) {
        self.inner.ssts_discovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.inner.checkpoints_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_election_won(&self) {
        self.inner.elections_won.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_recovered(&self, count: u64) {
        self.inner.rows_recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.inner.puts.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
            gets: self.inner.gets.load(Ordering::Relaxed),
            wal_flushes: self.inner.wal_flushes.load(Ordering::Relaxed),
            wal_bytes: self.inner.wal_bytes.load(Ordering::Relaxed),
            memtable_rotations: self.inner.memtable_rotations.load(Ordering::Relaxed),
            memtable_flushes: self.inner.memtable_flushes.load(Ordering::Relaxed),
            compactions: self.inner.compactions.load(Ordering::Relaxed),
            ssts_discovered: self.inner.ssts_discovered.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            checkpoints_persisted: self.inner.checkpoints_persisted.load(Ordering::Relaxed),
            elections_won: self.inner.elections_won.load(Ordering::Relaxed),
            rows_recovered: self.inner.rows_recovered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub wal_flushes: u64,
    pub wal_bytes: u64,
    pub memtable_rotations: u64,
    pub memtable_flushes: u64,
    pub compactions: u64,
    pub ssts_discovered: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub checkpoints_persisted: u64,
    pub elections_won: u64,
    pub rows_recovered: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_put();
        metrics.record_put();
        metrics.record_wal_flush(128);

        let snap = metrics.snapshot();
        assert_eq!(snap.puts, 2);
        assert_eq!(snap.wal_flushes, 1);
        assert_eq!(snap.wal_bytes, 128);
    }

    #[test]
    fn hit_rate_handles_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.5);
    }
}
