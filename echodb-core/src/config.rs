//! # Configuration
//!
//! Configuration for all EchoDB components. Defaults match a small
//! single-writer cluster against an S3-compatible store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    pub store: StoreConfig,
    pub memtable: MemtableConfig,
    pub cache: CacheConfig,
    pub wal: WalConfig,
    pub compaction: CompactionConfig,
    pub checkpoint: CheckpointConfig,
    pub lease: LeaseConfig,
    pub recovery: RecoveryConfig,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            memtable: MemtableConfig::default(),
            cache: CacheConfig::default(),
            wal: WalConfig::default(),
            compaction: CompactionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            lease: LeaseConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Target object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (LocalStack, MinIO). `None` means the real AWS endpoint.
    pub endpoint: Option<String>,
    /// Prefix for WAL blobs.
    pub wal_prefix: String,
    /// Prefix for SST blobs.
    pub data_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: "echodb".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            wal_prefix: "wal/".to_string(),
            data_prefix: "data/".to_string(),
        }
    }
}

/// Memtable rotation and flush triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemtableConfig {
    /// Rotation threshold for the active memtable's byte footprint.
    pub max_bytes: u64,
    /// Immutable-list length that triggers a flush.
    pub max_immutable: usize,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024, // 64MiB
            max_immutable: 3,
        }
    }
}

/// Read cache sizing and eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256MiB
            policy: CachePolicy::Lru,
        }
    }
}

/// Cache eviction policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    Lru,
    TwoChoice,
}

/// Write-ahead log behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Interval between periodic buffer flushes to the object store.
    pub flush_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Background compaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub interval: Duration,
    /// L0 table count above which a compaction round actually runs.
    pub l0_trigger: usize,
    /// Interval between L0 discovery listings (follower convergence).
    pub discovery_interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            l0_trigger: 4,
            discovery_interval: Duration::from_secs(10),
        }
    }
}

/// Checkpoint persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Leader lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub duration: Duration,
    pub heartbeat: Duration,
    /// Candidate poll interval.
    pub election_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            heartbeat: Duration::from_secs(10),
            election_interval: Duration::from_secs(5),
        }
    }
}

/// WAL replay behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Abort replay on a corrupt WAL row instead of skipping the rest of the
    /// blob. Off by default: a corrupt tail loses trailing entries of one
    /// blob, later blobs still replay.
    pub halt_on_corruption: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            halt_on_corruption: false,
        }
    }
}
