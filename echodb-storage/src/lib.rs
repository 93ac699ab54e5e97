//! # EchoDB Storage Engine
//!
//! The LSM storage path and its coordination pieces, all anchored in an
//! object store.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         EchoDb                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  Write Path:                                                 │
//! │  ┌────────┐   ┌───────────┐   ┌─────┐   ┌──────────┐        │
//! │  │ put /  │──>│ sequence  │──>│ WAL │──>│ memtable │        │
//! │  │ delete │   │ allocator │   └──┬──┘   └────┬─────┘        │
//! │  └────────┘   └───────────┘      │           │ rotate+flush │
//! │                                  ▼           ▼              │
//! │                            wal/wal-<ts>  data/l0/*.{data,   │
//! │                                           index} + checkpoint│
//! │                                                              │
//! │  Read Path:                                                  │
//! │  active ─> immutables (newest first) ─> L0 (newest first)    │
//! │         ─> L1..Ln (ascending)                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod checkpoint;
pub mod db;
pub mod lsm;
pub mod memtable;
pub mod recovery;
pub mod sequence;
pub mod sstable;
pub mod wal;

pub use cache::CacheManager;
pub use checkpoint::{Checkpoint, Checkpointer};
pub use db::EchoDb;
pub use lsm::LsmTree;
pub use memtable::Memtable;
pub use recovery::WalRecovery;
pub use sequence::SequenceAllocator;
pub use sstable::{SsTable, SsTableBuilder};
pub use wal::WriteAheadLog;
