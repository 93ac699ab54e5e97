//! # EchoDB Object Store Adapter
//!
//! Every durable byte in EchoDB lives behind this adapter: WAL blobs, SST
//! data and index files, the sequence blob, checkpoints, and leader records.
//! The adapter exposes a flat key space of opaque strings mapped to opaque
//! byte blobs.
//!
//! Contracts:
//! - `get` returns `Ok(None)` for a missing key; absence is not an error.
//! - `head` returns `Ok(false)` for a missing key.
//! - Every other failure is normalized to [`Error::StoreUnavailable`].
//! - No retries here; callers decide whether an operation is worth retrying
//!   (foreground calls bubble up, background workers retry on their next tick).

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;

use echodb_core::Result;

/// Flat PUT/GET/DELETE/LIST/HEAD surface over an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing object (last writer
    /// wins).
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch the object at `key`, or `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove the object at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys beginning with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether an object exists at `key`.
    async fn head(&self, key: &str) -> Result<bool>;
}
