//! # Sorted String Tables
//!
//! Immutable sorted files published to the object store as a `(data, index)`
//! blob pair. The data blob holds length-prefixed sorted entries — live
//! values and tombstones alike, so a newer table keeps shadowing deletions
//! over older tables — and the index is a sparse `(key, byte-offset)` sample
//! of every Nth entry. A point read loads the small index once, takes
//! `floor(key)` as a scan start, and reads forward through the data blob
//! until it passes the target key.

pub mod builder;
pub mod format;

pub use builder::{index_interval_for_level, SsTableBuilder, SsTableBlobs};
pub use format::TableEntry;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use echodb_core::Result;
use echodb_store::ObjectStore;

use crate::cache::CacheManager;
use format::EntryCursor;

/// Read handle over one published table. Creation is metadata-only: nothing
/// is fetched until the first read.
pub struct SsTable {
    table_id: String,
    data_key: String,
    index_key: String,
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheManager>,
    /// Sparse index, loaded lazily on first read and kept for the table's
    /// lifetime (tables are immutable).
    index: OnceCell<Arc<BTreeMap<String, u64>>>,
}

impl SsTable {
    pub fn new(
        table_id: impl Into<String>,
        data_key: impl Into<String>,
        index_key: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            data_key: data_key.into(),
            index_key: index_key.into(),
            store,
            cache,
            index: OnceCell::new(),
        }
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn data_key(&self) -> &str {
        &self.data_key
    }

    /// Point lookup. `Ok(None)` for a key this table does not mention (and
    /// for a table whose data blob has disappeared); a recorded tombstone
    /// comes back as [`TableEntry::Tombstone`] so the caller can stop
    /// probing older tables.
    pub async fn get(&self, key: &str) -> Result<Option<TableEntry>> {
        let cache_key = self.cache_key(key);
        if let Some(value) = self.cache.get(&cache_key) {
            return Ok(Some(TableEntry::Value(value)));
        }

        let index = self.load_index().await?;

        // Greatest indexed key <= target; an empty or missing index means
        // scanning from the start of the blob.
        let start_offset = index
            .range::<str, _>((
                std::ops::Bound::Unbounded,
                std::ops::Bound::Included(key),
            ))
            .next_back()
            .map(|(_, offset)| *offset)
            .unwrap_or(0);

        let data = match self.read_data().await? {
            Some(data) => data,
            None => return Ok(None),
        };

        let mut cursor = EntryCursor::new(data, &self.data_key);
        cursor.advance_to(start_offset)?;

        while let Some((entry_key, entry)) = cursor.next_entry()? {
            if entry_key == key {
                // Only live values are cacheable; the cache cannot represent
                // a deletion.
                if let TableEntry::Value(value) = &entry {
                    self.cache.put(cache_key, value.clone());
                }
                return Ok(Some(entry));
            }
            // Keys are sorted; once past the target it cannot appear.
            if entry_key.as_str() > key {
                break;
            }
        }

        Ok(None)
    }

    /// Live `(key, value)` pairs in key order; tombstones are filtered out.
    /// An absent blob yields no entries.
    pub async fn entries(&self) -> Result<Vec<(String, Bytes)>> {
        let data = match self.read_data().await? {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };
        format::decode_entries(data, &self.data_key)
    }

    /// Every recorded entry in key order, tombstones included. Compaction
    /// folds these so deletions keep shadowing across the merge.
    pub async fn rows(&self) -> Result<Vec<(String, TableEntry)>> {
        let data = match self.read_data().await? {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };
        format::decode_rows(data, &self.data_key)
    }

    async fn read_data(&self) -> Result<Option<Bytes>> {
        let data = self.store.get(&self.data_key).await?;
        if data.is_none() {
            warn!(table = %self.table_id, key = %self.data_key, "sstable data blob missing");
        }
        Ok(data)
    }

    async fn load_index(&self) -> Result<Arc<BTreeMap<String, u64>>> {
        let index = self
            .index
            .get_or_try_init(|| async {
                let parsed = match self.store.get(&self.index_key).await? {
                    Some(blob) => format::parse_index(blob, &self.index_key)?,
                    None => {
                        debug!(table = %self.table_id, "sstable index missing, scanning from offset 0");
                        BTreeMap::new()
                    }
                };
                Ok::<_, echodb_core::Error>(Arc::new(parsed))
            })
            .await?;
        Ok(Arc::clone(index))
    }

    fn cache_key(&self, key: &str) -> String {
        format!("sstable:{}:{}", self.table_id, key)
    }
}
