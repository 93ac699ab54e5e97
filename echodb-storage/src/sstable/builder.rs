//! SST construction: fold sorted entries into a data blob and a sparse index
//! blob, built in one pass.
//!
//! Data entry:  `keylen:u16 | key-utf8 | kind:u8 | vallen:u32 | value`
//! Index entry: `keylen:u16 | key-utf8 | offset:u64`
//!
//! Tombstones are written like any other entry (kind = Delete, no value
//! bytes): a flushed or compacted table must keep shadowing older tables,
//! so deletions ride along until a sweep at the terminal level drops them —
//! which this simplified compaction never does.
//!
//! Every Nth data key is recorded in the index with the byte offset of its
//! entry; `floor(key)` over the index then gives a scan start point at most
//! N entries before the target.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use echodb_core::types::RowKind;
use echodb_core::{Error, Result};

use crate::sstable::format::TableEntry;

/// Index sampling rate by level: every 10th key in L0, coarser above.
pub fn index_interval_for_level(level: u32) -> usize {
    if level == 0 {
        10
    } else {
        (10 * level as usize).min(50)
    }
}

/// The two blobs making up a finished table.
pub struct SsTableBlobs {
    pub data: Bytes,
    pub index: Bytes,
}

pub struct SsTableBuilder {
    entries: BTreeMap<String, TableEntry>,
    index_interval: usize,
}

impl SsTableBuilder {
    pub fn new(index_interval: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index_interval: index_interval.max(1),
        }
    }

    /// Stage a live pair. Re-adding a key replaces the staged entry, which is
    /// what compaction's newest-wins fold relies on.
    pub fn add(&mut self, key: impl Into<String>, value: Bytes) {
        self.entries.insert(key.into(), TableEntry::Value(value));
    }

    /// Stage a tombstone for `key`.
    pub fn add_tombstone(&mut self, key: impl Into<String>) {
        self.entries.insert(key.into(), TableEntry::Tombstone);
    }

    /// Stage an already-classified entry.
    pub fn add_entry(&mut self, key: impl Into<String>, entry: TableEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Emit both blobs. Keys are written in sorted order, strictly increasing.
    pub fn build(self) -> Result<SsTableBlobs> {
        let mut data = BytesMut::new();
        let mut index = BytesMut::new();

        let mut offset: u64 = 0;
        for (entry_no, (key, entry)) in self.entries.into_iter().enumerate() {
            let key_bytes = key.as_bytes();
            if key_bytes.len() > u16::MAX as usize {
                return Err(Error::Internal {
                    message: format!("sstable key exceeds u16 length prefix: {} bytes", key_bytes.len()),
                });
            }

            if entry_no % self.index_interval == 0 {
                index.put_u16(key_bytes.len() as u16);
                index.put_slice(key_bytes);
                index.put_u64(offset);
            }

            data.put_u16(key_bytes.len() as u16);
            data.put_slice(key_bytes);
            let value_len = match &entry {
                TableEntry::Value(value) => {
                    data.put_u8(RowKind::Put as u8);
                    data.put_u32(value.len() as u32);
                    data.put_slice(value);
                    value.len() as u64
                }
                TableEntry::Tombstone => {
                    data.put_u8(RowKind::Delete as u8);
                    data.put_u32(0);
                    0
                }
            };

            offset += 2 + key_bytes.len() as u64 + 1 + 4 + value_len;
        }

        Ok(SsTableBlobs {
            data: data.freeze(),
            index: index.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::format::{decode_entries, decode_rows, parse_index};

    #[test]
    fn build_preserves_pairs_in_key_order() {
        let mut builder = SsTableBuilder::new(10);
        builder.add("b", Bytes::from_static(b"2"));
        builder.add("a", Bytes::from_static(b"1"));
        builder.add("c", Bytes::from_static(b"3"));

        let blobs = builder.build().unwrap();
        let entries = decode_entries(blobs.data, "test").unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), Bytes::from_static(b"1")),
                ("b".to_string(), Bytes::from_static(b"2")),
                ("c".to_string(), Bytes::from_static(b"3")),
            ]
        );
    }

    #[test]
    fn tombstones_round_trip_through_the_data_blob() {
        let mut builder = SsTableBuilder::new(10);
        builder.add("kept", Bytes::from_static(b"v"));
        builder.add_tombstone("gone");

        let blobs = builder.build().unwrap();
        let rows = decode_rows(blobs.data, "test").unwrap();
        assert_eq!(
            rows,
            vec![
                ("gone".to_string(), TableEntry::Tombstone),
                ("kept".to_string(), TableEntry::Value(Bytes::from_static(b"v"))),
            ]
        );
    }

    #[test]
    fn index_samples_every_nth_key() {
        let mut builder = SsTableBuilder::new(3);
        for i in 0..10 {
            builder.add(format!("k{:02}", i), Bytes::from_static(b"v"));
        }

        let blobs = builder.build().unwrap();
        let index = parse_index(blobs.index, "test").unwrap();
        // Entries 0, 3, 6, 9 are sampled.
        let keys: Vec<_> = index.keys().cloned().collect();
        assert_eq!(keys, vec!["k00", "k03", "k06", "k09"]);
        assert_eq!(index["k00"], 0);
    }

    #[test]
    fn re_adding_a_key_replaces_the_entry() {
        let mut builder = SsTableBuilder::new(10);
        builder.add("k", Bytes::from_static(b"old"));
        builder.add_tombstone("k");

        let blobs = builder.build().unwrap();
        let rows = decode_rows(blobs.data, "test").unwrap();
        assert_eq!(rows, vec![("k".to_string(), TableEntry::Tombstone)]);
    }

    #[test]
    fn interval_coarsens_with_level() {
        assert_eq!(index_interval_for_level(0), 10);
        assert_eq!(index_interval_for_level(1), 10);
        assert_eq!(index_interval_for_level(3), 30);
        assert_eq!(index_interval_for_level(7), 50);
    }

    #[test]
    fn empty_builder_emits_empty_blobs() {
        let blobs = SsTableBuilder::new(10).build().unwrap();
        assert!(blobs.data.is_empty());
        assert!(blobs.index.is_empty());
    }
}
