//! SST blob decoding. Shared by the read handle and compaction; deliberately
//! separate from the WAL codec (different length prefixes, different formats).
//!
//! Data entry layout: `keylen:u16 | key-utf8 | kind:u8 | vallen:u32 | value`.
//! A tombstone carries `kind = Delete` and `vallen = 0` with no value bytes;
//! tables must record deletions so a read probing a newer table stops there
//! instead of resurrecting the key from an older one.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

use echodb_core::types::RowKind;
use echodb_core::{Error, Result};

/// One decoded data-blob entry: a live value or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEntry {
    Value(Bytes),
    Tombstone,
}

impl TableEntry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, TableEntry::Tombstone)
    }

    /// The live value, or `None` for a tombstone.
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            TableEntry::Value(value) => Some(value),
            TableEntry::Tombstone => None,
        }
    }
}

/// Cursor over a data blob's entries.
pub struct EntryCursor {
    buf: Bytes,
    location: String,
}

impl EntryCursor {
    pub fn new(blob: Bytes, location: impl Into<String>) -> Self {
        Self {
            buf: blob,
            location: location.into(),
        }
    }

    /// Byte position of the next entry, relative to the start of the blob.
    pub fn advance_to(&mut self, offset: u64) -> Result<()> {
        let offset = offset as usize;
        if offset > self.buf.len() {
            return Err(Error::corrupt(
                &self.location,
                format!(
                    "index offset {} past end of data blob ({} bytes)",
                    offset,
                    self.buf.len()
                ),
            ));
        }
        self.buf.advance(offset);
        Ok(())
    }

    pub fn next_entry(&mut self) -> Result<Option<(String, TableEntry)>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        self.need(2, "key length")?;
        let key_len = self.buf.get_u16() as usize;
        self.need(key_len, "key bytes")?;
        let key_bytes = self.buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| Error::corrupt(&self.location, "key is not valid UTF-8"))?;

        self.need(1, "entry kind")?;
        let kind = RowKind::try_from(self.buf.get_u8())?;

        self.need(4, "value length")?;
        let value_len = self.buf.get_u32() as usize;
        self.need(value_len, "value bytes")?;
        let value_bytes = self.buf.copy_to_bytes(value_len);
        let entry = match kind {
            RowKind::Put => TableEntry::Value(value_bytes),
            RowKind::Delete => TableEntry::Tombstone,
        };

        Ok(Some((key, entry)))
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(Error::corrupt(
                &self.location,
                format!(
                    "truncated entry: need {} bytes for {}, {} remaining",
                    len,
                    what,
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }
}

/// Decode a full data blob, tombstones included.
pub fn decode_rows(blob: Bytes, location: &str) -> Result<Vec<(String, TableEntry)>> {
    let mut cursor = EntryCursor::new(blob, location);
    let mut rows = Vec::new();
    while let Some(row) = cursor.next_entry()? {
        rows.push(row);
    }
    Ok(rows)
}

/// Decode a full data blob down to its live `(key, value)` pairs.
pub fn decode_entries(blob: Bytes, location: &str) -> Result<Vec<(String, Bytes)>> {
    Ok(decode_rows(blob, location)?
        .into_iter()
        .filter_map(|(key, entry)| entry.into_value().map(|value| (key, value)))
        .collect())
}

/// Parse an index blob's `keylen:u16 | key | offset:u64` entries.
pub fn parse_index(blob: Bytes, location: &str) -> Result<BTreeMap<String, u64>> {
    let mut buf = blob;
    let mut index = BTreeMap::new();

    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(Error::corrupt(location, "truncated index entry"));
        }
        let key_len = buf.get_u16() as usize;
        if buf.remaining() < key_len + 8 {
            return Err(Error::corrupt(location, "truncated index entry"));
        }
        let key_bytes = buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| Error::corrupt(location, "index key is not valid UTF-8"))?;
        let offset = buf.get_u64();
        index.insert(key, offset);
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn truncated_data_blob_is_corrupt() {
        let mut buf = bytes::BytesMut::new();
        buf.put_u16(5);
        buf.put_slice(b"ab"); // claims 5 key bytes, supplies 2
        assert!(matches!(
            decode_rows(buf.freeze(), "test"),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn invalid_entry_kind_is_corrupt() {
        let mut buf = bytes::BytesMut::new();
        buf.put_u16(1);
        buf.put_slice(b"k");
        buf.put_u8(9); // no such kind
        buf.put_u32(0);
        assert!(matches!(
            decode_rows(buf.freeze(), "test"),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn truncated_index_blob_is_corrupt() {
        let mut buf = bytes::BytesMut::new();
        buf.put_u16(1);
        buf.put_slice(b"k"); // missing the offset
        assert!(matches!(
            parse_index(buf.freeze(), "test"),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn cursor_rejects_offset_past_end() {
        let mut cursor = EntryCursor::new(Bytes::from_static(b"1234"), "test");
        assert!(cursor.advance_to(5).is_err());
    }

    #[test]
    fn decode_entries_filters_tombstones() {
        let mut buf = bytes::BytesMut::new();
        buf.put_u16(1);
        buf.put_slice(b"a");
        buf.put_u8(RowKind::Put as u8);
        buf.put_u32(1);
        buf.put_slice(b"1");
        buf.put_u16(1);
        buf.put_slice(b"b");
        buf.put_u8(RowKind::Delete as u8);
        buf.put_u32(0);
        let blob = buf.freeze();

        let rows = decode_rows(blob.clone(), "test").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].1.is_tombstone());

        let live = decode_entries(blob, "test").unwrap();
        assert_eq!(live, vec![("a".to_string(), Bytes::from_static(b"1"))]);
    }
}
