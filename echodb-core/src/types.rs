//! # Row Model
//!
//! A [`Row`] is the unit of mutation everywhere in EchoDB: the WAL buffers
//! rows, the memtable maps keys to their latest row, and recovery replays
//! rows. A row with [`RowKind::Delete`] is a tombstone and carries no value.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Mutation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RowKind {
    Put = 0,
    Delete = 1,
}

impl TryFrom<u8> for RowKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RowKind::Put),
            1 => Ok(RowKind::Delete),
            _ => Err(Error::corrupt("row", format!("invalid row kind: {}", value))),
        }
    }
}

/// A single mutation, ordered globally by `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub sequence: u64,
    pub kind: RowKind,
    pub key: String,
    /// `None` iff `kind == Delete`.
    pub value: Option<Bytes>,
    /// Wall-clock milliseconds at creation.
    pub timestamp: u64,
}

impl Row {
    pub fn put(sequence: u64, key: impl Into<String>, value: Bytes) -> Self {
        Self {
            sequence,
            kind: RowKind::Put,
            key: key.into(),
            value: Some(value),
            timestamp: now_millis(),
        }
    }

    pub fn tombstone(sequence: u64, key: impl Into<String>) -> Self {
        Self {
            sequence,
            kind: RowKind::Delete,
            key: key.into(),
            value: None,
            timestamp: now_millis(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == RowKind::Delete
    }

    /// Approximate in-memory footprint, used for memtable byte accounting.
    pub fn approx_size(&self) -> u64 {
        let value_len = self.value.as_ref().map(|v| v.len() as u64).unwrap_or(0);
        8 + 1 + self.key.len() as u64 + value_len + 8
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstones_carry_no_value() {
        let row = Row::tombstone(7, "k");
        assert!(row.is_tombstone());
        assert!(row.value.is_none());
    }

    #[test]
    fn approx_size_counts_key_value_and_header() {
        let row = Row::put(1, "key", Bytes::from_static(b"value"));
        // 8 (seq) + 1 (kind) + 3 (key) + 5 (value) + 8 (ts)
        assert_eq!(row.approx_size(), 25);

        let tombstone = Row::tombstone(2, "key");
        assert_eq!(tombstone.approx_size(), 20);
    }

    #[test]
    fn row_kind_decodes_and_rejects() {
        assert_eq!(RowKind::try_from(0).unwrap(), RowKind::Put);
        assert_eq!(RowKind::try_from(1).unwrap(), RowKind::Delete);
        assert!(RowKind::try_from(2).is_err());
    }
}
