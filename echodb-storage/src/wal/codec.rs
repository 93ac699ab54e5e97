//! WAL row wire format.
//!
//! Per entry, big-endian:
//!
//! ```text
//! seq:u64 | kind:u8 | keylen:u32 | key | vallen:u32 | value | ts:u64
//! ```
//!
//! A DELETE encodes `vallen = 0` with no value bytes. This codec is
//! independent of the SST format (which uses a u16 key prefix); the two must
//! not share helpers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use echodb_core::types::{Row, RowKind};
use echodb_core::{Error, Result};

/// Serialize a batch of rows into one blob, in order.
pub fn encode_rows(rows: &[Row]) -> Bytes {
    let size: usize = rows.iter().map(encoded_len).sum();
    let mut buf = BytesMut::with_capacity(size);
    for row in rows {
        encode_row(&mut buf, row);
    }
    buf.freeze()
}

fn encoded_len(row: &Row) -> usize {
    8 + 1 + 4 + row.key.len() + 4 + row.value.as_ref().map(|v| v.len()).unwrap_or(0) + 8
}

fn encode_row(buf: &mut BytesMut, row: &Row) {
    buf.put_u64(row.sequence);
    buf.put_u8(row.kind as u8);
    buf.put_u32(row.key.len() as u32);
    buf.put_slice(row.key.as_bytes());
    match &row.value {
        Some(value) => {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        None => buf.put_u32(0),
    }
    buf.put_u64(row.timestamp);
}

/// Streaming decoder over a WAL blob.
///
/// Yields rows until the buffer is exhausted or a row fails to decode; the
/// caller decides whether a corrupt tail aborts or truncates replay.
pub struct RowDecoder {
    buf: Bytes,
    location: String,
}

impl RowDecoder {
    pub fn new(blob: Bytes, location: impl Into<String>) -> Self {
        Self {
            buf: blob,
            location: location.into(),
        }
    }

    /// Decode the next row, `Ok(None)` at a clean end of input.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        self.need(8 + 1, "row header")?;
        let sequence = self.buf.get_u64();
        let kind = RowKind::try_from(self.buf.get_u8())?;

        self.need(4, "key length")?;
        let key_len = self.buf.get_u32() as usize;
        self.need(key_len, "key bytes")?;
        let key_bytes = self.buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| {
            Error::corrupt(&self.location, "key is not valid UTF-8")
        })?;

        self.need(4, "value length")?;
        let value_len = self.buf.get_u32() as usize;
        self.need(value_len, "value bytes")?;
        let value_bytes = self.buf.copy_to_bytes(value_len);
        let value = match kind {
            RowKind::Put => Some(value_bytes),
            RowKind::Delete => None,
        };

        self.need(8, "timestamp")?;
        let timestamp = self.buf.get_u64();

        Ok(Some(Row {
            sequence,
            kind,
            key,
            value,
            timestamp,
        }))
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(Error::corrupt(
                &self.location,
                format!(
                    "truncated row: need {} bytes for {}, {} remaining",
                    len,
                    what,
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }
}

/// Decode an entire blob, failing on the first bad row.
pub fn decode_rows(blob: Bytes, location: &str) -> Result<Vec<Row>> {
    let mut decoder = RowDecoder::new(blob, location);
    let mut rows = Vec::new();
    while let Some(row) = decoder.next_row()? {
        rows.push(row);
    }
    Ok(rows)
}
