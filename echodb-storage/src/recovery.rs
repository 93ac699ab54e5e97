//! # WAL Recovery
//!
//! Checkpoint-anchored replay: list the WAL blobs, keep those that may hold
//! rows past the checkpoint, and feed every row newer than the checkpoint
//! sequence back through the LSM write path with its original sequence.
//!
//! Replay is idempotent — sequences are unique and a later row at the same
//! key wins — so it is safe to run on cold start and again on every
//! leadership acquisition.

use std::sync::Arc;

use tracing::{info, warn};

use echodb_core::types::RowKind;
use echodb_core::{config::EchoConfig, metrics::Metrics, Result};
use echodb_store::ObjectStore;

use crate::checkpoint::Checkpointer;
use crate::lsm::LsmTree;
use crate::wal::codec::RowDecoder;

/// Stateless replay driver over (store, checkpointer, lsm).
pub struct WalRecovery {
    store: Arc<dyn ObjectStore>,
    checkpointer: Arc<Checkpointer>,
    lsm: Arc<LsmTree>,
    wal_prefix: String,
    halt_on_corruption: bool,
    metrics: Metrics,
}

impl WalRecovery {
    pub fn new(
        config: &EchoConfig,
        store: Arc<dyn ObjectStore>,
        checkpointer: Arc<Checkpointer>,
        lsm: Arc<LsmTree>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            checkpointer,
            lsm,
            wal_prefix: config.store.wal_prefix.clone(),
            halt_on_corruption: config.recovery.halt_on_corruption,
            metrics,
        }
    }

    /// Replay WAL rows newer than the checkpoint. Returns the number of rows
    /// applied.
    pub async fn recover(&self) -> Result<u64> {
        let checkpoint = self.checkpointer.current().await;
        info!(
            checkpoint_seq = checkpoint.last_flushed_seq,
            checkpoint_ts = checkpoint.timestamp,
            "starting wal recovery"
        );

        // A checkpoint that never covered a flush carries its creation time;
        // filtering on it would exclude blobs older than this process. Only
        // apply the timestamp floor once a flush has actually been recorded.
        let ts_floor = if checkpoint.last_flushed_seq == 0 {
            0
        } else {
            checkpoint.timestamp
        };
        let blobs = self.candidate_blobs(ts_floor).await?;
        let mut applied = 0u64;

        for key in &blobs {
            applied += self.replay_blob(key, checkpoint.last_flushed_seq).await?;
        }

        self.metrics.record_rows_recovered(applied);
        info!(blobs = blobs.len(), rows = applied, "wal recovery completed");
        Ok(applied)
    }

    /// WAL keys that may contain rows past the checkpoint, in replay order.
    /// Keys whose timestamp cannot be parsed are kept — losing a blob is
    /// worse than replaying one (replay is idempotent).
    async fn candidate_blobs(&self, checkpoint_ts: u64) -> Result<Vec<String>> {
        let keys = self.store.list(&self.wal_prefix).await?;

        let mut candidates: Vec<(u64, u64, String)> = Vec::new();
        for key in keys {
            match parse_wal_key(&key) {
                Some((ts, seq)) => {
                    if ts >= checkpoint_ts {
                        candidates.push((ts, seq, key));
                    }
                }
                None => {
                    warn!(key = %key, "unparseable wal key, including it in replay");
                    candidates.push((0, 0, key));
                }
            }
        }

        candidates.sort();
        Ok(candidates.into_iter().map(|(_, _, key)| key).collect())
    }

    async fn replay_blob(&self, key: &str, checkpoint_seq: u64) -> Result<u64> {
        let blob = match self.store.get(key).await? {
            Some(blob) => blob,
            None => {
                warn!(key = %key, "wal blob vanished between list and get");
                return Ok(0);
            }
        };

        let mut decoder = RowDecoder::new(blob, key);
        let mut applied = 0u64;

        loop {
            let row = match decoder.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) if self.halt_on_corruption => return Err(e),
                Err(e) => {
                    // Entries after the bad row in this blob are lost; later
                    // blobs still replay.
                    warn!(key = %key, error = %e, "corrupt wal row, truncating replay of this blob");
                    break;
                }
            };

            if row.sequence <= checkpoint_seq {
                continue;
            }

            match row.kind {
                RowKind::Put => {
                    let value = row.value.unwrap_or_default();
                    self.lsm.put_with_seq(&row.key, value, row.sequence).await?
                }
                RowKind::Delete => self.lsm.delete_with_seq(&row.key, row.sequence).await?,
            }
            applied += 1;
        }

        Ok(applied)
    }
}

/// Parse `<prefix>wal-<ms>[-<n>]` into `(ms, n)`.
fn parse_wal_key(key: &str) -> Option<(u64, u64)> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let mut parts = file_name.split('-');
    if parts.next() != Some("wal") {
        return None;
    }
    let ts: u64 = parts.next()?.parse().ok()?;
    let seq: u64 = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    Some((ts, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_keys_parse_with_and_without_counter() {
        assert_eq!(parse_wal_key("wal/wal-1234-7"), Some((1234, 7)));
        assert_eq!(parse_wal_key("wal/wal-1234"), Some((1234, 0)));
        assert_eq!(parse_wal_key("wal/not-a-wal"), None);
        assert_eq!(parse_wal_key("wal/wal-xyz"), None);
    }
}
