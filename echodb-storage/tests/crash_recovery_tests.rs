//! Crash and replay scenarios: WAL rows that never made it into an SST must
//! reappear after restart, rows below the checkpoint must not be replayed,
//! and replay must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use echodb_core::config::EchoConfig;
use echodb_core::metrics::Metrics;
use echodb_core::types::{now_millis, Row};
use echodb_store::{MemoryStore, ObjectStore};
use echodb_storage::checkpoint::{Checkpoint, CHECKPOINT_KEY};
use echodb_storage::wal::codec;
use echodb_storage::{Checkpointer, EchoDb, WriteAheadLog};

async fn open_db(store: &Arc<MemoryStore>) -> Arc<EchoDb> {
    EchoDb::open(
        EchoConfig::default(),
        Arc::clone(store) as Arc<dyn ObjectStore>,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn wal_rows_survive_a_crash_before_memtable_flush() {
    let store = Arc::new(MemoryStore::new());

    // First life: the row reaches the WAL but no SST — the process dies
    // before any memtable flush.
    {
        let wal = WriteAheadLog::new(
            &EchoConfig::default(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Metrics::new(),
        );
        wal.append_put("x", Bytes::from_static(b"1"), 1001).unwrap();
        wal.flush().await.unwrap();
        // Dropped without close: crash.
    }
    assert!(store.list("data/l0/").await.unwrap().is_empty());

    // Second life: open() replays the WAL against the empty tree.
    let db = open_db(&store).await;
    assert_eq!(db.get("x").await.unwrap(), Some(Bytes::from_static(b"1")));
    db.close().await.unwrap();
}

#[tokio::test]
async fn replay_skips_rows_at_or_below_the_checkpoint() {
    let store = Arc::new(MemoryStore::new());

    // Persisted checkpoint at sequence 100 with timestamp 0 so every WAL
    // blob passes the timestamp filter.
    let checkpoint = Checkpoint {
        last_flushed_seq: 100,
        last_flushed_wal_offset: 0,
        timestamp: 0,
    };
    store
        .put(CHECKPOINT_KEY, checkpoint.encode())
        .await
        .unwrap();

    // One WAL blob holding a stale row (seq 50) and a fresh one (seq 150).
    let rows = vec![
        Row::put(50, "stale", Bytes::from_static(b"old")),
        Row::put(150, "fresh", Bytes::from_static(b"new")),
    ];
    let key = format!("wal/wal-{}-0", now_millis());
    store.put(&key, codec::encode_rows(&rows)).await.unwrap();

    let db = open_db(&store).await;
    assert_eq!(db.get("stale").await.unwrap(), None);
    assert_eq!(db.get("fresh").await.unwrap(), Some(Bytes::from_static(b"new")));
    db.close().await.unwrap();
}

#[tokio::test]
async fn replaying_twice_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    {
        let wal = WriteAheadLog::new(
            &EchoConfig::default(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Metrics::new(),
        );
        wal.append_put("a", Bytes::from_static(b"1"), 1001).unwrap();
        wal.append_tombstone("b", 1002).unwrap();
        wal.append_put("a", Bytes::from_static(b"2"), 1003).unwrap();
        wal.flush().await.unwrap();
    }

    let db = open_db(&store).await;
    let first = db.recover_from_wal().await.unwrap();
    let second = db.recover_from_wal().await.unwrap();
    assert_eq!(first, second);

    assert_eq!(db.get("a").await.unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(db.get("b").await.unwrap(), None);
    db.close().await.unwrap();
}

#[tokio::test]
async fn flushed_tombstone_replays_and_shadows_sst_value() {
    let store = Arc::new(MemoryStore::new());
    {
        // PUT flushed to an SST by a previous life...
        let db = open_db(&store).await;
        db.put("k", Bytes::from_static(b"v")).await.unwrap();
        db.flush().await.unwrap();
        db.close().await.unwrap();

        // ...followed by a tombstone that only made it into the WAL before
        // the crash.
        let wal = WriteAheadLog::new(
            &EchoConfig::default(),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Metrics::new(),
        );
        wal.append_tombstone("k", 5000).unwrap();
        wal.flush().await.unwrap();
    }

    let db = open_db(&store).await;
    assert_eq!(db.get("k").await.unwrap(), None);
    db.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_wal_tail_truncates_that_blob_but_later_blobs_replay() {
    let store = Arc::new(MemoryStore::new());

    // Blob 1: one good row followed by half a row header.
    let mut first = codec::encode_rows(&[Row::put(1001, "good", Bytes::from_static(b"1"))]).to_vec();
    first.extend_from_slice(&[0xde, 0xad, 0xbe]);
    store
        .put("wal/wal-1000-0", Bytes::from(first.clone()))
        .await
        .unwrap();

    // Blob 2, later timestamp: intact.
    let second = codec::encode_rows(&[Row::put(1002, "later", Bytes::from_static(b"2"))]);
    store.put("wal/wal-2000-0", second.clone()).await.unwrap();

    let db = open_db(&store).await;
    assert_eq!(db.get("good").await.unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(db.get("later").await.unwrap(), Some(Bytes::from_static(b"2")));
    db.close().await.unwrap();

    // With halt_on_corruption set, the same state refuses to open.
    let strict_store = Arc::new(MemoryStore::new());
    strict_store
        .put("wal/wal-1000-0", Bytes::from(first))
        .await
        .unwrap();
    strict_store.put("wal/wal-2000-0", second).await.unwrap();

    let mut config = EchoConfig::default();
    config.recovery.halt_on_corruption = true;
    let result = EchoDb::open(config, strict_store as Arc<dyn ObjectStore>).await;
    assert!(matches!(result, Err(echodb_core::Error::Corrupt { .. })));
}

#[tokio::test]
async fn checkpointer_survives_restart_rounds() {
    let store = Arc::new(MemoryStore::new());

    for round in 1..=3u64 {
        let checkpointer = Checkpointer::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Duration::from_secs(300),
            Metrics::new(),
        );
        checkpointer.start().await.unwrap();
        assert_eq!(
            checkpointer.current().await.last_flushed_seq,
            (round - 1) * 10
        );
        checkpointer.update(round * 10, round).await.unwrap();
        checkpointer.stop().await;
    }
}
