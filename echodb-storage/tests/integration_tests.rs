//! End-to-end flows over the public API: write → flush → compaction → read,
//! plus leader/follower convergence through discovery.

use std::sync::Arc;

use bytes::Bytes;

use echodb_core::config::EchoConfig;
use echodb_store::{MemoryStore, ObjectStore};
use echodb_storage::EchoDb;

async fn open_db(store: &Arc<MemoryStore>) -> Arc<EchoDb> {
    EchoDb::open(
        EchoConfig::default(),
        Arc::clone(store) as Arc<dyn ObjectStore>,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn flush_then_compaction_keeps_every_key_readable() {
    let store = Arc::new(MemoryStore::new());
    let db = open_db(&store).await;

    // Five flushed batches of 40 keys: enough L0 tables to cross the
    // compaction trigger of 4.
    for batch in 0..5 {
        for i in (batch * 40)..((batch + 1) * 40) {
            db.put(&format!("k{}", i), Bytes::from(format!("value-{}", i)))
                .await
                .unwrap();
        }
        db.flush().await.unwrap();
    }
    assert_eq!(db.l0_table_count().await, 5);

    assert!(db.compact().await.unwrap());
    assert_eq!(db.l0_table_count().await, 0);

    assert_eq!(
        db.get("k150").await.unwrap(),
        Some(Bytes::from("value-150".to_string()))
    );
    for i in (0..200).step_by(17) {
        let got = db.get(&format!("k{}", i)).await.unwrap();
        assert_eq!(got, Some(Bytes::from(format!("value-{}", i))), "key k{}", i);
    }

    db.close().await.unwrap();
}

#[tokio::test]
async fn overwrites_survive_flush_boundaries() {
    let store = Arc::new(MemoryStore::new());
    let db = open_db(&store).await;

    db.put("k", Bytes::from_static(b"v1")).await.unwrap();
    db.flush().await.unwrap();
    db.put("k", Bytes::from_static(b"v2")).await.unwrap();
    db.flush().await.unwrap();

    assert_eq!(db.get("k").await.unwrap(), Some(Bytes::from_static(b"v2")));
    db.close().await.unwrap();
}

#[tokio::test]
async fn tombstones_hide_flushed_values() {
    let store = Arc::new(MemoryStore::new());
    let db = open_db(&store).await;

    db.put("gone", Bytes::from_static(b"v")).await.unwrap();
    db.put("kept", Bytes::from_static(b"v")).await.unwrap();
    db.flush().await.unwrap();

    db.delete("gone").await.unwrap();
    assert_eq!(db.get("gone").await.unwrap(), None);
    assert_eq!(db.get("kept").await.unwrap(), Some(Bytes::from_static(b"v")));
    db.close().await.unwrap();
}

#[tokio::test]
async fn deleted_keys_stay_deleted_once_the_tombstone_is_flushed() {
    let store = Arc::new(MemoryStore::new());
    let db = open_db(&store).await;

    // Value and tombstone end up in two different L0 tables; the older one
    // must not resurrect the key.
    db.put("k", Bytes::from_static(b"v1")).await.unwrap();
    db.flush().await.unwrap();
    db.delete("k").await.unwrap();
    db.flush().await.unwrap();
    assert_eq!(db.l0_table_count().await, 2);
    assert_eq!(db.get("k").await.unwrap(), None);

    // A reopening node sees the same answer from the published tables alone.
    db.close().await.unwrap();
    let reopened = open_db(&store).await;
    assert_eq!(reopened.get("k").await.unwrap(), None);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn deleted_keys_stay_deleted_across_compaction() {
    let store = Arc::new(MemoryStore::new());
    let db = open_db(&store).await;

    for batch in 0..4 {
        db.put(&format!("pad-{}", batch), Bytes::from_static(b"x"))
            .await
            .unwrap();
        db.flush().await.unwrap();
    }
    db.put("k", Bytes::from_static(b"v")).await.unwrap();
    db.flush().await.unwrap();
    db.delete("k").await.unwrap();
    db.flush().await.unwrap();

    assert!(db.compact().await.unwrap());
    assert_eq!(db.l0_table_count().await, 0);
    assert_eq!(db.get("k").await.unwrap(), None);
    assert_eq!(db.get("pad-0").await.unwrap(), Some(Bytes::from_static(b"x")));
    db.close().await.unwrap();
}

#[tokio::test]
async fn follower_converges_through_published_tables() {
    let store = Arc::new(MemoryStore::new());

    let leader = open_db(&store).await;
    leader.put("shared", Bytes::from_static(b"from-leader")).await.unwrap();
    leader.flush().await.unwrap();

    // A follower opening later registers the published tables on startup.
    let follower = open_db(&store).await;
    assert_eq!(
        follower.get("shared").await.unwrap(),
        Some(Bytes::from_static(b"from-leader"))
    );

    leader.close().await.unwrap();
    follower.close().await.unwrap();
}

#[tokio::test]
async fn reopen_sees_flushed_state() {
    let store = Arc::new(MemoryStore::new());
    {
        let db = open_db(&store).await;
        for i in 0..50 {
            db.put(&format!("key-{}", i), Bytes::from(format!("{}", i)))
                .await
                .unwrap();
        }
        db.flush().await.unwrap();
        db.close().await.unwrap();
    }

    let reopened = open_db(&store).await;
    for i in 0..50 {
        let got = reopened.get(&format!("key-{}", i)).await.unwrap();
        assert_eq!(got, Some(Bytes::from(format!("{}", i))));
    }
    reopened.close().await.unwrap();
}
