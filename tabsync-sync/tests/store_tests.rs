use pretty_assertions::assert_eq;
use serde_json::json;
use tabsync_sync::store::{read_envelope, write_envelope};
use tabsync_sync::{meta_key, FlakyStore, KeyValueStore, MemoryStore, RemoteEnvelope, SyncError};
use tabsync_types::UserId;

fn envelope(version: u64) -> RemoteEnvelope<serde_json::Value> {
    RemoteEnvelope {
        value: json!({"price": version * 10}),
        timestamp: 1_000,
        version,
        user_id: Some(UserId::from("alice")),
    }
}

#[test]
fn meta_key_suffix() {
    assert_eq!(meta_key("cart"), "cart_meta");
}

#[tokio::test]
async fn memory_store_get_set() {
    let store = MemoryStore::new();
    assert!(store.is_empty());
    assert_eq!(store.get("k").await.unwrap(), None);

    store.set("k", json!(1)).await.unwrap();

    assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn clones_share_data() {
    let store = MemoryStore::new();
    let other = store.clone();

    store.set("k", json!("shared")).await.unwrap();

    assert_eq!(other.snapshot("k"), Some(json!("shared")));
}

#[tokio::test]
async fn envelope_writes_both_slots() {
    let store = MemoryStore::new();

    write_envelope(&store, "room", &envelope(3)).await.unwrap();

    assert_eq!(store.snapshot("room"), Some(json!({"price": 30})));
    let meta = store.snapshot("room_meta").unwrap();
    assert_eq!(meta["version"], json!(3));
    assert_eq!(meta["timestamp"], json!(1_000));
    assert_eq!(meta["userId"], json!("alice"));
}

#[tokio::test]
async fn envelope_round_trip() {
    let store = MemoryStore::new();
    write_envelope(&store, "room", &envelope(3)).await.unwrap();

    let read = read_envelope::<serde_json::Value>(&store, "room")
        .await
        .unwrap();

    assert_eq!(read, Some(envelope(3)));
}

#[tokio::test]
async fn absent_envelope_is_none() {
    let store = MemoryStore::new();
    let read = read_envelope::<serde_json::Value>(&store, "room")
        .await
        .unwrap();
    assert!(read.is_none());
}

#[tokio::test]
async fn envelope_without_user_omits_field() {
    let store = MemoryStore::new();
    let mut env = envelope(1);
    env.user_id = None;

    write_envelope(&store, "room", &env).await.unwrap();

    let meta = store.snapshot("room_meta").unwrap();
    assert!(meta.get("userId").is_none());
}

#[tokio::test]
async fn malformed_envelope_is_serialization_error() {
    let store = MemoryStore::new();
    store.set("room_meta", json!({"value": 1})).await.unwrap();

    let err = read_envelope::<serde_json::Value>(&store, "room")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Serialization(_)));
}

// ── FlakyStore ───────────────────────────────────────────────────

#[tokio::test]
async fn flaky_fail_next_counts_down() {
    let store = FlakyStore::new(MemoryStore::new());
    store.fail_next(2);

    assert!(matches!(store.set("k", json!(1)).await, Err(SyncError::Store(_))));
    assert!(store.get("k").await.is_err());
    store.set("k", json!(1)).await.unwrap();

    assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn flaky_fail_all_until_cleared() {
    let store = FlakyStore::new(MemoryStore::new());
    store.fail_all(true);

    for _ in 0..3 {
        assert!(store.get("k").await.is_err());
    }

    store.fail_all(false);
    assert!(store.get("k").await.unwrap().is_none());
    assert!(store.inner().is_empty());
}

#[tokio::test]
async fn envelope_write_surfaces_store_error() {
    let store = FlakyStore::new(MemoryStore::new());
    store.fail_next(1);

    let err = write_envelope(&store, "room", &envelope(1))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Store(_)));
    assert!(store.inner().is_empty());
}
