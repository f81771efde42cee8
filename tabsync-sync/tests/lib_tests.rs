use serde_json::json;
use std::sync::Arc;
use tabsync_sync::{
    BroadcastHub, ConflictAwareValue, MemoryStore, MessageOutcome, ResolverConfig,
    ServerSyncEngine, SyncError, SyncedValue, CHANNEL_CAPACITY, DEFAULT_CHANNEL,
};
use tabsync_types::{ContextId, SystemClock};

#[test]
fn channel_constants() {
    assert_eq!(DEFAULT_CHANNEL, "tabsync");
    assert_eq!(CHANNEL_CAPACITY, 256);
}

#[test]
fn layers_share_one_channel() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(SystemClock);
    let mirror = SyncedValue::new(
        "theme",
        json!("light"),
        hub.connect(ContextId::new(), clock.clone()),
    );
    let resolver = ConflictAwareValue::new(
        "cart",
        json!([]),
        hub.connect(ContextId::new(), clock.clone()),
        ResolverConfig::default(),
    );
    let engine = ServerSyncEngine::builder("profile", json!({}), Arc::new(MemoryStore::new()))
        .broadcaster(hub.connect(ContextId::new(), clock))
        .build();

    mirror.set(json!("dark"));
    resolver.set(json!([1]));
    engine.set(json!({"name": "Ada"}));

    // Each layer only reacts to its own key.
    assert_eq!(mirror.pump(), 0);
    assert!(resolver.pump().iter().all(|o| *o == MessageOutcome::Ignored));
    assert_eq!(engine.pump(), 0);
    assert_eq!(hub.subscriber_count(DEFAULT_CHANNEL), 3);
}

#[test]
fn error_messages() {
    assert_eq!(SyncError::Offline.to_string(), "offline");
    assert_eq!(
        SyncError::Store("timeout".into()).to_string(),
        "store error: timeout"
    );
    assert_eq!(
        SyncError::MissingCustomValue.to_string(),
        "manual resolution requires a custom value"
    );
}
