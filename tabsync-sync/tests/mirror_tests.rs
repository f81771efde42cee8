use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabsync_sync::{BroadcastHub, Broadcaster, MessageKind, SyncMessage, SyncedValue};
use tabsync_types::{Clock, ContextId, ManualClock};

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(1_000))
}

fn pair(hub: &BroadcastHub) -> (SyncedValue<Value>, SyncedValue<Value>) {
    let a = SyncedValue::new("theme", json!("light"), hub.connect(ContextId::new(), clock()));
    let b = SyncedValue::new("theme", json!("light"), hub.connect(ContextId::new(), clock()));
    (a, b)
}

fn forged(origin_id: ContextId, key: &str, value: Value) -> SyncMessage {
    SyncMessage {
        kind: MessageKind::ValueUpdate,
        key: Some(key.to_string()),
        value: Some(value),
        timestamp: 1_000,
        origin_id,
        user_id: None,
        version: None,
    }
}

#[test]
fn starts_at_default() {
    let hub = BroadcastHub::new();
    let (a, _b) = pair(&hub);
    assert_eq!(a.get(), json!("light"));
    assert_eq!(a.key(), "theme");
}

#[test]
fn set_reaches_other_context() {
    let hub = BroadcastHub::new();
    let (a, b) = pair(&hub);

    let resolved = a.set(json!("dark"));

    assert_eq!(resolved, json!("dark"));
    assert_eq!(b.pump(), 1);
    assert_eq!(b.get(), json!("dark"));
}

#[test]
fn update_broadcasts_resolved_value() {
    let hub = BroadcastHub::new();
    let a = SyncedValue::new("count", json!(1), hub.connect(ContextId::new(), clock()));
    let b = SyncedValue::new("count", json!(1), hub.connect(ContextId::new(), clock()));

    let resolved = a.update(|v| json!(v.as_i64().unwrap_or_default() + 10));

    assert_eq!(resolved, json!(11));
    b.pump();
    assert_eq!(b.get(), json!(11));
}

#[test]
fn applying_a_message_never_rebroadcasts() {
    let hub = BroadcastHub::new();
    let (a, b) = pair(&hub);

    a.set(json!("dark"));
    assert_eq!(b.pump(), 1);

    // Only b's presence is waiting for a.
    assert_eq!(a.pump(), 0);
    assert_eq!(a.get(), json!("dark"));
}

#[test]
fn forged_self_message_is_ignored() {
    let hub = BroadcastHub::new();
    let origin = ContextId::new();
    let a = SyncedValue::new("theme", json!("light"), hub.connect(origin, clock()));

    assert!(!a.handle_message(&forged(origin, "theme", json!("dark"))));
    assert_eq!(a.get(), json!("light"));
}

#[test]
fn other_keys_are_ignored() {
    let hub = BroadcastHub::new();
    let a = SyncedValue::new("theme", json!("light"), hub.connect(ContextId::new(), clock()));

    assert!(!a.handle_message(&forged(ContextId::new(), "locale", json!("fr"))));
    assert_eq!(a.get(), json!("light"));
}

#[test]
fn undecodable_payload_is_ignored() {
    let hub = BroadcastHub::new();
    let a: SyncedValue<i64> = SyncedValue::new("n", 0, hub.connect(ContextId::new(), clock()));

    assert!(!a.handle_message(&forged(ContextId::new(), "n", json!("not a number"))));
    assert_eq!(a.get(), 0);
}

#[test]
fn delete_resets_every_context() {
    let hub = BroadcastHub::new();
    let (a, b) = pair(&hub);

    a.set(json!("dark"));
    b.pump();
    a.delete();

    assert_eq!(a.get(), json!("light"));
    assert_eq!(b.pump(), 1);
    assert_eq!(b.get(), json!("light"));
}

#[test]
fn last_processed_write_wins() {
    let hub = BroadcastHub::new();
    let (a, b) = pair(&hub);

    a.set(json!("dark"));
    b.set(json!("sepia"));
    a.pump();
    b.pump();

    // No conflict awareness: each context ends with the other's write.
    assert_eq!(a.get(), json!("sepia"));
    assert_eq!(b.get(), json!("dark"));
}

#[test]
fn works_without_a_channel() {
    let a = SyncedValue::new(
        "theme",
        json!("light"),
        Broadcaster::disabled(ContextId::new(), clock()),
    );
    a.set(json!("dark"));
    assert_eq!(a.get(), json!("dark"));
    assert_eq!(a.pump(), 0);
}

#[tokio::test]
async fn watchers_see_local_writes() {
    let hub = BroadcastHub::new();
    let (a, _b) = pair(&hub);
    let mut rx = a.subscribe();

    a.set(json!("dark"));

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), json!("dark"));
}

#[tokio::test]
async fn listen_applies_messages_in_background() {
    let hub = BroadcastHub::new();
    let (a, b) = pair(&hub);
    let mut rx = b.subscribe();
    let task = b.listen();

    a.set(json!("dark"));

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.get(), json!("dark"));
    assert_eq!(b.pump(), 0);
    task.abort();
}
