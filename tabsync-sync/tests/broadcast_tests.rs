use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabsync_sync::{
    BroadcastHub, Broadcaster, MessageKind, OutgoingMessage, Subscription, SyncMessage,
    CHANNEL_CAPACITY, DEFAULT_CHANNEL,
};
use tabsync_types::{Clock, ContextId, ManualClock};

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(1_000))
}

/// Next non-presence message already delivered.
fn next_update(sub: &mut Subscription) -> Option<SyncMessage> {
    std::iter::from_fn(|| sub.try_recv()).find(|m| m.kind != MessageKind::Presence)
}

// ── Delivery ─────────────────────────────────────────────────────

#[test]
fn update_reaches_other_context() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());
    let mut sub_b = b.subscribe();

    a.broadcast(OutgoingMessage::value_update("cart", json!({"items": 2})));

    let msg = next_update(&mut sub_b).unwrap();
    assert_eq!(msg.kind, MessageKind::ValueUpdate);
    assert_eq!(msg.key.as_deref(), Some("cart"));
    assert_eq!(msg.value, Some(json!({"items": 2})));
    assert_eq!(msg.origin_id, a.origin_id());
    assert_eq!(msg.timestamp, 1_000);
}

#[test]
fn own_messages_are_filtered() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let mut sub_a = a.subscribe();

    a.broadcast(OutgoingMessage::value_update("cart", json!(1)));

    assert!(sub_a.try_recv().is_none());
}

#[test]
fn messages_arrive_in_send_order() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());
    let mut sub_b = b.subscribe();

    for i in 0..5 {
        a.broadcast(OutgoingMessage::value_update("n", json!(i)));
    }

    let values: Vec<_> = std::iter::from_fn(|| next_update(&mut sub_b))
        .map(|m| m.value.unwrap())
        .collect();
    assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[test]
fn send_without_subscribers_is_dropped() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());

    let sent = a.broadcast(OutgoingMessage::value_update("k", json!(1)));
    assert!(sent.is_some());

    let mut late = b.subscribe();
    assert!(next_update(&mut late).is_none());
}

#[test]
fn channels_are_isolated() {
    let hub = BroadcastHub::new();
    let a = hub.connect_to("one", ContextId::new(), clock());
    let b = hub.connect_to("two", ContextId::new(), clock());
    let mut sub_b = b.subscribe();

    a.broadcast(OutgoingMessage::value_update("k", json!(1)));

    assert!(next_update(&mut sub_b).is_none());
    assert_eq!(a.channel(), "one");
}

#[test]
fn default_channel_name() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    assert_eq!(a.channel(), DEFAULT_CHANNEL);
}

#[test]
fn subscriber_count_tracks_live_subscriptions() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    assert_eq!(hub.subscriber_count(DEFAULT_CHANNEL), 0);

    let sub = a.subscribe();
    let sub2 = a.subscribe();
    assert_eq!(hub.subscriber_count(DEFAULT_CHANNEL), 2);

    sub.close();
    drop(sub2);
    assert_eq!(hub.subscriber_count(DEFAULT_CHANNEL), 0);
    assert_eq!(hub.subscriber_count("nonexistent"), 0);
}

#[test]
fn lagging_subscriber_keeps_newest_messages() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());
    let mut sub_b = b.subscribe();

    for i in 0..(CHANNEL_CAPACITY + 44) {
        a.broadcast(OutgoingMessage::value_update("n", json!(i)));
    }

    let received: Vec<_> = std::iter::from_fn(|| sub_b.try_recv()).collect();
    assert_eq!(received.len(), CHANNEL_CAPACITY);
    assert_eq!(received[0].value, Some(json!(44)));
}

// ── Presence ─────────────────────────────────────────────────────

#[test]
fn subscribing_announces_presence() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());
    let mut sub_a = a.subscribe();

    let _sub_b = b.subscribe();

    let msg = sub_a.try_recv().unwrap();
    assert_eq!(msg.kind, MessageKind::Presence);
    assert_eq!(msg.origin_id, b.origin_id());

    let peers = a.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].origin_id, b.origin_id());
    assert_eq!(peers[0].last_seen, 1_000);
}

#[test]
fn own_presence_is_not_a_peer() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let mut sub_a = a.subscribe();
    let _second = a.subscribe();

    assert!(sub_a.try_recv().is_none());
    assert!(a.peers().is_empty());
}

// ── Single-context mode ──────────────────────────────────────────

#[tokio::test]
async fn disabled_broadcaster_is_a_no_op() {
    let a = Broadcaster::disabled(ContextId::new(), clock());
    assert!(!a.is_enabled());
    assert_eq!(a.channel(), "");

    assert!(a.broadcast(OutgoingMessage::value_update("k", json!(1))).is_none());

    let mut sub = a.subscribe();
    assert!(!sub.is_active());
    assert!(sub.try_recv().is_none());
    assert!(sub.recv().await.is_none());
}

// ── Async receive ────────────────────────────────────────────────

#[tokio::test]
async fn recv_waits_for_next_message() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let b = hub.connect(ContextId::new(), clock());
    let mut sub_b = b.subscribe();

    let sender = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.broadcast(OutgoingMessage::notification("hello"));
    });

    let msg = tokio::time::timeout(Duration::from_secs(1), sub_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.kind, MessageKind::Notification);
    assert_eq!(msg.value, Some(json!("hello")));
    sender.await.unwrap();
}

#[tokio::test]
async fn recv_ends_when_channel_is_gone() {
    let hub = BroadcastHub::new();
    let a = hub.connect(ContextId::new(), clock());
    let mut sub = a.subscribe();

    drop(a);
    drop(hub);

    assert!(sub.recv().await.is_none());
    assert!(!sub.is_active());
}
