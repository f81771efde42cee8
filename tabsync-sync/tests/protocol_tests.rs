use pretty_assertions::assert_eq;
use serde_json::json;
use tabsync_sync::{ConflictMetadata, MessageKind, OutgoingMessage, SyncMessage};
use tabsync_types::{ContextId, UserId};

#[test]
fn stamp_fills_origin_and_time() {
    let origin = ContextId::new();
    let msg = OutgoingMessage::value_update("cart", json!([1, 2]))
        .with_user(Some(UserId::from("alice")))
        .with_version(7)
        .stamp(origin, 42);

    assert_eq!(msg.kind, MessageKind::ValueUpdate);
    assert_eq!(msg.key.as_deref(), Some("cart"));
    assert_eq!(msg.value, Some(json!([1, 2])));
    assert_eq!(msg.origin_id, origin);
    assert_eq!(msg.timestamp, 42);
    assert_eq!(msg.user_id, Some(UserId::from("alice")));
    assert_eq!(msg.version, Some(7));
}

#[test]
fn wire_shape() {
    let origin = ContextId::new();
    let msg = OutgoingMessage::value_update("cart", json!({"n": 1})).stamp(origin, 5);

    let v = serde_json::to_value(&msg).unwrap();

    assert_eq!(
        v,
        json!({
            "type": "value-update",
            "key": "cart",
            "value": {"n": 1},
            "timestamp": 5,
            "originId": origin.to_string(),
        })
    );
}

#[test]
fn parses_message_from_wire() {
    let origin = ContextId::new();
    let raw = json!({
        "type": "value-delete",
        "key": "cart",
        "timestamp": 9,
        "originId": origin.to_string(),
        "userId": "bob",
        "version": 3,
    });

    let msg: SyncMessage = serde_json::from_value(raw).unwrap();

    assert_eq!(msg.kind, MessageKind::ValueDelete);
    assert_eq!(msg.value, None);
    assert_eq!(msg.user_id, Some(UserId::from("bob")));
    assert_eq!(msg.version, Some(3));
}

#[test]
fn kinds_use_kebab_case() {
    assert_eq!(serde_json::to_value(MessageKind::Presence).unwrap(), json!("presence"));
    assert_eq!(
        serde_json::to_value(MessageKind::Notification).unwrap(),
        json!("notification")
    );
}

#[test]
fn targets_only_value_messages_for_key() {
    let origin = ContextId::new();
    let update = OutgoingMessage::value_update("a", json!(1)).stamp(origin, 0);
    let delete = OutgoingMessage::value_delete("a").stamp(origin, 0);
    let presence = OutgoingMessage::presence().stamp(origin, 0);

    assert!(update.targets("a"));
    assert!(!update.targets("b"));
    assert!(delete.targets("a"));
    assert!(!presence.targets("a"));
}

#[test]
fn notification_carries_text() {
    let msg = OutgoingMessage::notification("saved").stamp(ContextId::new(), 0);
    assert_eq!(msg.kind, MessageKind::Notification);
    assert_eq!(msg.key, None);
    assert_eq!(msg.value, Some(json!("saved")));
}

#[test]
fn metadata_from_message() {
    let origin = ContextId::new();
    let msg = OutgoingMessage::value_update("a", json!(1))
        .with_user(Some(UserId::from("carol")))
        .stamp(origin, 77);

    let meta = ConflictMetadata::from_message(&msg).unwrap();

    assert_eq!(meta.key, "a");
    assert_eq!(meta.timestamp, 77);
    assert_eq!(meta.origin_id, origin);
    assert_eq!(meta.user_id, Some(UserId::from("carol")));
}

#[test]
fn metadata_needs_a_key() {
    let msg = OutgoingMessage::presence().stamp(ContextId::new(), 0);
    assert!(ConflictMetadata::from_message(&msg).is_none());
}

#[test]
fn local_metadata_gets_fresh_id() {
    let origin = ContextId::new();
    let a = ConflictMetadata::local("k", 1, origin, None);
    let b = ConflictMetadata::local("k", 1, origin, None);
    assert_ne!(a.conflict_id, b.conflict_id);
}
