use serde_json::json;
use tabsync_sync::SyncStatus;

#[test]
fn status_display() {
    assert_eq!(SyncStatus::Synced.to_string(), "synced");
    assert_eq!(SyncStatus::Syncing.to_string(), "syncing");
    assert_eq!(SyncStatus::Conflict.to_string(), "conflict");
    assert_eq!(SyncStatus::Error.to_string(), "error");
    assert_eq!(SyncStatus::Offline.to_string(), "offline");
}

#[test]
fn status_serde_matches_display() {
    for status in [
        SyncStatus::Synced,
        SyncStatus::Syncing,
        SyncStatus::Conflict,
        SyncStatus::Error,
        SyncStatus::Offline,
    ] {
        assert_eq!(serde_json::to_value(status).unwrap(), json!(status.to_string()));
    }
}
