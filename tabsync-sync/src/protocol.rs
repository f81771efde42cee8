//! Messages exchanged between execution contexts.
//!
//! Every context of a client session publishes and receives [`SyncMessage`]s
//! on one shared broadcast channel. Values travel as untyped JSON so that
//! contexts holding different value types under different keys can share the
//! channel; each receiver decodes only the keys it owns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabsync_types::{ConflictId, ContextId, UserId};

/// What a message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// A new value for `key`.
    ValueUpdate,
    /// `key` was reset to its default.
    ValueDelete,
    /// A context joined the channel. Diagnostics only.
    Presence,
    /// Free-form notification for the UI.
    Notification,
}

/// A message as seen on the channel, stamped by its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Key the message refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Payload (the resolved value for updates, the text for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Sender wall-clock time in milliseconds.
    pub timestamp: u64,
    /// Sending context.
    pub origin_id: ContextId,
    /// User the write is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Sender's version counter after the write, when it keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl SyncMessage {
    /// Returns true if this message updates or deletes `key`.
    pub fn targets(&self, key: &str) -> bool {
        matches!(self.kind, MessageKind::ValueUpdate | MessageKind::ValueDelete)
            && self.key.as_deref() == Some(key)
    }
}

/// A message before the broadcaster stamps origin and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub key: Option<String>,
    pub value: Option<Value>,
    pub user_id: Option<UserId>,
    pub version: Option<u64>,
}

impl OutgoingMessage {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            key: None,
            value: None,
            user_id: None,
            version: None,
        }
    }

    /// A new value for `key`.
    pub fn value_update(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value),
            ..Self::new(MessageKind::ValueUpdate)
        }
    }

    /// `key` was reset to its default.
    pub fn value_delete(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(MessageKind::ValueDelete)
        }
    }

    /// Announces the sending context.
    pub fn presence() -> Self {
        Self::new(MessageKind::Presence)
    }

    /// A UI notification.
    pub fn notification(text: impl Into<String>) -> Self {
        Self {
            value: Some(Value::String(text.into())),
            ..Self::new(MessageKind::Notification)
        }
    }

    /// Attributes the message to a user.
    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Attaches the sender's version counter.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Stamps the message with its origin and send time.
    pub fn stamp(self, origin_id: ContextId, timestamp: u64) -> SyncMessage {
        SyncMessage {
            kind: self.kind,
            key: self.key,
            value: self.value,
            timestamp,
            origin_id,
            user_id: self.user_id,
            version: self.version,
        }
    }
}

/// Metadata kept alongside an in-flight write so it can later be compared
/// against an incoming message for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMetadata {
    pub conflict_id: ConflictId,
    pub key: String,
    pub timestamp: u64,
    pub origin_id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl ConflictMetadata {
    /// Metadata for a local write made now.
    pub fn local(
        key: impl Into<String>,
        timestamp: u64,
        origin_id: ContextId,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            conflict_id: ConflictId::new(),
            key: key.into(),
            timestamp,
            origin_id,
            user_id,
        }
    }

    /// Metadata describing a received message. Returns `None` for messages
    /// without a key.
    pub fn from_message(message: &SyncMessage) -> Option<Self> {
        Some(Self {
            conflict_id: ConflictId::new(),
            key: message.key.clone()?,
            timestamp: message.timestamp,
            origin_id: message.origin_id,
            user_id: message.user_id.clone(),
        })
    }
}

/// Encodes a value for the channel. Unencodable values are logged and not sent.
pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(encoded) => Some(encoded),
        Err(e) => {
            tracing::warn!("Failed to encode value for key {}: {}", key, e);
            None
        }
    }
}

/// Decodes a received payload. Payloads of the wrong shape are logged and ignored.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!("Ignoring undecodable payload for key {}: {}", key, e);
            None
        }
    }
}
