//! Synced key-value mirror.
//!
//! Naive cross-context mirroring of one reactive value: every local write is
//! broadcast, every received write is applied. There is no conflict
//! awareness: whichever message a context processes last determines its
//! value.

use crate::broadcast::{Broadcaster, Subscription};
use crate::protocol::{decode, encode, MessageKind, OutgoingMessage, SyncMessage};
use crate::reactive::ReactiveValue;
use parking_lot::Mutex;
use std::sync::Arc;
use tabsync_types::SyncValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// A value mirrored across all contexts connected to the same channel.
#[derive(Debug, Clone)]
pub struct SyncedValue<T: SyncValue> {
    inner: Arc<MirrorInner<T>>,
}

#[derive(Debug)]
struct MirrorInner<T> {
    key: String,
    default: T,
    value: ReactiveValue<T>,
    broadcaster: Broadcaster,
    subscription: Mutex<Option<Subscription>>,
}

impl<T: SyncValue> SyncedValue<T> {
    /// Creates a mirror for `key` starting at `default`, and subscribes to
    /// the broadcaster's channel.
    pub fn new(key: impl Into<String>, default: T, broadcaster: Broadcaster) -> Self {
        let subscription = broadcaster.subscribe();
        Self {
            inner: Arc::new(MirrorInner {
                key: key.into(),
                value: ReactiveValue::new(default.clone()),
                default,
                broadcaster,
                subscription: Mutex::new(Some(subscription)),
            }),
        }
    }

    /// Returns the key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        self.inner.value.get()
    }

    /// Watches the value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.value.subscribe()
    }

    /// Replaces the value and broadcasts it.
    pub fn set(&self, value: T) -> T {
        self.update(move |_| value)
    }

    /// Applies `f` to the current value, broadcasts the result and returns it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let resolved = self.inner.value.update(f);
        if let Some(encoded) = encode(&self.inner.key, &resolved) {
            self.inner
                .broadcaster
                .broadcast(OutgoingMessage::value_update(&self.inner.key, encoded));
        }
        resolved
    }

    /// Resets the value to its default and tells other contexts to do the same.
    pub fn delete(&self) {
        self.inner.value.set(self.inner.default.clone());
        self.inner
            .broadcaster
            .broadcast(OutgoingMessage::value_delete(&self.inner.key));
    }

    /// Applies a received message. Returns true if the local value changed.
    ///
    /// Never broadcasts; messages from this context are ignored.
    pub fn handle_message(&self, message: &SyncMessage) -> bool {
        if message.origin_id == self.inner.broadcaster.origin_id()
            || !message.targets(&self.inner.key)
        {
            return false;
        }

        match message.kind {
            MessageKind::ValueUpdate => {
                let Some(value) = message
                    .value
                    .as_ref()
                    .and_then(|v| decode::<T>(&self.inner.key, v))
                else {
                    return false;
                };
                debug!("Mirroring {} from {}", self.inner.key, message.origin_id);
                self.inner.value.set(value);
                true
            }
            MessageKind::ValueDelete => {
                self.inner.value.set(self.inner.default.clone());
                true
            }
            MessageKind::Presence | MessageKind::Notification => false,
        }
    }

    /// Applies every message already delivered. Returns how many changed the value.
    pub fn pump(&self) -> usize {
        let mut applied = 0;
        loop {
            let next = self.inner.subscription.lock().as_mut().and_then(|s| s.try_recv());
            let Some(message) = next else { break };
            if self.handle_message(&message) {
                applied += 1;
            }
        }
        applied
    }

    /// Moves message handling onto a background task. After this, [`pump`]
    /// is a no-op.
    ///
    /// [`pump`]: Self::pump
    pub fn listen(&self) -> JoinHandle<()> {
        let subscription = self.inner.subscription.lock().take();
        let mirror = self.clone();
        tokio::spawn(async move {
            let Some(mut subscription) = subscription else { return };
            while let Some(message) = subscription.recv().await {
                mirror.handle_message(&message);
            }
        })
    }
}
