//! Broadcast layer: fire-and-forget pub/sub between execution contexts.
//!
//! A [`BroadcastHub`] stands in for the platform's named channel: every
//! context of one client session connects to the same hub and gets a
//! [`Broadcaster`] for publishing plus [`Subscription`]s for receiving.
//!
//! Delivery is best-effort and at-most-once. Messages sent while nobody is
//! subscribed are dropped, nothing is buffered across a teardown, and a
//! subscription never yields messages that originated from its own context.
//! A [`Broadcaster::disabled`] instance turns every operation into a no-op
//! (single-context mode).

use crate::protocol::{MessageKind, OutgoingMessage, SyncMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tabsync_types::{Clock, ContextId, UserId};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

/// Channel name used when none is given.
pub const DEFAULT_CHANNEL: &str = "tabsync";

/// Messages a slow subscriber may fall behind before it starts losing them.
pub const CHANNEL_CAPACITY: usize = 256;

/// Registry of named channels shared by all contexts of a session.
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<SyncMessage>>>>,
}

impl BroadcastHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a context to the default channel.
    pub fn connect(&self, origin_id: ContextId, clock: Arc<dyn Clock>) -> Broadcaster {
        self.connect_to(DEFAULT_CHANNEL, origin_id, clock)
    }

    /// Connects a context to a named channel, creating it on first use.
    pub fn connect_to(
        &self,
        channel: &str,
        origin_id: ContextId,
        clock: Arc<dyn Clock>,
    ) -> Broadcaster {
        let sender = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        debug!("Context {} joined channel {}", origin_id, channel);
        Broadcaster {
            origin_id,
            channel: channel.to_string(),
            sender: Some(sender),
            clock,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// Last sighting of another context on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub origin_id: ContextId,
    pub user_id: Option<UserId>,
    pub last_seen: u64,
}

/// Publishing side of one context's connection to a channel.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    origin_id: ContextId,
    channel: String,
    sender: Option<broadcast::Sender<SyncMessage>>,
    clock: Arc<dyn Clock>,
    peers: Arc<Mutex<HashMap<ContextId, PeerPresence>>>,
}

impl Broadcaster {
    /// A broadcaster with no channel behind it. Publishing is a no-op and
    /// subscriptions never yield a message.
    pub fn disabled(origin_id: ContextId, clock: Arc<dyn Clock>) -> Self {
        Self {
            origin_id,
            channel: String::new(),
            sender: None,
            clock,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the identity this broadcaster stamps on messages.
    pub fn origin_id(&self) -> ContextId {
        self.origin_id
    }

    /// Returns the channel name (empty when disabled).
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns false in single-context mode.
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Returns the clock used to stamp messages.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Stamps and publishes a message. Returns the stamped message, or `None`
    /// in single-context mode.
    ///
    /// No acknowledgment: a send with no live subscribers is silently dropped.
    pub fn broadcast(&self, message: OutgoingMessage) -> Option<SyncMessage> {
        let sender = self.sender.as_ref()?;
        let stamped = message.stamp(self.origin_id, self.clock.now_ms());
        if sender.send(stamped.clone()).is_err() {
            debug!("No subscribers on {}, message dropped", self.channel);
        }
        Some(stamped)
    }

    /// Starts receiving messages and announces this context with a
    /// `presence` message.
    pub fn subscribe(&self) -> Subscription {
        let receiver = self.sender.as_ref().map(|s| s.subscribe());
        self.broadcast(OutgoingMessage::presence());
        Subscription {
            origin_id: self.origin_id,
            receiver,
            peers: self.peers.clone(),
        }
    }

    /// Other contexts this one has heard from, in no particular order.
    pub fn peers(&self) -> Vec<PeerPresence> {
        self.peers.lock().values().cloned().collect()
    }
}

/// Receiving side of a context's connection. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    origin_id: ContextId,
    receiver: Option<broadcast::Receiver<SyncMessage>>,
    peers: Arc<Mutex<HashMap<ContextId, PeerPresence>>>,
}

impl Subscription {
    /// Waits for the next message from another context. Returns `None` once
    /// the channel is gone (or immediately in single-context mode).
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if let Some(message) = accept(self.origin_id, &self.peers, message) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.receiver = None;
        None
    }

    /// Returns the next already-delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(message) => {
                    if let Some(message) = accept(self.origin_id, &self.peers, message) {
                        return Some(message);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} messages dropped", skipped);
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => break,
            }
        }
        self.receiver = None;
        None
    }

    /// Returns true while the subscription can still yield messages.
    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Unsubscribes. Messages not yet received are discarded.
    pub fn close(self) {}
}

/// Drops our own echoes and records the sender's presence.
fn accept(
    origin_id: ContextId,
    peers: &Mutex<HashMap<ContextId, PeerPresence>>,
    message: SyncMessage,
) -> Option<SyncMessage> {
    if message.origin_id == origin_id {
        return None;
    }

    let presence = PeerPresence {
        origin_id: message.origin_id,
        user_id: message.user_id.clone(),
        last_seen: message.timestamp,
    };
    peers.lock().insert(message.origin_id, presence);

    if message.kind == MessageKind::Presence {
        debug!("Context {} is present", message.origin_id);
    }
    Some(message)
}
