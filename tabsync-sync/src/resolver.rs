//! Conflict-aware local resolver.
//!
//! Extends the naive mirror with a short "in-flight" window after each local
//! write. A write from another context that lands while our own write is
//! still in flight is handed to a conflict-detection predicate instead of
//! silently overwriting our value.
//!
//! Per key: `idle -> pending (window, default 10s) -> idle`. The pending
//! marker expires lazily: it is considered gone once the clock has moved past
//! the window, with no timer task to cancel.

use crate::broadcast::{Broadcaster, Subscription};
use crate::conflict::{Conflict, ConflictLog, ConflictSide, ResolutionStrategy};
use crate::error::SyncResult;
use crate::protocol::{decode, encode, ConflictMetadata, MessageKind, OutgoingMessage, SyncMessage};
use crate::reactive::ReactiveValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tabsync_types::{ConflictId, SyncValue, UserId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for a [`ConflictAwareValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long a local write stays in flight (ms).
    pub pending_window_ms: u64,
    /// Strategy applied as soon as a conflict is detected. `None` (or
    /// `Manual`) leaves conflicts pending for the caller.
    pub auto_resolve: Option<ResolutionStrategy>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            pending_window_ms: 10_000,
            auto_resolve: None,
        }
    }
}

impl ResolverConfig {
    /// The in-flight window as a `Duration`.
    pub fn pending_window(&self) -> Duration {
        Duration::from_millis(self.pending_window_ms)
    }
}

/// Decides whether an incoming write conflicts with our in-flight one.
/// Arguments: `(pending_value, pending_meta, incoming_value, incoming_meta)`.
pub type ConflictDetector<T> =
    Arc<dyn Fn(&T, &ConflictMetadata, &T, &ConflictMetadata) -> bool + Send + Sync>;

/// Values differ, writers differ, and the writes are less than `window_ms` apart.
pub fn default_detector<T: SyncValue>(window_ms: u64) -> ConflictDetector<T> {
    Arc::new(move |local, local_meta, remote, remote_meta| {
        local != remote
            && local_meta.origin_id != remote_meta.origin_id
            && local_meta.timestamp.abs_diff(remote_meta.timestamp) < window_ms
    })
}

/// What handling a received message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Not for us, or not decodable.
    Ignored,
    /// Applied to the local value.
    Applied,
    /// Recorded as a pending conflict; the local value is unchanged.
    Conflict(ConflictId),
    /// Recorded and settled immediately with the auto-resolve strategy.
    AutoResolved(ConflictId),
}

struct PendingWrite<T> {
    value: T,
    metadata: ConflictMetadata,
    version: u64,
}

struct ResolverState<T> {
    pending: Option<PendingWrite<T>>,
    conflicts: ConflictLog<T>,
    version: u64,
    user_id: Option<UserId>,
}

struct ResolverInner<T> {
    key: String,
    default: T,
    config: ResolverConfig,
    value: ReactiveValue<T>,
    broadcaster: Broadcaster,
    state: Mutex<ResolverState<T>>,
    subscription: Mutex<Option<Subscription>>,
    detector: ConflictDetector<T>,
}

/// A mirrored value that notices concurrent writes.
#[derive(Clone)]
pub struct ConflictAwareValue<T: SyncValue> {
    inner: Arc<ResolverInner<T>>,
}

impl<T: SyncValue> fmt::Debug for ConflictAwareValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictAwareValue")
            .field("key", &self.inner.key)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: SyncValue> ConflictAwareValue<T> {
    /// Creates a resolver using [`default_detector`] over the pending window.
    pub fn new(
        key: impl Into<String>,
        default: T,
        broadcaster: Broadcaster,
        config: ResolverConfig,
    ) -> Self {
        let detector = default_detector(config.pending_window_ms);
        Self::with_detector(key, default, broadcaster, config, detector)
    }

    /// Creates a resolver with a custom detection predicate.
    pub fn with_detector(
        key: impl Into<String>,
        default: T,
        broadcaster: Broadcaster,
        config: ResolverConfig,
        detector: ConflictDetector<T>,
    ) -> Self {
        let subscription = broadcaster.subscribe();
        Self {
            inner: Arc::new(ResolverInner {
                key: key.into(),
                value: ReactiveValue::new(default.clone()),
                default,
                config,
                broadcaster,
                state: Mutex::new(ResolverState {
                    pending: None,
                    conflicts: ConflictLog::new(),
                    version: 0,
                    user_id: None,
                }),
                subscription: Mutex::new(Some(subscription)),
                detector,
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

    /// Returns the local write counter.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    /// Attributes subsequent writes to `user_id`.
    pub fn set_user(&self, user_id: Option<UserId>) {
        self.inner.state.lock().user_id = user_id;
    }

    /// Returns the in-flight write, if its window has not elapsed.
    pub fn pending_update(&self) -> Option<(T, ConflictMetadata)> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        self.expire_pending(&mut state, now);
        state
            .pending
            .as_ref()
            .map(|p| (p.value.clone(), p.metadata.clone()))
    }

    /// Replaces the value, marks it in flight and broadcasts it.
    pub fn set(&self, value: T) -> T {
        self.update(move |_| value)
    }

    /// Applies `f`, marks the result in flight, broadcasts and returns it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let resolved = self.inner.value.update(f);
        let now = self.now();
        let origin_id = self.inner.broadcaster.origin_id();

        let (version, user_id) = {
            let mut state = self.inner.state.lock();
            state.version += 1;
            let metadata =
                ConflictMetadata::local(&self.inner.key, now, origin_id, state.user_id.clone());
            state.pending = Some(PendingWrite {
                value: resolved.clone(),
                metadata,
                version: state.version,
            });
            (state.version, state.user_id.clone())
        };

        self.publish(&resolved, version, user_id);
        resolved
    }

    /// Resets to the default and tells other contexts to do the same.
    pub fn delete(&self) {
        let (version, user_id) = {
            let mut state = self.inner.state.lock();
            state.version += 1;
            state.pending = None;
            (state.version, state.user_id.clone())
        };
        self.inner.value.set(self.inner.default.clone());
        self.inner.broadcaster.broadcast(
            OutgoingMessage::value_delete(&self.inner.key)
                .with_user(user_id)
                .with_version(version),
        );
    }

    /// Handles a message from another context.
    pub fn handle_message(&self, message: &SyncMessage) -> MessageOutcome {
        if message.origin_id == self.inner.broadcaster.origin_id()
            || !message.targets(&self.inner.key)
        {
            return MessageOutcome::Ignored;
        }

        if message.kind == MessageKind::ValueDelete {
            let mut state = self.inner.state.lock();
            adopt_version(&mut state.version, message.version);
            drop(state);
            self.inner.value.set(self.inner.default.clone());
            return MessageOutcome::Applied;
        }

        let Some(remote) = message.value.as_ref().and_then(|v| decode::<T>(&self.inner.key, v))
        else {
            return MessageOutcome::Ignored;
        };
        let Some(remote_meta) = ConflictMetadata::from_message(message) else {
            return MessageOutcome::Ignored;
        };

        let now = self.now();
        let mut state = self.inner.state.lock();
        self.expire_pending(&mut state, now);

        let conflicting = state.pending.as_ref().filter(|p| {
            (self.inner.detector)(&p.value, &p.metadata, &remote, &remote_meta)
        });

        let Some(pending) = conflicting else {
            adopt_version(&mut state.version, message.version);
            drop(state);
            debug!("Applied {} from {}", self.inner.key, message.origin_id);
            self.inner.value.set(remote);
            return MessageOutcome::Applied;
        };

        let conflict = Conflict::new(
            &self.inner.key,
            self.inner.broadcaster.origin_id(),
            ConflictSide {
                value: pending.value.clone(),
                timestamp: pending.metadata.timestamp,
                version: pending.version,
                user_id: pending.metadata.user_id.clone(),
            },
            ConflictSide {
                value: remote,
                timestamp: message.timestamp,
                version: message.version.unwrap_or_default(),
                user_id: message.user_id.clone(),
            },
        );
        let id = state.conflicts.record(conflict);
        drop(state);

        info!(
            "Conflict {} on {} with context {}",
            id, self.inner.key, message.origin_id
        );

        match self.inner.config.auto_resolve {
            Some(strategy) if strategy != ResolutionStrategy::Manual => {
                match self.resolve_conflict_by_id(id, strategy, None) {
                    Ok(_) => MessageOutcome::AutoResolved(id),
                    Err(e) => {
                        debug!("Auto-resolve of {} failed: {}", id, e);
                        MessageOutcome::Conflict(id)
                    }
                }
            }
            _ => MessageOutcome::Conflict(id),
        }
    }

    /// Settles a pending conflict, applies and re-broadcasts the result.
    pub fn resolve_conflict_by_id(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        custom: Option<T>,
    ) -> SyncResult<T> {
        let (resolved, version, user_id) = {
            let mut state = self.inner.state.lock();
            let conflict = state.conflicts.pending(id)?;
            let resolved = conflict.resolution(strategy, custom)?;
            let version = state.version.max(conflict.local_version).max(conflict.remote_version) + 1;
            state.conflicts.mark_resolved(id, resolved.clone(), strategy)?;
            state.version = version;
            state.pending = None;
            (resolved, version, state.user_id.clone())
        };

        self.inner.value.set(resolved.clone());
        self.publish(&resolved, version, user_id);
        info!("Resolved conflict {} on {} with {:?}", id, self.inner.key, strategy);
        Ok(resolved)
    }

    /// Marks a conflict ignored. The value stays whatever was last applied.
    pub fn ignore_conflict(&self, id: ConflictId) -> SyncResult<()> {
        self.inner.state.lock().conflicts.mark_ignored(id)
    }

    /// Every conflict still in the list.
    pub fn conflicts(&self) -> Vec<Conflict<T>> {
        self.inner.state.lock().conflicts.all()
    }

    /// Conflicts awaiting action.
    pub fn pending_conflicts(&self) -> Vec<Conflict<T>> {
        self.inner.state.lock().conflicts.pending_list()
    }

    /// Drops resolved and ignored conflicts from the list.
    pub fn clear_resolved_conflicts(&self) -> usize {
        self.inner.state.lock().conflicts.clear_settled()
    }

    /// Handles every message already delivered.
    pub fn pump(&self) -> Vec<MessageOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = self.inner.subscription.lock().as_mut().and_then(|s| s.try_recv());
            let Some(message) = next else { break };
            outcomes.push(self.handle_message(&message));
        }
        outcomes
    }

    /// Moves message handling onto a background task.
    pub fn listen(&self) -> JoinHandle<()> {
        let subscription = self.inner.subscription.lock().take();
        let resolver = self.clone();
        tokio::spawn(async move {
            let Some(mut subscription) = subscription else { return };
            while let Some(message) = subscription.recv().await {
                resolver.handle_message(&message);
            }
        })
    }

    fn publish(&self, value: &T, version: u64, user_id: Option<UserId>) {
        if let Some(encoded) = encode(&self.inner.key, value) {
            self.inner.broadcaster.broadcast(
                OutgoingMessage::value_update(&self.inner.key, encoded)
                    .with_user(user_id)
                    .with_version(version),
            );
        }
    }

    fn expire_pending(&self, state: &mut ResolverState<T>, now: u64) {
        let window = self.inner.config.pending_window_ms;
        if state
            .pending
            .as_ref()
            .is_some_and(|p| now.saturating_sub(p.metadata.timestamp) >= window)
        {
            debug!("In-flight write on {} expired", self.inner.key);
            state.pending = None;
        }
    }

    fn now(&self) -> u64 {
        self.inner.broadcaster.clock().now_ms()
    }
}

fn adopt_version(version: &mut u64, incoming: Option<u64>) {
    if let Some(incoming) = incoming {
        *version = (*version).max(incoming);
    }
}
