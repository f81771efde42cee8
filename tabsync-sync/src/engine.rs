//! Server sync engine.
//!
//! The authoritative reconciliation point between a local reactive value, a
//! bounded delivery queue and a versioned remote store.
//!
//! Writes are optimistic: `set`/`update` change the local value, bump the
//! version, queue the write and broadcast it to other contexts before any
//! network round trip. Delivery happens later in [`ServerSyncEngine::drain`],
//! which compares each write against the remote envelope (a lightweight
//! compare-and-swap on the version) and raises a [`Conflict`] when someone
//! else wrote a version this write did not build on within the conflict
//! window.
//!
//! Nothing here returns an error out of the background loop: failures are
//! logged, reflected in [`SyncStatus`] and emitted as [`SyncEvent`]s.

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::EngineConfig;
use crate::conflict::{Conflict, ConflictLog, ConflictSide, ResolutionStrategy};
use crate::error::{SyncError, SyncResult};
use crate::identity::{resolve_user, IdentityProvider, NoIdentity};
use crate::network::{AlwaysOnline, NetworkMonitor};
use crate::protocol::{decode, encode, MessageKind, OutgoingMessage, SyncMessage};
use crate::queue::{SyncQueue, SyncQueueItem};
use crate::reactive::ReactiveValue;
use crate::state::{EngineState, SyncEvent, SyncStatus};
use crate::store::{read_envelope, write_envelope, KeyValueStore, RemoteEnvelope};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tabsync_types::{Clock, ConflictId, ContextId, SyncValue, SystemClock, UserId};
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Buffered engine events per subscriber.
const EVENT_CAPACITY: usize = 64;

/// Result of one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing stored remotely yet.
    NoRemote,
    /// Remote version is not ahead of ours.
    UpToDate,
    /// Remote value and version were adopted.
    Adopted { version: u64 },
    /// A fresh remote write disagreed with ours; left pending.
    Conflict(ConflictId),
    /// A fresh remote write disagreed with ours and was auto-resolved.
    Resolved(ConflictId),
    /// Offline; nothing attempted.
    Skipped,
    /// The store failed. Status is `Error`.
    Failed,
}

enum PushOutcome {
    Delivered,
    Conflict,
}

/// Builds a [`ServerSyncEngine`].
pub struct EngineBuilder<T: SyncValue> {
    key: String,
    default: T,
    store: Arc<dyn KeyValueStore>,
    config: EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    network: Arc<dyn NetworkMonitor>,
    clock: Arc<dyn Clock>,
    broadcaster: Option<Broadcaster>,
}

impl<T: SyncValue> EngineBuilder<T> {
    /// Overrides the default configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the identity provider used to attribute writes.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the connectivity monitor.
    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    /// Sets the clock used to stamp writes and judge freshness.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connects the engine to other contexts. Without one the engine runs
    /// in single-context mode under a fresh identity.
    pub fn broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Builds the engine and subscribes it to the broadcast channel.
    pub fn build(self) -> ServerSyncEngine<T> {
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Broadcaster::disabled(ContextId::new(), self.clock.clone()));
        let subscription = broadcaster.subscribe();
        let online = self.network.is_online();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let state = EngineState {
            version: 0,
            status: if online {
                SyncStatus::Synced
            } else {
                SyncStatus::Offline
            },
            queue: SyncQueue::new(self.config.max_queue_size),
            dead_letters: SyncQueue::new(self.config.dead_letter_capacity),
            conflicts: ConflictLog::new(),
            last_sync_time: None,
            last_local_write: 0,
            user_id: None,
            online,
        };

        ServerSyncEngine {
            inner: Arc::new(EngineInner {
                value: ReactiveValue::new(self.default.clone()),
                key: self.key,
                default: self.default,
                config: self.config,
                state: Mutex::new(state),
                store: self.store,
                identity: self.identity,
                network: self.network,
                clock: self.clock,
                broadcaster,
                subscription: Mutex::new(Some(subscription)),
                drain_guard: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                events,
            }),
        }
    }
}

struct EngineInner<T> {
    key: String,
    default: T,
    config: EngineConfig,
    value: ReactiveValue<T>,
    state: Mutex<EngineState<T>>,
    store: Arc<dyn KeyValueStore>,
    identity: Arc<dyn IdentityProvider>,
    network: Arc<dyn NetworkMonitor>,
    clock: Arc<dyn Clock>,
    broadcaster: Broadcaster,
    subscription: Mutex<Option<Subscription>>,
    /// Held for the duration of a drain; drains never overlap.
    drain_guard: tokio::sync::Mutex<()>,
    /// Signalled whenever the queue gains an item.
    wake: Notify,
    events: broadcast::Sender<SyncEvent>,
}

/// Keeps one key in sync with the remote store and with other contexts.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ServerSyncEngine<T: SyncValue> {
    inner: Arc<EngineInner<T>>,
}

impl<T: SyncValue> fmt::Debug for ServerSyncEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSyncEngine")
            .field("key", &self.inner.key)
            .field("context", &self.inner.broadcaster.origin_id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T: SyncValue> ServerSyncEngine<T> {
    /// Starts building an engine for `key` over `store`, with `default` as the
    /// initial local value.
    pub fn builder(
        key: impl Into<String>,
        default: T,
        store: Arc<dyn KeyValueStore>,
    ) -> EngineBuilder<T> {
        EngineBuilder {
            key: key.into(),
            default,
            store,
            config: EngineConfig::default(),
            identity: Arc::new(NoIdentity),
            network: Arc::new(AlwaysOnline::default()),
            clock: Arc::new(SystemClock),
            broadcaster: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.broadcaster.origin_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the current local value.
    pub fn value(&self) -> T {
        self.inner.value.get()
    }

    /// Watches the local value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.value.subscribe()
    }

    /// Receives engine events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.lock().status
    }

    /// Writes waiting for delivery.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Copy of the queued writes, head first.
    pub fn queued_items(&self) -> Vec<SyncQueueItem<T>> {
        self.inner.state.lock().queue.iter().cloned().collect()
    }

    /// Time (ms) of the last successful delivery or adoption.
    pub fn last_sync_time(&self) -> Option<u64> {
        self.inner.state.lock().last_sync_time
    }

    /// Every conflict this engine has recorded.
    pub fn conflicts(&self) -> Vec<Conflict<T>> {
        self.inner.state.lock().conflicts.all()
    }

    /// Conflicts awaiting action.
    pub fn pending_conflicts(&self) -> Vec<Conflict<T>> {
        self.inner.state.lock().conflicts.pending_list()
    }

    /// Writes dropped after exhausting their retries.
    pub fn dead_letters(&self) -> Vec<SyncQueueItem<T>> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    // ── Write path ───────────────────────────────────────────────

    /// Replaces the value. See [`update`](Self::update).
    pub fn set(&self, value: T) -> T {
        self.update(move |_| value)
    }

    /// Applies `f` to the current value, queues the result for delivery,
    /// broadcasts it to other contexts and returns it. Remote confirmation
    /// happens later.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let (resolved, version, user_id) = self.write_local(f);
        if let Some(encoded) = encode(&self.inner.key, &resolved) {
            self.inner.broadcaster.broadcast(
                OutgoingMessage::value_update(&self.inner.key, encoded)
                    .with_user(user_id)
                    .with_version(version),
            );
        }
        resolved
    }

    /// Resets the value to the default. The reset is versioned and delivered
    /// like any other write; other contexts are told with `value-delete`.
    pub fn delete(&self) {
        let default = self.inner.default.clone();
        let (_, version, user_id) = self.write_local(move |_| default);
        self.inner.broadcaster.broadcast(
            OutgoingMessage::value_delete(&self.inner.key)
                .with_user(user_id)
                .with_version(version),
        );
    }

    /// Publishes a UI notification to other contexts.
    pub fn notify(&self, text: impl Into<String>) {
        let user_id = self.inner.state.lock().user_id.clone();
        self.inner
            .broadcaster
            .broadcast(OutgoingMessage::notification(text).with_user(user_id));
    }

    fn write_local(&self, f: impl FnOnce(&T) -> T) -> (T, u64, Option<UserId>) {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let resolved = self.inner.value.update(f);

        state.version += 1;
        state.last_local_write = now;
        let item = SyncQueueItem::new(
            &self.inner.key,
            resolved.clone(),
            now,
            state.version,
            self.context_id(),
            state.user_id.clone(),
        );
        self.enqueue(&mut state, item);
        let version = state.version;
        let user_id = state.user_id.clone();
        drop(state);

        self.inner.wake.notify_one();
        (resolved, version, user_id)
    }

    // ── Queue drain ──────────────────────────────────────────────

    /// Makes one delivery pass over the queue: every item present when the
    /// pass starts is attempted at most once. Returns how many were delivered.
    ///
    /// A pass requested while another is running returns 0 immediately.
    pub async fn drain(&self) -> usize {
        let Ok(_guard) = self.inner.drain_guard.try_lock() else {
            debug!("Drain of {} already running", self.inner.key);
            return 0;
        };

        if !self.is_online() {
            return 0;
        }
        self.refresh_identity().await;

        let budget = {
            let mut state = self.inner.state.lock();
            if state.queue.is_empty() {
                return 0;
            }
            self.set_status(&mut state, SyncStatus::Syncing);
            state.queue.len()
        };

        let mut delivered = 0;
        for _ in 0..budget {
            let now = self.now();
            let item = {
                let mut state = self.inner.state.lock();
                if !state.online {
                    break;
                }
                match state.queue.pop() {
                    Some(item) if item.is_due(now) => item,
                    Some(item) => {
                        state.queue.push(item);
                        continue;
                    }
                    None => break,
                }
            };

            match self.push_item(&item).await {
                Ok(PushOutcome::Delivered) => {
                    delivered += 1;
                    let mut state = self.inner.state.lock();
                    state.last_sync_time = Some(now);
                    if state.queue.is_empty() && !state.conflicts.has_pending() {
                        self.set_status(&mut state, SyncStatus::Synced);
                    }
                    self.emit(SyncEvent::Delivered {
                        item_id: item.id,
                        version: item.version,
                    });
                }
                Ok(PushOutcome::Conflict) => self.record_failure(item, now),
                Err(e) => {
                    warn!(
                        "Delivery of {} v{} failed: {}",
                        self.inner.key, item.version, e
                    );
                    self.emit(SyncEvent::Error {
                        message: e.to_string(),
                    });
                    self.record_failure(item, now);
                }
            }
        }

        let mut state = self.inner.state.lock();
        if state.status == SyncStatus::Syncing {
            self.settle_status(&mut state);
        }
        drop(state);

        delivered
    }

    fn record_failure(&self, mut item: SyncQueueItem<T>, now: u64) {
        let mut state = self.inner.state.lock();
        if item.retries < self.inner.config.max_retries {
            item.retries += 1;
            item.not_before = self
                .inner
                .config
                .backoff_for(item.retries)
                .map(|delay| now.saturating_add(delay));
            state.queue.push(item);
            return;
        }

        warn!(
            "Dropping write {} v{} after {} attempts",
            self.inner.key,
            item.version,
            item.retries + 1
        );
        self.emit(SyncEvent::ItemDropped {
            item_id: item.id,
            version: item.version,
        });
        state.dead_letters.push(item);
        self.set_status(&mut state, SyncStatus::Error);
    }

    /// Delivers one write unless it conflicts with a concurrent remote write.
    async fn push_item(&self, item: &SyncQueueItem<T>) -> SyncResult<PushOutcome> {
        let store = self.inner.store.as_ref();
        let remote = read_envelope::<T>(store, &self.inner.key).await?;

        if let Some(remote) = remote {
            let concurrent =
                item.timestamp.abs_diff(remote.timestamp) < self.inner.config.conflict_window_ms;
            let diverged = remote.version != item.version.saturating_sub(1);
            if concurrent && diverged {
                let local = ConflictSide {
                    value: item.value.clone(),
                    timestamp: item.timestamp,
                    version: item.version,
                    user_id: item.user_id.clone(),
                };
                let id = self.raise_conflict(local, remote.into());

                let strategy = self.inner.config.auto_resolve;
                if strategy == ResolutionStrategy::Manual {
                    return Ok(PushOutcome::Conflict);
                }
                self.resolve_conflict(id, strategy, None).await?;
                return Ok(PushOutcome::Delivered);
            }
        }

        let envelope = RemoteEnvelope {
            value: item.value.clone(),
            timestamp: item.timestamp,
            version: item.version,
            user_id: item.user_id.clone(),
        };
        write_envelope(store, &self.inner.key, &envelope).await?;
        debug!("Delivered {} v{}", self.inner.key, item.version);
        Ok(PushOutcome::Delivered)
    }

    /// Gives writes dropped after retry exhaustion another round of retries.
    pub fn requeue_dead_letters(&self) -> usize {
        let mut state = self.inner.state.lock();
        let dead = state.dead_letters.drain_all();
        let count = dead.len();
        for mut item in dead {
            item.retries = 0;
            item.not_before = None;
            self.enqueue(&mut state, item);
        }
        drop(state);

        if count > 0 {
            info!("Requeued {} dropped writes for {}", count, self.inner.key);
            self.inner.wake.notify_one();
        }
        count
    }

    // ── Pull path ────────────────────────────────────────────────

    /// Reads the remote envelope and adopts it if it is ahead of us. A fresh
    /// remote write that disagrees with a non-initial local value is raised
    /// as a conflict instead.
    pub async fn pull_from_server(&self) -> PullOutcome {
        if !self.is_online() {
            return PullOutcome::Skipped;
        }

        match self.pull_inner().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Pull of {} failed: {}", self.inner.key, e);
                let mut state = self.inner.state.lock();
                self.set_status(&mut state, SyncStatus::Error);
                self.emit(SyncEvent::Error {
                    message: e.to_string(),
                });
                PullOutcome::Failed
            }
        }
    }

    async fn pull_inner(&self) -> SyncResult<PullOutcome> {
        let Some(remote) = read_envelope::<T>(self.inner.store.as_ref(), &self.inner.key).await?
        else {
            let mut state = self.inner.state.lock();
            self.settle_status(&mut state);
            return Ok(PullOutcome::NoRemote);
        };
        let now = self.now();

        let local = {
            let mut state = self.inner.state.lock();
            if remote.version <= state.version {
                self.settle_status(&mut state);
                return Ok(PullOutcome::UpToDate);
            }

            let fresh = now.abs_diff(remote.timestamp) < self.inner.config.conflict_window_ms;
            let current = self.inner.value.get();
            if fresh && state.version != 0 && current != remote.value {
                ConflictSide {
                    value: current,
                    timestamp: state.last_local_write,
                    version: state.version,
                    user_id: state.user_id.clone(),
                }
            } else {
                let version = remote.version;
                self.inner.value.set(remote.value);
                state.version = version;
                state.last_sync_time = Some(now);
                self.settle_status(&mut state);
                drop(state);

                info!("Adopted remote {} v{}", self.inner.key, version);
                self.emit(SyncEvent::RemoteAdopted { version });
                return Ok(PullOutcome::Adopted { version });
            }
        };

        let id = self.raise_conflict(local, remote.into());
        let strategy = self.inner.config.auto_resolve;
        if strategy == ResolutionStrategy::Manual {
            return Ok(PullOutcome::Conflict(id));
        }
        self.resolve_conflict(id, strategy, None).await?;
        Ok(PullOutcome::Resolved(id))
    }

    /// Pulls once; call at startup before the first write.
    pub async fn hydrate(&self) -> PullOutcome {
        self.refresh_identity().await;
        self.pull_from_server().await
    }

    // ── Conflicts ────────────────────────────────────────────────

    fn raise_conflict(&self, local: ConflictSide<T>, remote: ConflictSide<T>) -> ConflictId {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.conflicts.find_pending(local.version, remote.version) {
            self.set_status(&mut state, SyncStatus::Conflict);
            return existing;
        }

        let conflict = Conflict::new(&self.inner.key, self.context_id(), local, remote);
        info!(
            "Conflict on {}: local v{} vs remote v{}, fields {:?}",
            self.inner.key, conflict.local_version, conflict.remote_version, conflict.field_changes
        );
        let id = state.conflicts.record(conflict);
        self.set_status(&mut state, SyncStatus::Conflict);
        self.emit(SyncEvent::ConflictDetected {
            id,
            key: self.inner.key.clone(),
        });
        id
    }

    /// Settles a pending conflict: applies the resolution locally at
    /// `max(local, remote) + 1`, persists it, broadcasts it and drops queued
    /// writes the resolution supersedes.
    ///
    /// `custom` is required for [`ResolutionStrategy::Manual`].
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        custom: Option<T>,
    ) -> SyncResult<T> {
        let now = self.now();
        let (resolved, version, user_id) = {
            let mut state = self.inner.state.lock();
            let conflict = state.conflicts.pending(id)?;
            let resolved = conflict.resolution(strategy, custom)?;
            let version = state.version.max(conflict.resolved_version() - 1) + 1;

            state.conflicts.mark_resolved(id, resolved.clone(), strategy)?;
            state.version = version;
            self.inner.value.set(resolved.clone());
            let superseded = state
                .queue
                .retain(|item| item.version > conflict.local_version);
            if superseded > 0 {
                debug!("Resolution of {} superseded {} queued writes", id, superseded);
            }
            (resolved, version, state.user_id.clone())
        };

        let envelope = RemoteEnvelope {
            value: resolved.clone(),
            timestamp: now,
            version,
            user_id: user_id.clone(),
        };
        if let Err(e) = write_envelope(self.inner.store.as_ref(), &self.inner.key, &envelope).await
        {
            warn!("Persisting resolution {} failed, queued for retry: {}", id, e);
            self.emit(SyncEvent::Error {
                message: e.to_string(),
            });
            let item = SyncQueueItem::new(
                &self.inner.key,
                resolved.clone(),
                now,
                version,
                self.context_id(),
                user_id.clone(),
            );
            let mut state = self.inner.state.lock();
            self.enqueue(&mut state, item);
            drop(state);
            self.inner.wake.notify_one();
        }

        if let Some(encoded) = encode(&self.inner.key, &resolved) {
            self.inner.broadcaster.broadcast(
                OutgoingMessage::value_update(&self.inner.key, encoded)
                    .with_user(user_id)
                    .with_version(version),
            );
        }

        {
            let mut state = self.inner.state.lock();
            if !state.conflicts.has_pending() {
                self.set_status(&mut state, SyncStatus::Synced);
            }
        }
        info!("Resolved conflict {} on {} with {:?}", id, self.inner.key, strategy);
        self.emit(SyncEvent::ConflictResolved { id, strategy });
        Ok(resolved)
    }

    /// Marks a conflict ignored without touching the value.
    pub fn ignore_conflict(&self, id: ConflictId) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        state.conflicts.mark_ignored(id)?;
        if !state.conflicts.has_pending() && state.status == SyncStatus::Conflict {
            self.settle_status(&mut state);
        }
        Ok(())
    }

    /// Drops settled conflicts from the list. Returns how many were removed.
    pub fn clear_resolved_conflicts(&self) -> usize {
        self.inner.state.lock().conflicts.clear_settled()
    }

    // ── Connectivity ─────────────────────────────────────────────

    /// Applies a connectivity transition. Going offline keeps the queue and
    /// suspends delivery; coming back triggers [`force_sync`](Self::force_sync).
    pub async fn set_online(&self, online: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.online == online {
                return;
            }
            state.online = online;
            if online {
                info!("Back online, resyncing {}", self.inner.key);
                self.set_status(&mut state, SyncStatus::Synced);
            } else {
                info!(
                    "Offline, holding {} queued writes for {}",
                    state.queue.len(),
                    self.inner.key
                );
                self.set_status(&mut state, SyncStatus::Offline);
            }
        }

        if online {
            if let Err(e) = self.force_sync().await {
                debug!("Resync of {} skipped: {}", self.inner.key, e);
            }
        }
    }

    /// Drains the queue and pulls, now.
    pub async fn force_sync(&self) -> SyncResult<()> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.drain().await;
        self.pull_from_server().await;
        Ok(())
    }

    // ── Incoming messages ────────────────────────────────────────

    /// Applies a message from another context. Returns true if the local
    /// value changed. Never re-broadcasts.
    pub fn handle_message(&self, message: &SyncMessage) -> bool {
        if message.origin_id == self.context_id() {
            return false;
        }

        match message.kind {
            MessageKind::Notification => {
                if let Some(Value::String(text)) = &message.value {
                    self.emit(SyncEvent::Notification {
                        origin_id: message.origin_id,
                        text: text.clone(),
                    });
                }
                false
            }
            MessageKind::Presence => false,
            MessageKind::ValueUpdate | MessageKind::ValueDelete => {
                if !message.targets(&self.inner.key) {
                    return false;
                }
                let value = if message.kind == MessageKind::ValueDelete {
                    self.inner.default.clone()
                } else {
                    match message.value.as_ref().and_then(|v| decode(&self.inner.key, v)) {
                        Some(value) => value,
                        None => return false,
                    }
                };

                let mut state = self.inner.state.lock();
                if let Some(version) = message.version {
                    state.version = state.version.max(version);
                }
                self.inner.value.set(value);
                debug!("Mirrored {} from {}", self.inner.key, message.origin_id);
                true
            }
        }
    }

    /// Handles every message already delivered. Returns how many changed the value.
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

    // ── Background task ──────────────────────────────────────────

    /// Runs the engine on a single background task: a drain-and-pull tick
    /// every sync interval (the first one immediately), a drain whenever a
    /// write is queued, connectivity transitions, and incoming messages.
    pub fn spawn(&self) -> EngineHandle {
        let engine = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut subscription = self.inner.subscription.lock().take();
        let mut network = self.inner.network.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.config.sync_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut listening = subscription.as_ref().is_some_and(Subscription::is_active);
            let mut watching_network = true;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        engine.refresh_identity().await;
                        engine.drain().await;
                        engine.pull_from_server().await;
                    }
                    _ = engine.inner.wake.notified() => {
                        engine.drain().await;
                    }
                    changed = network.changed(), if watching_network => match changed {
                        Ok(()) => {
                            let online = *network.borrow_and_update();
                            engine.set_online(online).await;
                        }
                        Err(_) => watching_network = false,
                    },
                    message = next_message(&mut subscription), if listening => match message {
                        Some(message) => {
                            engine.handle_message(&message);
                        }
                        None => listening = false,
                    },
                }
            }
            debug!("Sync task for {} stopped", engine.inner.key);
        });

        EngineHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    // ── Internals ────────────────────────────────────────────────

    /// Appends to the queue, reporting the write evicted to make room.
    fn enqueue(&self, state: &mut EngineState<T>, item: SyncQueueItem<T>) {
        if let Some(evicted) = state.queue.push(item) {
            warn!(
                "Sync queue for {} full, evicted write v{}",
                self.inner.key, evicted.version
            );
            self.emit(SyncEvent::ItemDropped {
                item_id: evicted.id,
                version: evicted.version,
            });
        }
    }

    async fn refresh_identity(&self) {
        let user_id = resolve_user(self.inner.identity.as_ref()).await;
        self.inner.state.lock().user_id = user_id;
    }

    fn set_status(&self, state: &mut EngineState<T>, status: SyncStatus) {
        let status = if state.online {
            status
        } else {
            SyncStatus::Offline
        };
        if state.status != status {
            debug!("{}: {} -> {}", self.inner.key, state.status, status);
            state.status = status;
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    /// Derives the status from what is outstanding.
    fn settle_status(&self, state: &mut EngineState<T>) {
        let status = if state.conflicts.has_pending() {
            SyncStatus::Conflict
        } else if state.status == SyncStatus::Error && !state.queue.is_empty() {
            SyncStatus::Error
        } else if state.queue.is_empty() {
            SyncStatus::Synced
        } else {
            SyncStatus::Syncing
        };
        self.set_status(state, status);
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }
}

impl<T> From<RemoteEnvelope<T>> for ConflictSide<T> {
    fn from(envelope: RemoteEnvelope<T>) -> Self {
        Self {
            value: envelope.value,
            timestamp: envelope.timestamp,
            version: envelope.version,
            user_id: envelope.user_id,
        }
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<SyncMessage> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => None,
    }
}

/// Handle to a running engine task.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Stops the task and waits for it. An in-flight push finishes first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }

    /// Returns true once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
