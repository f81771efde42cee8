//! Cross-context state mirroring and server sync for tabsync.
//!
//! Keeps one keyed value consistent across several execution contexts of a
//! client session (tabs, windows, workers) and a remote key-value store.
//!
//! # Architecture
//!
//! Four layers, each usable on its own:
//!
//! - **Broadcast**: fire-and-forget pub/sub between contexts on a named
//!   channel ([`BroadcastHub`], [`Broadcaster`], [`Subscription`])
//! - **Mirror**: a reactive value that publishes local writes and applies
//!   writes from other contexts, last write wins ([`SyncedValue`])
//! - **Resolver**: the mirror plus version counters and detection of
//!   concurrent writes within a pending window ([`ConflictAwareValue`])
//! - **Engine**: optimistic local writes, a bounded retrying delivery queue,
//!   a versioned remote envelope and periodic pulls ([`ServerSyncEngine`])
//!
//! The outside world is reached only through ports: [`KeyValueStore`],
//! [`IdentityProvider`], [`NetworkMonitor`] and [`Clock`](tabsync_types::Clock).
//!
//! ## Sync Process
//!
//! 1. **Write**: the local value changes immediately, the version is bumped,
//!    the write is queued and broadcast to other contexts
//! 2. **Drain**: queued writes are compared against the remote envelope and
//!    delivered, retried, or raised as conflicts
//! 3. **Pull**: a newer remote envelope is adopted unless it collides with a
//!    fresh local write
//! 4. **Resolve**: conflicts settle by strategy at a version above both sides
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tabsync_sync::{MemoryStore, ServerSyncEngine, SyncStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let engine = ServerSyncEngine::builder("cart", json!({}), store).build();
//!
//! engine.set(json!({ "items": 3 }));
//! assert_eq!(engine.version(), 1);
//!
//! engine.drain().await;
//! assert_eq!(engine.status(), SyncStatus::Synced);
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod conflict;
mod engine;
mod error;
pub mod identity;
pub mod mirror;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod reactive;
pub mod resolver;
pub mod state;
pub mod store;

pub use broadcast::{
    BroadcastHub, Broadcaster, PeerPresence, Subscription, CHANNEL_CAPACITY, DEFAULT_CHANNEL,
};
pub use config::EngineConfig;
pub use conflict::{Conflict, ConflictLog, ConflictSide, ConflictStatus, ResolutionStrategy};
pub use engine::{EngineBuilder, EngineHandle, PullOutcome, ServerSyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::{IdentityProvider, NoIdentity, StaticIdentity};
pub use mirror::SyncedValue;
pub use network::{AlwaysOnline, ManualNetwork, NetworkMonitor};
pub use protocol::{ConflictMetadata, MessageKind, OutgoingMessage, SyncMessage};
pub use queue::{SyncQueue, SyncQueueItem};
pub use reactive::ReactiveValue;
pub use resolver::{
    default_detector, ConflictAwareValue, ConflictDetector, MessageOutcome, ResolverConfig,
};
pub use state::{SyncEvent, SyncStatus};
pub use store::memory::{FlakyStore, MemoryStore};
pub use store::{meta_key, KeyValueStore, RemoteEnvelope};
