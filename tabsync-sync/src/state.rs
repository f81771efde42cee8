//! Sync status and engine events.

use crate::conflict::{ConflictLog, ResolutionStrategy};
use crate::queue::SyncQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use tabsync_types::{ConflictId, ContextId, ItemId, UserId};

/// Where an engine stands with respect to the remote store.
///
/// `Synced -> Syncing -> {Synced | Conflict | Error}`, plus `Offline`, which
/// is entered and left on connectivity transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Conflict,
    Error,
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Synced => "synced",
            Self::Syncing => "syncing",
            Self::Conflict => "conflict",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Something the caller may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    ConflictDetected { id: ConflictId, key: String },
    ConflictResolved { id: ConflictId, strategy: ResolutionStrategy },
    /// A queued write reached the remote store.
    Delivered { item_id: ItemId, version: u64 },
    /// A remote value was adopted by a pull.
    RemoteAdopted { version: u64 },
    /// A write left the queue undelivered: it exhausted its retries or was
    /// evicted from a full queue.
    ItemDropped { item_id: ItemId, version: u64 },
    Error { message: String },
    Notification { origin_id: ContextId, text: String },
}

/// Everything an engine mutates, behind one lock.
#[derive(Debug)]
pub(crate) struct EngineState<T> {
    pub version: u64,
    pub status: SyncStatus,
    pub queue: SyncQueue<T>,
    pub dead_letters: SyncQueue<T>,
    pub conflicts: ConflictLog<T>,
    pub last_sync_time: Option<u64>,
    pub last_local_write: u64,
    pub user_id: Option<UserId>,
    pub online: bool,
}
