//! Engine configuration.

use crate::conflict::ResolutionStrategy;
use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`ServerSyncEngine`](crate::ServerSyncEngine).
///
/// Every field can be overridden; missing fields in JSON fall back to the
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the drain-and-pull tick (ms).
    pub sync_interval_ms: u64,
    /// Two writes closer together than this are potentially concurrent (ms).
    pub conflict_window_ms: u64,
    /// Applied to every detected conflict. `Manual` disables auto-resolution.
    pub auto_resolve: ResolutionStrategy,
    /// Queue capacity; the oldest write is evicted beyond it.
    pub max_queue_size: usize,
    /// Failed deliveries an item survives before it is dropped.
    pub max_retries: u32,
    /// Linear backoff step between retries (ms). `None` retries on the next pass.
    pub retry_backoff_ms: Option<u64>,
    /// How many dropped writes are kept for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            conflict_window_ms: 30_000,
            auto_resolve: ResolutionStrategy::Manual,
            max_queue_size: 1000,
            max_retries: 5,
            retry_backoff_ms: None,
            dead_letter_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON configuration over the defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The sync tick period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// The conflict window.
    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }

    /// Delay before the `retries`-th retry, if backoff is enabled.
    pub fn backoff_for(&self, retries: u32) -> Option<u64> {
        self.retry_backoff_ms
            .map(|step| step.saturating_mul(u64::from(retries)))
    }
}
