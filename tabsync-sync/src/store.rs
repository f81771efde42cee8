//! Remote key-value store port.
//!
//! The remote store is a black box with asynchronous, fallible `get` and
//! `set`. Each synced key occupies two slots: the bare value under `key`,
//! and a [`RemoteEnvelope`] under `{key}_meta` carrying the authoritative
//! version counter used for optimistic-concurrency checks.

use crate::error::SyncResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabsync_types::UserId;

/// Asynchronous key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a key. `Ok(None)` if absent.
    async fn get(&self, key: &str) -> SyncResult<Option<Value>>;

    /// Writes a key.
    async fn set(&self, key: &str, value: Value) -> SyncResult<()>;
}

/// Slot holding the envelope for `key`.
pub fn meta_key(key: &str) -> String {
    format!("{key}_meta")
}

/// The versioned shape persisted next to a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEnvelope<T> {
    pub value: T,
    pub timestamp: u64,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Reads and decodes the envelope for `key`.
pub async fn read_envelope<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> SyncResult<Option<RemoteEnvelope<T>>> {
    match store.get(&meta_key(key)).await? {
        Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
        None => Ok(None),
    }
}

/// Writes the envelope, then the bare value.
pub async fn write_envelope<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    envelope: &RemoteEnvelope<T>,
) -> SyncResult<()> {
    store.set(&meta_key(key), serde_json::to_value(envelope)?).await?;
    store.set(key, serde_json::to_value(&envelope.value)?).await
}

/// In-memory stores for tests and single-process use.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// A shared in-memory store. Clones see the same data, so several engines
    /// can share one "remote".
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        data: Arc<Mutex<HashMap<String, Value>>>,
    }

    impl MemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns a copy of a slot without going through the async API.
        pub fn snapshot(&self, key: &str) -> Option<Value> {
            self.data.lock().get(key).cloned()
        }

        /// Number of occupied slots.
        pub fn len(&self) -> usize {
            self.data.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.data.lock().is_empty()
        }
    }

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
            Ok(self.data.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
            self.data.lock().insert(key.to_string(), value);
            Ok(())
        }
    }

    /// Wraps a store and fails calls on demand.
    #[derive(Debug, Clone)]
    pub struct FlakyStore<S> {
        inner: S,
        fail_next: Arc<AtomicU32>,
        fail_all: Arc<AtomicBool>,
    }

    impl<S: KeyValueStore> FlakyStore<S> {
        /// Wraps `inner`; passes every call through until told otherwise.
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                fail_next: Arc::new(AtomicU32::new(0)),
                fail_all: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Fails the next `n` calls.
        pub fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        /// Fails every call while `on`.
        pub fn fail_all(&self, on: bool) {
            self.fail_all.store(on, Ordering::SeqCst);
        }

        /// The wrapped store.
        pub fn inner(&self) -> &S {
            &self.inner
        }

        fn check(&self) -> SyncResult<()> {
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(SyncError::Store("store unavailable".into()));
            }
            let consumed = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if consumed.is_ok() {
                return Err(SyncError::Store("injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl<S: KeyValueStore> KeyValueStore for FlakyStore<S> {
        async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
            self.check()?;
            self.inner.set(key, value).await
        }
    }
}
