//! Connectivity port.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Reports whether the remote store is reachable.
pub trait NetworkMonitor: Send + Sync + fmt::Debug {
    /// Current connectivity.
    fn is_online(&self) -> bool;

    /// Watches connectivity transitions.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by hand (tests, or a platform bridge pushing events).
#[derive(Debug, Clone)]
pub struct ManualNetwork {
    tx: Arc<watch::Sender<bool>>,
}

impl ManualNetwork {
    /// Creates a monitor in the given state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Sets connectivity, notifying watchers on change.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

impl Default for ManualNetwork {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ManualNetwork {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A monitor that never reports a transition.
#[derive(Debug, Clone, Default)]
pub struct AlwaysOnline {
    inner: ManualNetwork,
}

impl NetworkMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.subscribe()
    }
}
