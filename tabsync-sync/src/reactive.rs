//! Local reactive value.
//!
//! Holds the context's current copy of a keyed value and notifies watchers on
//! every change. All sync layers write through it, so whatever renders the
//! value only ever needs a [`watch::Receiver`].

use std::sync::Arc;
use tokio::sync::watch;

/// One value plus change notification. Clones share the same value.
#[derive(Debug, Clone)]
pub struct ReactiveValue<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T: Clone> ReactiveValue<T> {
    /// Creates a reactive value holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the value.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Applies `f` to the current value and stores the result, which is also
    /// returned.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let mut resolved = None;
        self.tx.send_modify(|current| {
            let next = f(current);
            *current = next.clone();
            resolved = Some(next);
        });
        match resolved {
            Some(value) => value,
            None => self.get(),
        }
    }

    /// Watches for changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}
