//! Core type definitions for tabsync.
//!
//! This crate defines the types shared by every layer of the sync stack:
//! - Execution-context, conflict and queue-item identifiers (UUID v7)
//! - User identifiers as handed out by an identity provider
//! - The [`Clock`] port and its system/manual implementations
//! - The [`SyncValue`] trait: structural field diffing and field-wise merge

mod clock;
mod ids;
mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{ConflictId, ContextId, ItemId, UserId};
pub use value::SyncValue;

/// Result of parsing identifiers.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),
}
