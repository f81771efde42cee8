//! Identity provider port.
//!
//! Writes are stamped with the owning user's id when one is available. A
//! failing or empty provider never blocks a write: it just means no user id.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tabsync_types::UserId;
use tracing::debug;

/// Looks up the signed-in user.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the current user's id, if anyone is signed in.
    async fn current_user(&self) -> SyncResult<Option<UserId>>;
}

/// Provider for anonymous sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

#[async_trait]
impl IdentityProvider for NoIdentity {
    async fn current_user(&self) -> SyncResult<Option<UserId>> {
        Ok(None)
    }
}

/// Provider returning a fixed, swappable user.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Arc<Mutex<Option<UserId>>>,
}

impl StaticIdentity {
    /// Signs in `user`.
    pub fn new(user: impl Into<UserId>) -> Self {
        Self {
            user: Arc::new(Mutex::new(Some(user.into()))),
        }
    }

    /// Replaces the signed-in user.
    pub fn set(&self, user: Option<UserId>) {
        *self.user.lock() = user;
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> SyncResult<Option<UserId>> {
        Ok(self.user.lock().clone())
    }
}

/// Asks the provider for the current user, treating failure as "no user".
pub async fn resolve_user(provider: &dyn IdentityProvider) -> Option<UserId> {
    match provider.current_user().await {
        Ok(user) => user,
        Err(e) => {
            debug!("Identity lookup failed, continuing without user id: {}", e);
            None
        }
    }
}
