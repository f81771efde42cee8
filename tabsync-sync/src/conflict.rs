//! Conflict records and the shared resolution algorithm.
//!
//! A [`Conflict`] is created once per detected disagreement and afterwards
//! only changes status. Records are never deleted by the engine itself, so
//! callers can audit past conflicts.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tabsync_types::{ConflictId, ContextId, SyncValue, UserId};

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Take our value.
    KeepLocal,
    /// Take the other writer's value.
    KeepRemote,
    /// Field-wise merge; contested fields keep the remote side.
    Merge,
    /// Use a caller-supplied value. As an auto-resolve setting this means
    /// "do not auto-resolve".
    #[default]
    Manual,
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

/// One side of a disagreement.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSide<T> {
    pub value: T,
    pub timestamp: u64,
    pub version: u64,
    pub user_id: Option<UserId>,
}

/// A detected disagreement between a local and a remote write of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict<T> {
    pub id: ConflictId,
    pub key: String,
    pub local_value: T,
    pub remote_value: T,
    pub local_timestamp: u64,
    pub remote_timestamp: u64,
    pub local_version: u64,
    pub remote_version: u64,
    /// Context that detected the conflict.
    pub origin_id: ContextId,
    pub user_id: Option<UserId>,
    pub remote_user_id: Option<UserId>,
    /// Top-level fields that differ between the two values.
    pub field_changes: BTreeSet<String>,
    pub status: ConflictStatus,
    pub resolved_value: Option<T>,
    pub strategy: Option<ResolutionStrategy>,
}

impl<T: SyncValue> Conflict<T> {
    /// Records a new pending conflict, computing the field diff.
    pub fn new(
        key: impl Into<String>,
        origin_id: ContextId,
        local: ConflictSide<T>,
        remote: ConflictSide<T>,
    ) -> Self {
        let field_changes = local.value.field_changes(&remote.value);
        Self {
            id: ConflictId::new(),
            key: key.into(),
            local_value: local.value,
            remote_value: remote.value,
            local_timestamp: local.timestamp,
            remote_timestamp: remote.timestamp,
            local_version: local.version,
            remote_version: remote.version,
            origin_id,
            user_id: local.user_id,
            remote_user_id: remote.user_id,
            field_changes,
            status: ConflictStatus::Pending,
            resolved_value: None,
            strategy: None,
        }
    }

    /// Returns true until the conflict is resolved or ignored.
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Computes the value `strategy` settles on. `custom` is required for
    /// [`ResolutionStrategy::Manual`] and ignored otherwise.
    pub fn resolution(&self, strategy: ResolutionStrategy, custom: Option<T>) -> SyncResult<T> {
        match strategy {
            ResolutionStrategy::KeepLocal => Ok(self.local_value.clone()),
            ResolutionStrategy::KeepRemote => Ok(self.remote_value.clone()),
            ResolutionStrategy::Merge => Ok(T::merge_fields(
                &self.remote_value,
                &self.local_value,
                &self.field_changes,
            )),
            ResolutionStrategy::Manual => custom.ok_or(SyncError::MissingCustomValue),
        }
    }

    /// Version a resolution is written at: one past both sides.
    pub fn resolved_version(&self) -> u64 {
        self.local_version.max(self.remote_version) + 1
    }

    fn ensure_pending(&self) -> SyncResult<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(SyncError::ConflictAlreadySettled(self.id))
        }
    }
}

/// All conflicts seen by one engine, oldest first.
#[derive(Debug, Clone)]
pub struct ConflictLog<T> {
    conflicts: Vec<Conflict<T>>,
}

impl<T> Default for ConflictLog<T> {
    fn default() -> Self {
        Self {
            conflicts: Vec::new(),
        }
    }
}

impl<T: SyncValue> ConflictLog<T> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a conflict and returns its id.
    pub fn record(&mut self, conflict: Conflict<T>) -> ConflictId {
        let id = conflict.id;
        self.conflicts.push(conflict);
        id
    }

    /// Looks up a conflict by id.
    pub fn get(&self, id: ConflictId) -> Option<&Conflict<T>> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Returns a pending conflict for the same pair of versions, if one exists.
    pub fn find_pending(&self, local_version: u64, remote_version: u64) -> Option<ConflictId> {
        self.conflicts
            .iter()
            .find(|c| {
                c.is_pending()
                    && c.local_version == local_version
                    && c.remote_version == remote_version
            })
            .map(|c| c.id)
    }

    /// Returns a copy of a pending conflict, or why it can't be settled.
    pub fn pending(&self, id: ConflictId) -> SyncResult<Conflict<T>> {
        let conflict = self.get(id).ok_or(SyncError::ConflictNotFound(id))?;
        conflict.ensure_pending()?;
        Ok(conflict.clone())
    }

    /// Marks a pending conflict resolved with `value`.
    pub fn mark_resolved(
        &mut self,
        id: ConflictId,
        value: T,
        strategy: ResolutionStrategy,
    ) -> SyncResult<()> {
        let conflict = self.get_mut(id)?;
        conflict.ensure_pending()?;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolved_value = Some(value);
        conflict.strategy = Some(strategy);
        Ok(())
    }

    /// Marks a pending conflict ignored.
    pub fn mark_ignored(&mut self, id: ConflictId) -> SyncResult<()> {
        let conflict = self.get_mut(id)?;
        conflict.ensure_pending()?;
        conflict.status = ConflictStatus::Ignored;
        Ok(())
    }

    /// Every conflict, including settled ones.
    pub fn all(&self) -> Vec<Conflict<T>> {
        self.conflicts.clone()
    }

    /// Conflicts still awaiting action.
    pub fn pending_list(&self) -> Vec<Conflict<T>> {
        self.conflicts.iter().filter(|c| c.is_pending()).cloned().collect()
    }

    /// Returns true if any conflict is pending.
    pub fn has_pending(&self) -> bool {
        self.conflicts.iter().any(Conflict::is_pending)
    }

    /// Drops settled conflicts from the log. Returns how many were removed.
    pub fn clear_settled(&mut self) -> usize {
        let before = self.conflicts.len();
        self.conflicts.retain(Conflict::is_pending);
        before - self.conflicts.len()
    }

    fn get_mut(&mut self, id: ConflictId) -> SyncResult<&mut Conflict<T>> {
        self.conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(SyncError::ConflictNotFound(id))
    }
}
