//! Values that can be synced, diffed and merged.
//!
//! The engine never looks inside a value except through [`SyncValue`]. A
//! value is a set of top-level *fields*; diffing is shallow (one entry per
//! top-level field, deep equality within the field) and merging works
//! field-by-field. Values without fields (scalars, arrays) are compared and
//! merged wholesale.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// A value that can be stored under a synced key.
pub trait SyncValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static
{
    /// Names of the top-level fields whose contents differ between `self` and
    /// `other`. Empty for values that have no fields.
    fn field_changes(&self, _other: &Self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Field-wise merge: starts from `remote` and copies every field of `local`
    /// that is not in `contested`. Contested fields keep the remote side.
    ///
    /// Values without fields resolve to `remote`.
    fn merge_fields(remote: &Self, _local: &Self, _contested: &BTreeSet<String>) -> Self {
        remote.clone()
    }
}

impl SyncValue for Value {
    fn field_changes(&self, other: &Self) -> BTreeSet<String> {
        let (Value::Object(a), Value::Object(b)) = (self, other) else {
            return BTreeSet::new();
        };

        a.keys()
            .chain(b.keys())
            .filter(|k| a.get(*k) != b.get(*k))
            .cloned()
            .collect()
    }

    fn merge_fields(remote: &Self, local: &Self, contested: &BTreeSet<String>) -> Self {
        let (Value::Object(remote_map), Value::Object(local_map)) = (remote, local) else {
            return remote.clone();
        };

        let mut merged = remote_map.clone();
        for (field, value) in local_map {
            if !contested.contains(field) {
                merged.insert(field.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }
}

impl SyncValue for String {}
impl SyncValue for bool {}
impl SyncValue for i64 {}
impl SyncValue for u64 {}
impl SyncValue for f64 {}
impl<T: SyncValue> SyncValue for Vec<T> {}
