//! Change-set computation and merge.
//!
//! A unit of work diffs every registered clone against its backup clone,
//! mapping by mapping, using each mapping's comparison policy. The result is
//! a [`UnitOfWorkChangeSet`]: one [`ObjectChangeSet`] per object that needs a
//! database write, each holding the [`ChangeRecord`]s for the attributes that
//! differ. Objects without differences and without an insert or delete flag
//! are left out entirely.
//!
//! # Null and absent attributes
//!
//! A null value is a value: changing an attribute to or from null produces a
//! change record. An attribute the object's variant does not carry is absent;
//! absent attributes are never compared, recorded or written.
//!
//! After the database transaction commits, [`UnitOfWorkChangeSet::merge_into`]
//! applies the change set to the parent identity map.

use std::fmt;
use std::sync::Arc;

use relmap_core::error::{DescriptorError, DescriptorErrorKind};
use relmap_core::{Descriptor, Error, IdentityKey, ManagedRef, ObjectState, Result, Value};

use crate::identity_map::IdentityMap;

/// One attribute's before and after values.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Mapping index within the descriptor
    pub index: usize,
    pub attribute: &'static str,
    pub column: &'static str,
    /// Backup value; `None` for objects being inserted
    pub old: Option<Value>,
    pub new: Value,
}

/// What the database must do for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// The changes of one registered object.
pub struct ObjectChangeSet {
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) kind: ChangeKind,
    pub(crate) key: Option<IdentityKey>,
    pub(crate) records: Vec<ChangeRecord>,
    pub(crate) state: ObjectState,
    pub(crate) object: ManagedRef,
}

impl fmt::Debug for ObjectChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectChangeSet")
            .field("entity", &self.descriptor.entity())
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl ObjectChangeSet {
    pub fn entity(&self) -> &'static str {
        self.descriptor.entity()
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Identity key; `None` for an insert whose key the database generates.
    pub fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Change record for `attribute`, if it changed.
    pub fn record(&self, attribute: &str) -> Option<&ChangeRecord> {
        self.records.iter().find(|r| r.attribute == attribute)
    }

    /// Object state the changes were computed from.
    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    /// Record the key the database generated for an insert.
    pub(crate) fn assign_generated_key(&mut self, id: i64) -> Result<()> {
        let index = self.descriptor.primary_key()[0];
        let mapping = &self.descriptor.mappings()[index];
        let value = Value::BigInt(id);
        self.object
            .apply_changes(&self.descriptor, &[(index, value.clone())])?;
        self.records.retain(|r| r.index != index);
        self.records.push(ChangeRecord {
            index,
            attribute: mapping.attribute(),
            column: mapping.column(),
            old: None,
            new: value.clone(),
        });
        self.key = Some(self.descriptor.key_from_values(vec![value])?);
        Ok(())
    }

    fn changes(&self) -> Vec<(usize, Value)> {
        self.records
            .iter()
            .map(|r| (r.index, r.new.clone()))
            .collect()
    }
}

/// Every object change computed in one commit cycle.
#[derive(Debug, Default)]
pub struct UnitOfWorkChangeSet {
    objects: Vec<ObjectChangeSet>,
}

/// Counts of what a merge did to the parent identity map.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Existing parent objects that received new values
    pub updated: usize,
    /// Objects added to the parent map
    pub added: usize,
    /// Objects removed from the parent map
    pub removed: usize,
    /// Parent objects evicted because a change could not be applied
    pub invalidated: usize,
}

impl UnitOfWorkChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, change: ObjectChangeSet) {
        self.objects.push(change);
    }

    pub fn objects(&self) -> &[ObjectChangeSet] {
        &self.objects
    }

    pub(crate) fn objects_mut(&mut self) -> &mut [ObjectChangeSet] {
        &mut self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Change set for the object identified by `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<&ObjectChangeSet> {
        self.objects.iter().find(|o| o.key.as_ref() == Some(key))
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }

    /// Total number of change records across all objects.
    pub fn total_records(&self) -> usize {
        self.objects.iter().map(|o| o.records.len()).sum()
    }

    /// Apply a committed change set to the parent identity map.
    ///
    /// Each parent object receives all of its new values under one write
    /// lock. Objects the parent does not hold yet are added as fresh copies
    /// of the clone, so no clone ever becomes reachable from the parent.
    /// A parent object that rejects its new values is evicted, so the next
    /// read reloads it from the database.
    pub fn merge_into(&self, map: &IdentityMap) -> MergeSummary {
        let _merge = map.merge_guard();
        let mut summary = MergeSummary::default();
        for change in &self.objects {
            let Some(key) = &change.key else {
                continue;
            };
            match change.kind {
                ChangeKind::Delete => {
                    if map.remove(key).is_some() {
                        summary.removed += 1;
                    }
                }
                ChangeKind::Insert | ChangeKind::Update => match map.get(key) {
                    Some(parent) => {
                        match parent.apply_changes(&change.descriptor, &change.changes()) {
                            Ok(()) => summary.updated += 1,
                            Err(err) => {
                                tracing::warn!(
                                    key = %key,
                                    error = %err,
                                    "Merge failed; evicting parent object"
                                );
                                map.remove(key);
                                summary.invalidated += 1;
                            }
                        }
                    }
                    None => {
                        map.replace(key.clone(), change.object.duplicate());
                        summary.added += 1;
                    }
                },
            }
        }
        tracing::info!(
            updated = summary.updated,
            added = summary.added,
            removed = summary.removed,
            invalidated = summary.invalidated,
            "Merged change set into parent identity map"
        );
        summary
    }
}

/// Records for every attribute of a new object.
///
/// A null generated key is left out; the database supplies it.
pub(crate) fn insert_records(descriptor: &Descriptor, state: &ObjectState) -> Vec<ChangeRecord> {
    descriptor
        .mappings()
        .iter()
        .enumerate()
        .filter_map(|(index, mapping)| {
            let value = state.get(index)?;
            if descriptor.has_generated_key()
                && descriptor.primary_key().contains(&index)
                && value.is_null()
            {
                return None;
            }
            Some(ChangeRecord {
                index,
                attribute: mapping.attribute(),
                column: mapping.column(),
                old: None,
                new: value.clone(),
            })
        })
        .collect()
}

/// Records for every attribute whose value differs from the backup.
///
/// Fails when a primary-key attribute changed: an object's identity is fixed
/// once it is stored.
pub(crate) fn diff_records(
    descriptor: &Descriptor,
    current: &ObjectState,
    backup: &ObjectState,
) -> Result<Vec<ChangeRecord>> {
    let mut records = Vec::new();
    for (index, mapping) in descriptor.mappings().iter().enumerate() {
        let Some(new) = current.get(index) else {
            continue;
        };
        let old = backup.get(index).cloned().unwrap_or(Value::Null);
        if mapping.values_equal(&old, new) {
            continue;
        }
        if descriptor.primary_key().contains(&index) {
            return Err(Error::Descriptor(DescriptorError {
                kind: DescriptorErrorKind::Access,
                entity: descriptor.entity().to_string(),
                message: format!(
                    "primary-key attribute '{}' of a stored object cannot change",
                    mapping.attribute()
                ),
            }));
        }
        records.push(ChangeRecord {
            index,
            attribute: mapping.attribute(),
            column: mapping.column(),
            old: Some(old),
            new: new.clone(),
        });
    }
    Ok(records)
}
