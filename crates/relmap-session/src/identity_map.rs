//! Identity Map: one live instance per identity key.
//!
//! Every session owns one [`IdentityMap`]. Looking an object up twice by the
//! same key yields the same allocation, so a change made through one handle is
//! visible through every other.
//!
//! # Design
//!
//! Entries live in a sharded `DashMap`. A key always lands in the same
//! shard, so readers of different keys rarely contend and a writer locks only
//! the shard of the key it touches.
//!
//! Inserting a *different* instance under a key that is already present is an
//! [`Error::IdentityConflict`]; callers that mean to swap instances use
//! [`IdentityMap::replace`].
//!
//! ```ignore
//! let map = IdentityMap::new(16);
//! map.put(key.clone(), erase(&employee))?;
//! assert!(map.get(&key).is_some());
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relmap_core::error::IdentityConflictError;
use relmap_core::{Error, IdentityKey, ManagedRef, Result, object_address};

/// Concurrent identity map keyed by [`IdentityKey`].
pub struct IdentityMap {
    objects: DashMap<IdentityKey, ManagedRef>,
    shard_count: usize,
    merge_gate: Mutex<()>,
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("shards", &self.shard_count)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new(16)
    }
}

impl IdentityMap {
    /// Create a map with at least `shards` shards, rounded up to a power of
    /// two (minimum two).
    pub fn new(shards: usize) -> Self {
        let shard_count = shards.max(2).next_power_of_two();
        Self {
            objects: DashMap::with_shard_amount(shard_count),
            shard_count,
            merge_gate: Mutex::new(()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Get the object registered under `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<ManagedRef> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    /// Check whether `key` is registered.
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Register `object` under `key`.
    ///
    /// Returns the previous entry when it is the very same instance (the call
    /// is then a no-op), `None` when the key was vacant, and an identity
    /// conflict when a different instance already holds the key.
    pub fn put(&self, key: IdentityKey, object: ManagedRef) -> Result<Option<ManagedRef>> {
        match self.objects.entry(key) {
            Entry::Occupied(existing) => {
                if object_address(existing.get()) == object_address(&object) {
                    return Ok(Some(existing.get().clone()));
                }
                Err(Error::IdentityConflict(IdentityConflictError {
                    message: format!("a different instance is already registered as {}", existing.key()),
                    key: existing.key().to_string(),
                }))
            }
            Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(None)
            }
        }
    }

    /// Register `object` unless the key is taken; returns the resident
    /// instance either way.
    pub fn put_if_absent(&self, key: IdentityKey, object: ManagedRef) -> ManagedRef {
        self.objects.entry(key).or_insert(object).value().clone()
    }

    /// Register `object` under `key`, replacing any previous instance.
    pub fn replace(&self, key: IdentityKey, object: ManagedRef) -> Option<ManagedRef> {
        self.objects.insert(key, object)
    }

    /// Remove and return the object registered under `key`.
    pub fn remove(&self, key: &IdentityKey) -> Option<ManagedRef> {
        self.objects.remove(key).map(|(_, object)| object)
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.objects.clear();
    }

    /// Keys of every registered object of `entity`.
    pub fn keys_of(&self, entity: &str) -> Vec<IdentityKey> {
        self.objects
            .iter()
            .filter(|entry| entry.key().entity() == entity)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Serialize merges into this map.
    ///
    /// Commits hold this guard only while applying an already committed
    /// change set, never across database I/O. Plain reads do not take it.
    pub fn merge_guard(&self) -> MutexGuard<'_, ()> {
        self.merge_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
