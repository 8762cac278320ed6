//! Sessions and units of work for relmap.
//!
//! `relmap-session` is the **object lifecycle layer**. It keeps object
//! identity, reads objects through the descriptors of a sealed registry, and
//! writes changes back transactionally.
//!
//! # Role In The Architecture
//!
//! - **Session**: the shared, read-side parent. Owns the root identity map and
//!   builds each object at most once, even under concurrent reads.
//! - **Unit of work**: a private working copy acquired from a session. Clones
//!   what it touches, diffs clones against backups at commit, writes the
//!   differences in one transaction and merges them into the session.
//! - **Conformance**: reads inside a unit of work can reflect its uncommitted
//!   registrations and deletions.
//!
//! # Design Philosophy
//!
//! - **Explicit registry**: a session receives its descriptors; nothing is
//!   looked up by name at runtime.
//! - **No partial state**: a failed commit rolls back and never touches the
//!   parent identity map.
//! - **Cancel-correct**: all database work takes `Cx` and returns `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(conn, registry);
//!
//! let mut uow = session.acquire_unit_of_work();
//! let emp = uow.read_object::<Employee>(&cx, vec![Value::BigInt(5)]).await?.unwrap();
//! emp.write().unwrap().salary = Some(0);
//! uow.commit(&cx).await?;
//! ```

pub mod change_set;
mod conform;
pub mod flush;
pub mod identity_map;
pub mod unit_of_work;

#[cfg(test)]
mod mock;

pub use change_set::{ChangeKind, ChangeRecord, MergeSummary, ObjectChangeSet, UnitOfWorkChangeSet};
pub use flush::{Action, FlushPlan, FlushResult, PendingOp};
pub use identity_map::IdentityMap;
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitOfWorkState};

use std::collections::HashSet;
use std::sync::Arc;

use asupersync::sync::Mutex as AsyncMutex;
use asupersync::{Cx, Outcome};
use dashmap::DashMap;
use relmap_core::error::{DescriptorError, DescriptorErrorKind};
use relmap_core::{
    Connection, Descriptor, DescriptorRegistry, Entity, Error, IdentityKey, ManagedRef, ObjectRef,
    Result, Value, downcast_object, erase, object_ref, try_outcome, try_result,
};
use relmap_query::{Dialect, ReadAllQuery, SelectStatement};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// SQL dialect for placeholders and identifier quoting.
    pub dialect: Dialect,
    /// Fail a commit when an UPDATE or DELETE matches no row.
    pub verify_row_counts: bool,
    /// Minimum number of shards in the session's identity map; the map
    /// rounds it up to a power of two.
    pub identity_map_shards: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Postgres,
            verify_row_counts: false,
            identity_map_shards: 16,
        }
    }
}

impl SessionConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SQL dialect (builder pattern).
    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Require every UPDATE and DELETE to match a row (builder pattern).
    #[must_use]
    pub fn verify_row_counts(mut self, value: bool) -> Self {
        self.verify_row_counts = value;
        self
    }

    /// Set the identity map shard count; clamped to at least one.
    #[must_use]
    pub fn identity_map_shards(mut self, shards: usize) -> Self {
        self.identity_map_shards = shards.max(1);
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// The shared parent session.
///
/// A session is `Sync` whenever its connection is, so one session can serve
/// many units of work on many threads at once.
pub struct Session<C: Connection> {
    /// The database connection.
    connection: C,
    /// Sealed descriptors for every entity this session maps.
    registry: Arc<DescriptorRegistry>,
    /// Configuration.
    config: SessionConfig,
    /// Root identity map.
    identity_map: IdentityMap,
    /// One build gate per key currently being read from the database.
    in_flight: DashMap<IdentityKey, Arc<AsyncMutex<()>>>,
    /// Serializes commits, from BEGIN through the merge into the identity map.
    commit_gate: AsyncMutex<()>,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("identity_map", &self.identity_map)
            .field("descriptors", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn type_mismatch(descriptor: &Descriptor) -> Error {
    Error::Descriptor(DescriptorError {
        kind: DescriptorErrorKind::Access,
        entity: descriptor.entity().to_string(),
        message: "identity map holds an object of another type under this key".to_string(),
    })
}

/// Recover the typed handle behind `object`.
pub(crate) fn typed<T: Entity>(descriptor: &Descriptor, object: &ManagedRef) -> Result<ObjectRef<T>> {
    downcast_object::<T>(object).ok_or_else(|| type_mismatch(descriptor))
}

impl<C: Connection> Session<C> {
    /// Create a new session over `connection` with the default configuration.
    pub fn new(connection: C, registry: Arc<DescriptorRegistry>) -> Self {
        Self::with_config(connection, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, registry: Arc<DescriptorRegistry>, config: SessionConfig) -> Self {
        tracing::debug!(
            descriptors = registry.len(),
            shards = config.identity_map_shards,
            "Session created"
        );
        Self {
            connection,
            identity_map: IdentityMap::new(config.identity_map_shards),
            registry,
            config,
            in_flight: DashMap::new(),
            commit_gate: AsyncMutex::new(()),
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The root identity map.
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub(crate) fn commit_gate(&self) -> &AsyncMutex<()> {
        &self.commit_gate
    }

    /// Whether an object is cached under `key`.
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.identity_map.contains(key)
    }

    /// The cached object for `key_values`, without touching the database.
    pub fn cached_object<T: Entity>(&self, key_values: Vec<Value>) -> Result<Option<ObjectRef<T>>> {
        let descriptor = self.registry.of::<T>()?;
        let key = descriptor.key_from_values(key_values)?;
        self.identity_map
            .get(&key)
            .map(|object| typed::<T>(descriptor, &object))
            .transpose()
    }

    /// Evict `key` so the next read reloads it. Returns whether it was cached.
    pub fn invalidate(&self, key: &IdentityKey) -> bool {
        let evicted = self.identity_map.remove(key).is_some();
        tracing::debug!(key = %key, evicted, "Invalidated identity map entry");
        evicted
    }

    /// Start a unit of work whose parent is this session.
    pub fn acquire_unit_of_work(&self) -> UnitOfWork<'_, C> {
        tracing::debug!("Unit of work acquired");
        UnitOfWork::new(self)
    }

    /// Read one object by primary key.
    ///
    /// Returns the cached instance when there is one. Otherwise the row is
    /// read and built once: concurrent readers of the same key wait for the
    /// first build and receive the same instance, while readers of other
    /// keys proceed independently.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn read_object<T: Entity>(
        &self,
        cx: &Cx,
        key_values: Vec<Value>,
    ) -> Outcome<Option<ObjectRef<T>>, Error> {
        let descriptor = Arc::clone(try_result!(self.registry.of::<T>()));
        let key = try_result!(descriptor.key_from_values(key_values));
        self.read_by_key::<T>(cx, &descriptor, &key).await
    }

    pub(crate) async fn read_by_key<T: Entity>(
        &self,
        cx: &Cx,
        descriptor: &Descriptor,
        key: &IdentityKey,
    ) -> Outcome<Option<ObjectRef<T>>, Error> {
        if let Some(object) = self.identity_map.get(key) {
            tracing::debug!(key = %key, "Identity map hit");
            return Outcome::Ok(Some(try_result!(typed::<T>(descriptor, &object))));
        }
        tracing::debug!(key = %key, "Identity map miss");

        let gate = self.flight_gate(key);
        let guard = match gate.lock(cx).await {
            Ok(guard) => guard,
            Err(_) => {
                self.finish_flight(key, &gate);
                return Outcome::Err(Error::Cancelled);
            }
        };

        let outcome = self.build_by_key::<T>(cx, descriptor, key).await;
        drop(guard);
        self.finish_flight(key, &gate);
        outcome
    }

    /// Body of a keyed read, run while holding the key's build gate.
    async fn build_by_key<T: Entity>(
        &self,
        cx: &Cx,
        descriptor: &Descriptor,
        key: &IdentityKey,
    ) -> Outcome<Option<ObjectRef<T>>, Error> {
        // Another reader may have finished the build while we waited.
        if let Some(object) = self.identity_map.get(key) {
            tracing::debug!(key = %key, "Identity map hit after wait");
            return Outcome::Ok(Some(try_result!(typed::<T>(descriptor, &object))));
        }

        let select = SelectStatement::new(descriptor, self.config.dialect).by_key(key);
        let rows = try_outcome!(self.connection.query(cx, &select.text, &select.params).await);
        let Some(row) = rows.first() else {
            tracing::debug!(key = %key, "No row for key");
            return Outcome::Ok(None);
        };

        let built = try_result!(descriptor.build_from_row::<T>(row));
        let resident = self
            .identity_map
            .put_if_absent(key.clone(), erase(&object_ref(built)));
        Outcome::Ok(Some(try_result!(typed::<T>(descriptor, &resident))))
    }

    fn flight_gate(&self, key: &IdentityKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        )
    }

    fn finish_flight(&self, key: &IdentityKey, gate: &Arc<AsyncMutex<()>>) {
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, gate));
    }

    /// Read every object matching `query`.
    ///
    /// Rows whose key is already cached resolve to the cached instance; the
    /// rest are built and cached. Duplicate keys are returned once.
    #[tracing::instrument(level = "debug", skip(self, cx, query))]
    pub async fn read_all<T: Entity>(
        &self,
        cx: &Cx,
        query: &ReadAllQuery<T>,
    ) -> Outcome<Vec<ObjectRef<T>>, Error> {
        let descriptor = Arc::clone(try_result!(self.registry.of::<T>()));
        let keyed = try_outcome!(self.read_all_keyed::<T>(cx, &descriptor, query).await);
        Outcome::Ok(keyed.into_iter().map(|(_, object)| object).collect())
    }

    pub(crate) async fn read_all_keyed<T: Entity>(
        &self,
        cx: &Cx,
        descriptor: &Descriptor,
        query: &ReadAllQuery<T>,
    ) -> Outcome<Vec<(IdentityKey, ObjectRef<T>)>, Error> {
        let select = try_result!(query.to_sql(descriptor, self.config.dialect));
        let rows = try_outcome!(self.connection.query(cx, &select.text, &select.params).await);

        let mut seen = HashSet::with_capacity(rows.len());
        let mut objects = Vec::with_capacity(rows.len());
        let mut hits = 0usize;
        for row in &rows {
            let key = try_result!(descriptor.key_from_row(row));
            if !seen.insert(key.clone()) {
                continue;
            }
            let object = match self.identity_map.get(&key) {
                Some(object) => {
                    hits += 1;
                    object
                }
                None => {
                    let built = try_result!(descriptor.build_from_row::<T>(row));
                    self.identity_map
                        .put_if_absent(key.clone(), erase(&object_ref(built)))
                }
            };
            objects.push((key, try_result!(typed::<T>(descriptor, &object))));
        }
        tracing::debug!(
            entity = descriptor.entity(),
            rows = rows.len(),
            cache_hits = hits,
            "Read all"
        );
        Outcome::Ok(objects)
    }
}

// ============================================================================
// Tests
// ============================================================================
