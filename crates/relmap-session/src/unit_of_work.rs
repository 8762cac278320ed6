//! Unit of Work: a private, transactional working copy of session objects.
//!
//! A unit of work never hands out the session's own objects. Registering a
//! cached object yields a *clone*, and a *backup* of that clone is taken at
//! the same moment. At commit the clones are compared with their backups and
//! only the differences are written, in one transaction. Once the transaction
//! has committed the differences are merged into the session's identity map.
//!
//! # Lifecycle
//!
//! ```text
//! Active --commit--> Committing --ok--> Committed
//!                              \--err-> Failed
//! Active --rollback--> RolledBack
//! Active --release---> Released
//! ```
//!
//! Every operation other than inspection requires `Active`.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = session.acquire_unit_of_work();
//!
//! let emp = uow.read_object::<Employee>(&cx, vec![Value::BigInt(5)]).await?.unwrap();
//! emp.write().unwrap().salary = Some(0);
//! uow.register_new_object(Employee { name: "Ada".into(), ..Default::default() })?;
//!
//! let result = uow.commit(&cx).await?;
//! assert_eq!(result.updated, 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::error::{
    DescriptorError, DescriptorErrorKind, IdentityConflictError, UnitOfWorkInvalidError,
};
use relmap_core::{
    Connection, Descriptor, Entity, Error, IdentityKey, ManagedRef, ObjectRef, Result,
    TransactionOps, Value, erase, object_address, object_ref, try_outcome, try_result,
};
use relmap_query::ReadAllQuery;

use crate::change_set::{
    ChangeKind, ObjectChangeSet, UnitOfWorkChangeSet, diff_records, insert_records,
};
use crate::conform::{DatabaseHit, Registered, conform};
use crate::flush::{FlushPlan, FlushResult};
use crate::{Session, typed};

/// State of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    /// Accepting registrations and reads.
    Active,
    /// A commit is in progress.
    Committing,
    /// The last commit succeeded.
    Committed,
    /// A commit failed and was rolled back.
    Failed,
    /// Discarded by [`UnitOfWork::rollback`].
    RolledBack,
    /// Discarded by [`UnitOfWork::release`].
    Released,
}

impl UnitOfWorkState {
    pub fn name(&self) -> &'static str {
        match self {
            UnitOfWorkState::Active => "active",
            UnitOfWorkState::Committing => "committing",
            UnitOfWorkState::Committed => "committed",
            UnitOfWorkState::Failed => "failed",
            UnitOfWorkState::RolledBack => "rolled back",
            UnitOfWorkState::Released => "released",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitOfWorkState::Active | UnitOfWorkState::Committing)
    }
}

/// Counts of what a commit would currently touch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingCounts {
    /// Live registrations.
    pub registered: usize,
    /// New objects that would be inserted.
    pub new: usize,
    /// Stored objects that would be deleted.
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Not yet in the database.
    New,
    /// Cloned from an object cached by the session.
    Existing,
    /// A new object whose registration was reverted.
    Discarded,
}

struct Registration {
    descriptor: Arc<Descriptor>,
    clone: ManagedRef,
    backup: Option<ManagedRef>,
    key: Option<IdentityKey>,
    lifecycle: Lifecycle,
    deleted: bool,
    /// Objects registered under this clone; held so their addresses stay unique.
    aliases: Vec<ManagedRef>,
}

/// A unit of work acquired from a [`Session`].
pub struct UnitOfWork<'s, C: Connection> {
    session: &'s Session<C>,
    state: UnitOfWorkState,
    registrations: Vec<Registration>,
    by_key: HashMap<IdentityKey, usize>,
    by_address: HashMap<usize, usize>,
}

impl<C: Connection> std::fmt::Debug for UnitOfWork<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("registrations", &self.registrations.len())
            .field("keys", &self.by_key.len())
            .finish()
    }
}

fn not_registered(descriptor: &Descriptor) -> Error {
    Error::Descriptor(DescriptorError {
        kind: DescriptorErrorKind::Access,
        entity: descriptor.entity().to_string(),
        message: "object is not registered in this unit of work".to_string(),
    })
}

impl<'s, C: Connection> UnitOfWork<'s, C> {
    pub(crate) fn new(session: &'s Session<C>) -> Self {
        Self {
            session,
            state: UnitOfWorkState::Active,
            registrations: Vec::new(),
            by_key: HashMap::new(),
            by_address: HashMap::new(),
        }
    }

    /// The parent session.
    pub fn session(&self) -> &'s Session<C> {
        self.session
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.state == UnitOfWorkState::Active {
            return Ok(());
        }
        Err(Error::UnitOfWorkInvalid(UnitOfWorkInvalidError {
            operation,
            state: self.state.name(),
        }))
    }

    fn live(&self) -> impl Iterator<Item = (usize, &Registration)> {
        self.registrations
            .iter()
            .enumerate()
            .filter(|(_, r)| r.lifecycle != Lifecycle::Discarded)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register `object` and return the working copy.
    ///
    /// Registering the same object, its clone, or another object with the same
    /// identity key again returns the same working copy.
    pub fn register_object<T: Entity>(&mut self, object: &ObjectRef<T>) -> Result<ObjectRef<T>> {
        self.ensure_active("register_object")?;
        let descriptor = Arc::clone(self.session.registry().of::<T>()?);
        let index = self.register_erased(&descriptor, erase(object))?;
        typed::<T>(&descriptor, &self.registrations[index].clone)
    }

    /// Register each object in turn.
    pub fn register_all<T: Entity>(&mut self, objects: &[ObjectRef<T>]) -> Result<Vec<ObjectRef<T>>> {
        objects.iter().map(|o| self.register_object(o)).collect()
    }

    /// Register a brand-new object. The returned handle is both the object
    /// and its working copy; it is inserted at commit.
    pub fn register_new_object<T: Entity>(&mut self, value: T) -> Result<ObjectRef<T>> {
        self.ensure_active("register_new_object")?;
        let descriptor = Arc::clone(self.session.registry().of::<T>()?);
        let object = object_ref(value);
        let erased = erase(&object);
        let state = erased.read_state(&descriptor)?;
        let key = descriptor.key_from_state(&state);
        if let Some(key) = &key {
            if self.by_key.contains_key(key) {
                return Err(Error::IdentityConflict(IdentityConflictError {
                    key: key.to_string(),
                    message: format!("{} is already registered in this unit of work", key),
                }));
            }
        }
        self.push(Registration {
            descriptor,
            clone: erased,
            backup: None,
            key,
            lifecycle: Lifecycle::New,
            deleted: false,
            aliases: Vec::new(),
        });
        Ok(object)
    }

    fn push(&mut self, registration: Registration) -> usize {
        let index = self.registrations.len();
        self.by_address
            .insert(object_address(&registration.clone), index);
        for alias in &registration.aliases {
            self.by_address.insert(object_address(alias), index);
        }
        if let Some(key) = &registration.key {
            self.by_key.insert(key.clone(), index);
        }
        tracing::trace!(
            entity = registration.descriptor.entity(),
            index,
            lifecycle = ?registration.lifecycle,
            "Registered object"
        );
        self.registrations.push(registration);
        index
    }

    fn register_erased(&mut self, descriptor: &Arc<Descriptor>, object: ManagedRef) -> Result<usize> {
        let address = object_address(&object);
        if let Some(&index) = self.by_address.get(&address) {
            return Ok(index);
        }

        let state = object.read_state(descriptor)?;
        let key = descriptor.key_from_state(&state);
        if let Some(&index) = key.as_ref().and_then(|k| self.by_key.get(k)) {
            self.by_address.insert(address, index);
            self.registrations[index].aliases.push(object);
            return Ok(index);
        }

        let parent = key
            .as_ref()
            .and_then(|k| self.session.identity_map().get(k));
        let registration = match parent {
            Some(parent) => {
                let clone = parent.duplicate();
                let backup = clone.duplicate();
                let mut aliases = vec![object];
                if object_address(&parent) != address {
                    aliases.push(parent);
                }
                Registration {
                    descriptor: Arc::clone(descriptor),
                    clone,
                    backup: Some(backup),
                    key,
                    lifecycle: Lifecycle::Existing,
                    deleted: false,
                    aliases,
                }
            }
            None => Registration {
                descriptor: Arc::clone(descriptor),
                clone: object.duplicate(),
                backup: None,
                key,
                lifecycle: Lifecycle::New,
                deleted: false,
                aliases: vec![object],
            },
        };
        Ok(self.push(registration))
    }

    fn index_of(&self, object: &ManagedRef) -> Option<usize> {
        self.by_address.get(&object_address(object)).copied()
    }

    /// Whether `object` (or its working copy) is registered.
    pub fn is_registered<T: Entity>(&self, object: &ObjectRef<T>) -> bool {
        self.index_of(&erase(object)).is_some()
    }

    /// Whether `object` is registered and scheduled for deletion.
    pub fn is_deleted<T: Entity>(&self, object: &ObjectRef<T>) -> bool {
        self.index_of(&erase(object))
            .is_some_and(|i| self.registrations[i].deleted)
    }

    /// Schedule `object` for deletion, registering it first if needed.
    ///
    /// Deleting a new object cancels its insert.
    pub fn delete_object<T: Entity>(&mut self, object: &ObjectRef<T>) -> Result<()> {
        self.ensure_active("delete_object")?;
        let descriptor = Arc::clone(self.session.registry().of::<T>()?);
        let index = self.register_erased(&descriptor, erase(object))?;
        self.registrations[index].deleted = true;
        tracing::debug!(entity = descriptor.entity(), index, "Object scheduled for deletion");
        Ok(())
    }

    /// Undo the changes made to a registered object.
    ///
    /// A stored object is restored from its backup and undeleted. A new
    /// object is unregistered.
    pub fn revert_object<T: Entity>(&mut self, object: &ObjectRef<T>) -> Result<()> {
        self.ensure_active("revert_object")?;
        let descriptor = Arc::clone(self.session.registry().of::<T>()?);
        let index = self
            .index_of(&erase(object))
            .ok_or_else(|| not_registered(&descriptor))?;

        let registration = &mut self.registrations[index];
        match registration.lifecycle {
            Lifecycle::Existing => {
                if let Some(backup) = &registration.backup {
                    registration.clone.restore_from(backup.as_ref())?;
                }
                registration.deleted = false;
            }
            Lifecycle::New => {
                registration.lifecycle = Lifecycle::Discarded;
                if let Some(key) = registration.key.take() {
                    self.by_key.remove(&key);
                }
                self.by_address.retain(|_, i| *i != index);
            }
            Lifecycle::Discarded => return Err(not_registered(&descriptor)),
        }
        tracing::debug!(entity = descriptor.entity(), index, "Object reverted");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read one object by primary key and return its working copy.
    ///
    /// A key already registered here answers from the working copy, and a
    /// deleted one reads as absent.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn read_object<T: Entity>(
        &mut self,
        cx: &Cx,
        key_values: Vec<Value>,
    ) -> Outcome<Option<ObjectRef<T>>, Error> {
        try_result!(self.ensure_active("read_object"));
        let session = self.session;
        let descriptor = Arc::clone(try_result!(session.registry().of::<T>()));
        let key = try_result!(descriptor.key_from_values(key_values));

        if let Some(&index) = self.by_key.get(&key) {
            let registration = &self.registrations[index];
            if registration.deleted {
                return Outcome::Ok(None);
            }
            return Outcome::Ok(Some(try_result!(typed::<T>(&descriptor, &registration.clone))));
        }

        let Some(parent) = try_outcome!(session.read_by_key::<T>(cx, &descriptor, &key).await) else {
            return Outcome::Ok(None);
        };
        let index = try_result!(self.register_erased(&descriptor, erase(&parent)));
        Outcome::Ok(Some(try_result!(typed::<T>(&descriptor, &self.registrations[index].clone))))
    }

    /// Read every object matching `query` and return working copies.
    ///
    /// When the query conforms, the database answer is corrected with this
    /// unit's uncommitted registrations, edits and deletions.
    #[tracing::instrument(level = "debug", skip(self, cx, query))]
    pub async fn read_all<T: Entity>(
        &mut self,
        cx: &Cx,
        query: &ReadAllQuery<T>,
    ) -> Outcome<Vec<ObjectRef<T>>, Error> {
        try_result!(self.ensure_active("read_all"));
        let session = self.session;
        let descriptor = Arc::clone(try_result!(session.registry().of::<T>()));

        if !query.conforms() {
            let rows = try_outcome!(session.read_all_keyed::<T>(cx, &descriptor, query).await);
            let mut seen = HashSet::new();
            let mut objects = Vec::with_capacity(rows.len());
            for (_, parent) in rows {
                let index = try_result!(self.register_erased(&descriptor, erase(&parent)));
                if seen.insert(index) {
                    objects.push(try_result!(typed::<T>(&descriptor, &self.registrations[index].clone)));
                }
            }
            return Outcome::Ok(objects);
        }

        let registered = try_result!(self.snapshot(&descriptor));
        let positions: HashMap<&IdentityKey, usize> = registered
            .iter()
            .enumerate()
            .filter_map(|(pos, r)| r.key.as_ref().map(|k| (k, pos)))
            .collect();

        let rows = try_outcome!(session.read_all_keyed::<T>(cx, &descriptor, query).await);
        let mut hits = Vec::with_capacity(rows.len());
        for (key, parent) in rows {
            match positions.get(&key) {
                Some(&pos) => hits.push(DatabaseHit::Known(pos)),
                None => {
                    let index = try_result!(self.register_erased(&descriptor, erase(&parent)));
                    hits.push(DatabaseHit::Fresh(index));
                }
            }
        }

        let (indexes, stats) = try_result!(conform(&descriptor, query.criteria(), &hits, &registered));
        tracing::debug!(
            entity = descriptor.entity(),
            database = hits.len(),
            substituted = stats.substituted,
            dropped = stats.dropped,
            added = stats.added,
            "Conformed query results"
        );
        let mut objects = Vec::with_capacity(indexes.len());
        for index in indexes {
            objects.push(try_result!(typed::<T>(&descriptor, &self.registrations[index].clone)));
        }
        Outcome::Ok(objects)
    }

    /// Current state of every live registration of `descriptor`'s entity.
    fn snapshot(&self, descriptor: &Descriptor) -> Result<Vec<Registered>> {
        self.live()
            .filter(|(_, r)| r.descriptor.entity() == descriptor.entity())
            .map(|(index, r)| {
                let state = r.clone.read_state(descriptor)?;
                Ok(Registered {
                    index,
                    key: descriptor.key_from_state(&state),
                    deleted: r.deleted,
                    state,
                })
            })
            .collect()
    }

    // ========================================================================
    // Change computation
    // ========================================================================

    /// Compute what a commit would write right now.
    pub fn compute_change_set(&self) -> Result<UnitOfWorkChangeSet> {
        self.ensure_active("compute_change_set")?;
        self.build_change_set()
    }

    /// Whether a commit would write anything.
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.compute_change_set()?.is_empty())
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (_, r) in self.live() {
            counts.registered += 1;
            match (r.lifecycle, r.deleted) {
                (Lifecycle::New, false) => counts.new += 1,
                (Lifecycle::Existing, true) => counts.deleted += 1,
                _ => {}
            }
        }
        counts
    }

    fn build_change_set(&self) -> Result<UnitOfWorkChangeSet> {
        let mut changes = UnitOfWorkChangeSet::new();
        for (_, r) in self.live() {
            let descriptor = &r.descriptor;
            let change = match (r.lifecycle, r.deleted) {
                (Lifecycle::New, true) | (Lifecycle::Discarded, _) => continue,
                (Lifecycle::New, false) => {
                    let state = r.clone.read_state(descriptor)?;
                    let key = descriptor.key_from_state(&state);
                    if key.is_none() && !descriptor.has_generated_key() {
                        return Err(Error::Descriptor(DescriptorError {
                            kind: DescriptorErrorKind::MissingPrimaryKey,
                            entity: descriptor.entity().to_string(),
                            message: "new object has no primary-key value".to_string(),
                        }));
                    }
                    ObjectChangeSet {
                        descriptor: Arc::clone(descriptor),
                        kind: ChangeKind::Insert,
                        key,
                        records: insert_records(descriptor, &state),
                        state,
                        object: Arc::clone(&r.clone),
                    }
                }
                (Lifecycle::Existing, true) => {
                    let state = r.clone.read_state(descriptor)?;
                    ObjectChangeSet {
                        descriptor: Arc::clone(descriptor),
                        kind: ChangeKind::Delete,
                        key: r.key.clone(),
                        records: Vec::new(),
                        state,
                        object: Arc::clone(&r.clone),
                    }
                }
                (Lifecycle::Existing, false) => {
                    let state = r.clone.read_state(descriptor)?;
                    let backup = match &r.backup {
                        Some(backup) => backup.read_state(descriptor)?,
                        None => continue,
                    };
                    let records = diff_records(descriptor, &state, &backup)?;
                    if records.is_empty() {
                        continue;
                    }
                    ObjectChangeSet {
                        descriptor: Arc::clone(descriptor),
                        kind: ChangeKind::Update,
                        key: r.key.clone(),
                        records,
                        state,
                        object: Arc::clone(&r.clone),
                    }
                }
            };
            changes.push(change);
        }
        Ok(changes)
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Write every change in one transaction and merge it into the session.
    ///
    /// An empty change set completes without touching the database. On any
    /// failure the transaction is rolled back, the session is left as it was
    /// and the unit of work ends in [`UnitOfWorkState::Failed`].
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_result!(self.ensure_active("commit"));
        self.state = UnitOfWorkState::Committing;

        let outcome = self.commit_inner(cx).await;
        self.state = match &outcome {
            Outcome::Ok(_) => UnitOfWorkState::Committed,
            _ => UnitOfWorkState::Failed,
        };
        self.discard();
        outcome
    }

    async fn commit_inner(&self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let session = self.session;
        let mut changes = try_result!(self.build_change_set());
        tracing::info!(
            objects = changes.len(),
            inserts = changes.count(ChangeKind::Insert),
            updates = changes.count(ChangeKind::Update),
            deletes = changes.count(ChangeKind::Delete),
            "Computed change set"
        );
        if changes.is_empty() {
            return Outcome::Ok(FlushResult::default());
        }
        let plan = try_result!(FlushPlan::build(&changes, session.registry()));

        let gate = match session.commit_gate().lock(cx).await {
            Ok(gate) => gate,
            Err(_) => return Outcome::Err(Error::Cancelled),
        };
        let tx = try_outcome!(session.connection().begin(cx).await);
        tracing::debug!("Transaction begun");

        let config = session.config();
        let flushed = plan
            .execute(cx, &tx, config.dialect, config.verify_row_counts)
            .await;
        let result = match flushed {
            Outcome::Ok(result) => result,
            failed => {
                match tx.rollback(cx).await {
                    Outcome::Ok(()) => tracing::info!("Transaction rolled back"),
                    other => tracing::warn!(outcome = ?other, "Rollback after failed flush did not complete"),
                }
                return failed;
            }
        };
        try_outcome!(tx.commit(cx).await);
        tracing::info!(total = result.total(), "Transaction committed");

        for &(position, id) in &result.generated_keys {
            try_result!(changes.objects_mut()[position].assign_generated_key(id));
        }
        // Merge before the next commit may start so merges land in commit order.
        changes.merge_into(session.identity_map());
        drop(gate);
        Outcome::Ok(result)
    }

    /// Discard every registration without writing anything.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.state = UnitOfWorkState::RolledBack;
        self.discard();
        tracing::debug!("Unit of work rolled back");
        Ok(())
    }

    /// End the unit of work without writing anything.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_active("release")?;
        self.state = UnitOfWorkState::Released;
        self.discard();
        tracing::debug!("Unit of work released");
        Ok(())
    }

    fn discard(&mut self) {
        self.registrations.clear();
        self.by_key.clear();
        self.by_address.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
