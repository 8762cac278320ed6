//! Entities and type-erased managed objects.
//!
//! Sessions hold every object as an [`ObjectRef<T>`], a shared
//! `Arc<RwLock<T>>`. Code that works across entity types (change detection,
//! merge, conformance) sees the same allocation through the object-safe
//! [`ManagedObject`] trait and recovers the typed handle with
//! [`downcast_object`].

use std::any::{Any, TypeId};
use std::sync::{Arc, PoisonError, RwLock};

use crate::descriptor::{Descriptor, DescriptorBuilder, ObjectState};
use crate::error::{DescriptorError, DescriptorErrorKind, Error, Result};
use crate::value::Value;

/// A persistent domain type.
///
/// `Default` supplies the instance rows are read into; `Clone` produces unit
/// of work clones and backups.
pub trait Entity: Clone + Default + Send + Sync + 'static {
    /// Name under which the descriptor is registered.
    const ENTITY_NAME: &'static str;

    /// Mapping metadata for this type.
    fn descriptor() -> DescriptorBuilder<Self>;
}

/// Shared handle to one object instance.
pub type ObjectRef<T> = Arc<RwLock<T>>;

/// Type-erased handle to a managed object.
pub type ManagedRef = Arc<dyn ManagedObject>;

/// Object-safe view of an `RwLock<T: Entity>`.
pub trait ManagedObject: Send + Sync {
    fn entity_type(&self) -> TypeId;

    /// Snapshot the mapped attributes under a read lock.
    fn read_state(&self, descriptor: &Descriptor) -> Result<ObjectState>;

    /// Apply every change under one write lock.
    ///
    /// Changes are staged on a copy first, so either all of them become
    /// visible or, when a setter fails, none do.
    fn apply_changes(&self, descriptor: &Descriptor, changes: &[(usize, Value)]) -> Result<()>;

    /// A new, independent instance with the same state.
    fn duplicate(&self) -> ManagedRef;

    /// Overwrite this object's state with `source`'s.
    fn restore_from(&self, source: &dyn ManagedObject) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> ManagedObject for RwLock<T> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn read_state(&self, descriptor: &Descriptor) -> Result<ObjectState> {
        let guard = self.read().unwrap_or_else(PoisonError::into_inner);
        descriptor.read_state(&*guard)
    }

    fn apply_changes(&self, descriptor: &Descriptor, changes: &[(usize, Value)]) -> Result<()> {
        let mut guard = self.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = guard.clone();
        for (index, value) in changes {
            descriptor.apply(&mut staged, *index, value.clone())?;
        }
        *guard = staged;
        Ok(())
    }

    fn duplicate(&self) -> ManagedRef {
        let copy = self.read().unwrap_or_else(PoisonError::into_inner).clone();
        Arc::new(RwLock::new(copy))
    }

    fn restore_from(&self, source: &dyn ManagedObject) -> Result<()> {
        let Some(source) = source.as_any().downcast_ref::<RwLock<T>>() else {
            return Err(Error::Descriptor(DescriptorError {
                kind: DescriptorErrorKind::Access,
                entity: T::ENTITY_NAME.to_string(),
                message: "cannot restore from an object of another type".to_string(),
            }));
        };
        let snapshot = source.read().unwrap_or_else(PoisonError::into_inner).clone();
        *self.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Wrap a value in a fresh shared handle.
pub fn object_ref<T: Entity>(value: T) -> ObjectRef<T> {
    Arc::new(RwLock::new(value))
}

/// Erase a typed handle; the allocation is shared, not copied.
pub fn erase<T: Entity>(object: &ObjectRef<T>) -> ManagedRef {
    Arc::clone(object) as ManagedRef
}

/// Recover the typed handle of a managed object.
pub fn downcast_object<T: Entity>(object: &ManagedRef) -> Option<ObjectRef<T>> {
    Arc::clone(object).into_any().downcast::<RwLock<T>>().ok()
}

/// Address of the allocation behind a managed object, for identity checks.
pub fn object_address(object: &ManagedRef) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}
