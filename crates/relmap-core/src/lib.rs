//! Core types and traits for relmap.
//!
//! This crate provides the foundations shared by the query, session and
//! schema crates:
//!
//! - `Value` and `Row` for data crossing the database boundary
//! - `Entity`, `Descriptor` and `DescriptorRegistry` for mapping metadata
//! - `IdentityKey` and the type-erased `ManagedObject` handle
//! - `Connection` trait for the database collaborator
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod identity;
pub mod registry;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, TransactionOps};
pub use descriptor::{
    CollectionOrder, ComparisonPolicy, Descriptor, DescriptorBuilder, FieldMapping, Getter,
    ObjectState, Setter, Variant,
};
pub use entity::{
    Entity, ManagedObject, ManagedRef, ObjectRef, downcast_object, erase, object_address,
    object_ref,
};
pub use error::{Error, Result};
pub use identity::IdentityKey;
pub use registry::{DescriptorRegistry, RegistryBuilder, bootstrap, registry};
pub use row::{ColumnInfo, Row};
pub use types::SqlType;
pub use value::Value;

/// Unwrap an `Outcome`, returning early from the enclosing async function on
/// any non-`Ok` arm.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(::core::convert::From::from(err)),
        }
    };
}
