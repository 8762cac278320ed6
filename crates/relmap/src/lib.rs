//! relmap - a unit-of-work object-relational mapping engine.
//!
//! relmap keeps one live instance per database row, hands out private
//! working copies for editing, and writes back only what changed, in one
//! transaction per commit:
//!
//! - **Descriptors** map plain Rust structs onto tables through explicit,
//!   per-attribute accessors. No reflection, no derive macros.
//! - **Sessions** own the shared identity map and build each object once,
//!   even when many threads read the same key at the same time.
//! - **Units of work** clone what they touch, diff against backups at
//!   commit, and merge the committed changes into their session.
//! - **Expressions** are evaluated in memory (three-valued logic) or
//!   rendered to parameterized SQL, with the same answer either way.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Employee {
//!     id: Option<i64>,
//!     salary: Option<i64>,
//! }
//!
//! impl Entity for Employee {
//!     const ENTITY_NAME: &'static str = "Employee";
//!
//!     fn descriptor() -> DescriptorBuilder<Self> {
//!         DescriptorBuilder::<Self>::new("EMPLOYEE")
//!             .field("id", "EMP_ID", SqlType::BigInt, |e| e.id.into(), |e, v| { e.id = v.try_into()?; Ok(()) })
//!             .field("salary", "SALARY", SqlType::BigInt, |e| e.salary.into(), |e, v| { e.salary = v.try_into()?; Ok(()) })
//!             .primary_key(&["id"])
//!     }
//! }
//!
//! async fn give_raise(cx: &Cx, conn: impl Connection) -> Outcome<(), Error> {
//!     let registry = RegistryBuilder::new().register::<Employee>().seal()?;
//!     let session = Session::new(conn, registry);
//!
//!     let mut uow = session.acquire_unit_of_work();
//!     let poor = uow
//!         .read_all(cx, &ReadAllQuery::<Employee>::new().filter(Expr::attr("salary").lt(1000)))
//!         .await?;
//!     for emp in &poor {
//!         emp.write().unwrap().salary = Some(1000);
//!     }
//!     uow.commit(cx).await.map(|_| ())
//! }
//! ```

pub use relmap_core::{
    CollectionOrder, ColumnInfo, ComparisonPolicy, Connection, Cx, Descriptor, DescriptorBuilder,
    DescriptorRegistry, Entity, Error, FieldMapping, IdentityKey, ManagedObject, ManagedRef,
    ObjectRef, ObjectState, Outcome, RegistryBuilder, Result, Row, SqlType, TransactionOps, Value,
    Variant, bootstrap, downcast_object, erase, object_address, object_ref, registry, try_outcome,
    try_result,
};
pub use relmap_core::error;

pub use relmap_query::{
    BinaryOp, Dialect, Expr, ReadAllQuery, SelectStatement, SqlFragment, Truth, UnaryOp,
    compare_values,
};

pub use relmap_schema::{
    ColumnDefinition, ConstraintStatement, DdlErrorPolicy, DdlOutcome, DdlReport, ForeignKey,
    TableCreator, TableDefinition, drop_table_sql,
};

pub use relmap_session::{
    Action, ChangeKind, ChangeRecord, FlushPlan, FlushResult, IdentityMap, MergeSummary, ObjectChangeSet,
    PendingCounts, PendingOp, Session, SessionConfig, UnitOfWork, UnitOfWorkChangeSet,
    UnitOfWorkState,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Core traits and types
        Connection,
        Cx,
        DescriptorBuilder,
        Entity,
        Error,
        // Query building
        Expr,
        IdentityKey,
        ObjectRef,
        Outcome,
        ReadAllQuery,
        RegistryBuilder,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        SqlType,
        // Schema
        TableCreator,
        Truth,
        UnitOfWork,
        Value,
    };
}
