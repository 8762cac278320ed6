//! Query model for relmap.
//!
//! `relmap-query` holds the predicate trees that select objects. One [`Expr`]
//! serves both sides of a read:
//!
//! - **Database**: rendered against a descriptor into a parameterized WHERE
//!   clause for the target [`Dialect`].
//! - **Memory**: evaluated over an object's attribute state with SQL's
//!   three-valued logic, so a unit of work can tell which of its uncommitted
//!   objects the database would have returned.
//!
//! [`ReadAllQuery`] wraps criteria for one entity type and carries the
//! conform-in-unit-of-work flag.

pub mod expr;
pub mod select;

pub use expr::{BinaryOp, Dialect, Expr, SqlFragment, Truth, UnaryOp, compare_values};
pub use select::{ReadAllQuery, SelectStatement, key_clause, key_params};
