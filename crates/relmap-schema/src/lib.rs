//! Table creation and teardown for relmap.
//!
//! This crate provides:
//! - [`TableDefinition`] derived from a descriptor (columns, key, foreign keys)
//! - [`TableCreator`], which creates, drops and replaces every mapped table
//!   in dependency order
//!
//! Creation runs in two phases: every table, then every foreign-key
//! constraint. Teardown mirrors it, dropping constraints before tables, so
//! tables that reference each other can be created and dropped.
//!
//! DDL failures never abort silently and never unwind through control flow.
//! Each table yields a [`DdlOutcome`], and the creator's [`DdlErrorPolicy`]
//! decides whether a failure is recorded as ignored (setup scripts that may
//! run twice) or stops the run.
//!
//! ```ignore
//! let report = TableCreator::new(registry)
//!     .error_policy(DdlErrorPolicy::Ignore)
//!     .create_tables(&cx, &conn)
//!     .await?;
//! assert!(report.is_success());
//! ```

pub mod create;

pub use create::{
    ColumnDefinition, ConstraintStatement, ForeignKey, TableDefinition, drop_table_sql,
    inline_foreign_keys,
};

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::error::{SchemaError, SchemaErrorKind};
use relmap_core::{Connection, DescriptorRegistry, Error, Result, try_result};
use relmap_query::Dialect;

/// What to do when a DDL statement fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdlErrorPolicy {
    /// Record the failure and stop.
    #[default]
    Propagate,
    /// Record the failure as ignored and continue with the next table.
    Ignore,
}

/// Result of one DDL statement.
#[derive(Debug)]
pub enum DdlOutcome {
    Applied,
    /// Failed under [`DdlErrorPolicy::Ignore`].
    Ignored(Error),
    /// Failed under [`DdlErrorPolicy::Propagate`].
    Failed(Error),
}

impl DdlOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DdlOutcome::Applied)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            DdlOutcome::Applied => None,
            DdlOutcome::Ignored(e) | DdlOutcome::Failed(e) => Some(e),
        }
    }
}

/// Outcomes of one creator run, in execution order.
///
/// Table statements are recorded under the table name, constraint
/// statements under the constraint name.
#[derive(Debug, Default)]
pub struct DdlReport {
    entries: Vec<(String, DdlOutcome)>,
}

impl DdlReport {
    fn record(&mut self, target: impl Into<String>, outcome: DdlOutcome) {
        self.entries.push((target.into(), outcome));
    }

    pub fn entries(&self) -> &[(String, DdlOutcome)] {
        &self.entries
    }

    /// The last outcome recorded for a table or constraint name.
    pub fn outcome(&self, table: &str) -> Option<&DdlOutcome> {
        self.entries
            .iter()
            .rev()
            .find(|(t, _)| *t == table)
            .map(|(_, o)| o)
    }

    pub fn applied(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.is_applied()).count()
    }

    pub fn ignored(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, DdlOutcome::Ignored(_)))
            .count()
    }

    /// Whether no statement failed under [`DdlErrorPolicy::Propagate`].
    pub fn is_success(&self) -> bool {
        !self.has_failure()
    }

    fn has_failure(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, o)| matches!(o, DdlOutcome::Failed(_)))
    }

    /// Convert the first failure into an error.
    pub fn into_result(self) -> Result<Self> {
        if !self.has_failure() {
            return Ok(self);
        }
        let mut entries = self.entries;
        let position = entries
            .iter()
            .position(|(_, o)| matches!(o, DdlOutcome::Failed(_)))
            .unwrap_or_default();
        let (target, outcome) = entries.swap_remove(position);
        let source = match outcome {
            DdlOutcome::Failed(e) => e,
            _ => Error::Custom("DDL failure".to_string()),
        };
        Err(Error::Schema(SchemaError {
            kind: SchemaErrorKind::DdlFailed,
            message: format!("DDL on '{}' failed: {}", target, source),
            table: Some(target),
            source: Some(Box::new(source)),
        }))
    }
}

/// Creates and drops the tables of every entity in a registry.
#[derive(Debug, Clone)]
pub struct TableCreator {
    registry: Arc<DescriptorRegistry>,
    dialect: Dialect,
    policy: DdlErrorPolicy,
    drop_retries: u32,
}

impl TableCreator {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            registry,
            dialect: Dialect::default(),
            policy: DdlErrorPolicy::default(),
            drop_retries: 1,
        }
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn error_policy(mut self, policy: DdlErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attempts per DROP TABLE before the failure counts (at least one).
    #[must_use]
    pub fn drop_retries(mut self, attempts: u32) -> Self {
        self.drop_retries = attempts.max(1);
        self
    }

    /// Retry drops five times; tables referenced by rows of unmapped tables
    /// often only drop once those are gone.
    #[must_use]
    pub fn force_drop(self) -> Self {
        self.drop_retries(5)
    }

    /// Table definitions with referenced tables first.
    pub fn definitions(&self) -> Result<Vec<TableDefinition>> {
        self.registry
            .dependency_order()
            .iter()
            .map(|d| TableDefinition::from_descriptor(d, &self.registry))
            .collect()
    }

    fn settle(&self, error: Error) -> DdlOutcome {
        match self.policy {
            DdlErrorPolicy::Ignore => DdlOutcome::Ignored(error),
            DdlErrorPolicy::Propagate => DdlOutcome::Failed(error),
        }
    }

    /// CREATE TABLE for every entity, referenced tables first, then every
    /// foreign-key constraint.
    #[tracing::instrument(level = "info", skip(self, cx, conn))]
    pub async fn create_tables<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DdlReport, Error> {
        let mut report = DdlReport::default();
        self.create_into(cx, conn, &mut report).await.map(|()| report)
    }

    async fn create_into<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        report: &mut DdlReport,
    ) -> Outcome<(), Error> {
        let definitions = try_result!(self.definitions());
        for def in &definitions {
            let sql = def.create_sql(self.dialect, false);
            tracing::trace!(sql = %sql, "Executing CREATE TABLE");
            let outcome = match conn.execute(cx, &sql, &[]).await {
                Outcome::Ok(_) => {
                    tracing::info!(table = def.table, "Table created");
                    DdlOutcome::Applied
                }
                Outcome::Err(e) => {
                    match self.policy {
                        DdlErrorPolicy::Ignore => {
                            tracing::info!(table = def.table, error = %e, "Table already existed; error ignored");
                        }
                        DdlErrorPolicy::Propagate => {
                            tracing::warn!(table = def.table, error = %e, "CREATE TABLE failed");
                        }
                    }
                    self.settle(e)
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let stop = matches!(outcome, DdlOutcome::Failed(_));
            report.record(def.table, outcome);
            if stop {
                return Outcome::Ok(());
            }
        }
        self.add_constraints_into(cx, conn, &definitions, report).await
    }

    /// Add every foreign-key constraint; the tables must exist.
    ///
    /// Failures follow the error policy. Dialects that declare foreign keys
    /// inside CREATE TABLE have nothing to add.
    #[tracing::instrument(level = "info", skip(self, cx, conn))]
    pub async fn create_constraints<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DdlReport, Error> {
        let mut report = DdlReport::default();
        let definitions = try_result!(self.definitions());
        self.add_constraints_into(cx, conn, &definitions, &mut report)
            .await
            .map(|()| report)
    }

    async fn add_constraints_into<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        definitions: &[TableDefinition],
        report: &mut DdlReport,
    ) -> Outcome<(), Error> {
        for statement in definitions.iter().flat_map(|d| d.add_constraints_sql(self.dialect)) {
            tracing::trace!(sql = %statement.sql, "Executing ADD CONSTRAINT");
            let outcome = match conn.execute(cx, &statement.sql, &[]).await {
                Outcome::Ok(_) => {
                    tracing::info!(constraint = %statement.name, "Constraint created");
                    DdlOutcome::Applied
                }
                Outcome::Err(e) => {
                    tracing::warn!(constraint = %statement.name, error = %e, "ADD CONSTRAINT failed");
                    self.settle(e)
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let stop = matches!(outcome, DdlOutcome::Failed(_));
            report.record(statement.name, outcome);
            if stop {
                break;
            }
        }
        Outcome::Ok(())
    }

    /// Drop every foreign-key constraint.
    ///
    /// Failures are always recorded as ignored: on a fresh database the
    /// constraints do not exist yet.
    #[tracing::instrument(level = "info", skip(self, cx, conn))]
    pub async fn drop_constraints<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DdlReport, Error> {
        let mut report = DdlReport::default();
        let definitions = try_result!(self.definitions());
        self.drop_constraints_into(cx, conn, &definitions, &mut report)
            .await
            .map(|()| report)
    }

    async fn drop_constraints_into<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        definitions: &[TableDefinition],
        report: &mut DdlReport,
    ) -> Outcome<(), Error> {
        for statement in definitions.iter().flat_map(|d| d.drop_constraints_sql(self.dialect)) {
            let outcome = match conn.execute(cx, &statement.sql, &[]).await {
                Outcome::Ok(_) => {
                    tracing::info!(constraint = %statement.name, "Constraint dropped");
                    DdlOutcome::Applied
                }
                Outcome::Err(e) => {
                    tracing::debug!(constraint = %statement.name, error = %e, "DROP CONSTRAINT failed; ignored");
                    DdlOutcome::Ignored(e)
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            report.record(statement.name, outcome);
        }
        Outcome::Ok(())
    }

    /// Drop every foreign-key constraint, then DROP TABLE for every entity,
    /// referencing tables first.
    ///
    /// Each drop is attempted up to `drop_retries` times.
    #[tracing::instrument(level = "info", skip(self, cx, conn))]
    pub async fn drop_tables<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DdlReport, Error> {
        let mut report = DdlReport::default();
        self.drop_into(cx, conn, &mut report).await.map(|()| report)
    }

    async fn drop_into<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        report: &mut DdlReport,
    ) -> Outcome<(), Error> {
        let mut definitions = try_result!(self.definitions());
        match self.drop_constraints_into(cx, conn, &definitions, report).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        definitions.reverse();
        for def in definitions {
            let sql = def.drop_sql(self.dialect, false);
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match conn.execute(cx, &sql, &[]).await {
                    Outcome::Ok(_) => {
                        tracing::info!(table = def.table, attempt, "Table dropped");
                        break DdlOutcome::Applied;
                    }
                    Outcome::Err(e) if attempt < self.drop_retries => {
                        tracing::debug!(table = def.table, attempt, error = %e, "DROP TABLE failed; retrying");
                    }
                    Outcome::Err(e) => {
                        tracing::warn!(table = def.table, attempts = attempt, error = %e, "DROP TABLE failed");
                        break self.settle(e);
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            };
            let stop = matches!(outcome, DdlOutcome::Failed(_));
            report.record(def.table, outcome);
            if stop {
                break;
            }
        }
        Outcome::Ok(())
    }

    /// Drop constraints and tables, then create tables and constraints.
    ///
    /// A drop failure under [`DdlErrorPolicy::Propagate`] skips the create
    /// phase.
    pub async fn replace_tables<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DdlReport, Error> {
        let mut report = DdlReport::default();
        match self.drop_into(cx, conn, &mut report).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if report.has_failure() {
            return Outcome::Ok(report);
        }
        self.create_into(cx, conn, &mut report).await.map(|()| report)
    }
}
