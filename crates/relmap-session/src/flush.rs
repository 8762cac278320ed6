//! Flush operation ordering for a committing unit of work.
//!
//! This module turns a change set into SQL and runs it inside the commit
//! transaction, in this order:
//! - INSERT parent-first (objects whose references are resolved first)
//! - UPDATE only the changed columns, in registration order
//! - DELETE child-first (the reverse of the insert rule)
//!
//! Ordering is computed per object from the values of reference mappings, so
//! a new order line that points at a new order is inserted after it. A cycle
//! among new (or among deleted) objects is reported as [`Error::Cycle`].

use std::collections::HashMap;
use std::time::Instant;

use asupersync::{Cx, Outcome};
use relmap_core::error::{CycleError, QueryError, QueryErrorKind};
use relmap_core::{
    DescriptorRegistry, Error, IdentityKey, Result, TransactionOps, Value, try_outcome,
};
use relmap_query::Dialect;

use crate::change_set::{ChangeKind, ObjectChangeSet, UnitOfWorkChangeSet};

/// What a pending statement does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write every mapped column; `generated_key` asks the database for the key.
    Insert { generated_key: bool },
    /// Write only the changed columns of an existing row.
    Update,
    Delete,
}

/// One statement of a flush, tied back to its change-set entry.
#[derive(Debug, Clone)]
pub struct PendingOp {
    /// Position of the object in the change set.
    pub change: usize,
    pub table: &'static str,
    pub action: Action,
    /// Written columns and their values; empty for deletes.
    pub columns: Vec<(&'static str, Value)>,
    /// Primary-key columns and values identifying the row; empty for inserts.
    pub key: Vec<(&'static str, Value)>,
}

impl PendingOp {
    fn new(change: usize, object: &ObjectChangeSet, action: Action) -> Option<Self> {
        let descriptor = &object.descriptor;
        let key = match action {
            Action::Insert { .. } => Vec::new(),
            Action::Update | Action::Delete => {
                let values = object.key.as_ref()?.values();
                descriptor
                    .primary_key()
                    .iter()
                    .map(|&i| descriptor.mappings()[i].column())
                    .zip(values.iter().cloned())
                    .collect()
            }
        };
        let columns = match action {
            Action::Delete => Vec::new(),
            _ => object.records.iter().map(|r| (r.column, r.new.clone())).collect(),
        };
        Some(Self {
            change,
            table: descriptor.table(),
            action,
            columns,
            key,
        })
    }

    /// Render the statement and its bound parameters.
    pub fn to_sql(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(self.table);
        let assign = |(i, (column, _)): (usize, &(&str, Value))| {
            format!("{} = {}", dialect.quote_identifier(column), dialect.placeholder(i + 1))
        };
        let filter = |offset: usize| {
            self.key
                .iter()
                .enumerate()
                .map(|(i, entry)| assign((offset + i, entry)))
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        let sql = match self.action {
            Action::Insert { .. } => {
                let names: Vec<String> = self
                    .columns
                    .iter()
                    .map(|(c, _)| dialect.quote_identifier(c))
                    .collect();
                let slots: Vec<String> = (1..=self.columns.len()).map(|i| dialect.placeholder(i)).collect();
                format!("INSERT INTO {table} ({}) VALUES ({})", names.join(", "), slots.join(", "))
            }
            Action::Update => {
                let set: Vec<String> = self.columns.iter().enumerate().map(assign).collect();
                format!("UPDATE {table} SET {} WHERE {}", set.join(", "), filter(self.columns.len()))
            }
            Action::Delete => format!("DELETE FROM {table} WHERE {}", filter(0)),
        };
        let params = self
            .columns
            .iter()
            .chain(&self.key)
            .map(|(_, v)| v.clone())
            .collect();
        (sql, params)
    }
}

/// The ordered statements of one commit.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Parents before children.
    pub inserts: Vec<PendingOp>,
    /// Registration order.
    pub updates: Vec<PendingOp>,
    /// Children before parents.
    pub deletes: Vec<PendingOp>,
}

/// Row counts written by a flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Keys returned by the database, by change-set position.
    pub generated_keys: Vec<(usize, i64)>,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Order the operations of `changes`.
    ///
    /// Entities are ranked by the registry's dependency order; within that,
    /// object-level reference values decide. Registration order breaks ties.
    pub fn build(changes: &UnitOfWorkChangeSet, registry: &DescriptorRegistry) -> Result<Self> {
        let rank: HashMap<&str, usize> = registry
            .dependency_order()
            .iter()
            .enumerate()
            .map(|(i, d)| (d.entity(), i))
            .collect();
        let objects = changes.objects();
        let of_kind = |kind: ChangeKind| -> Vec<usize> {
            (0..objects.len()).filter(|&i| objects[i].kind() == kind).collect()
        };
        let ops = |order: Vec<usize>, action: fn(&ObjectChangeSet) -> Action| -> Vec<PendingOp> {
            order
                .into_iter()
                .filter_map(|i| PendingOp::new(i, &objects[i], action(&objects[i])))
                .collect()
        };

        let plan = Self {
            inserts: ops(
                order_by_references(objects, of_kind(ChangeKind::Insert), &rank, false)?,
                |o| Action::Insert {
                    generated_key: o.descriptor.has_generated_key() && o.key.is_none(),
                },
            ),
            updates: ops(of_kind(ChangeKind::Update), |_| Action::Update),
            deletes: ops(
                order_by_references(objects, of_kind(ChangeKind::Delete), &rank, true)?,
                |_| Action::Delete,
            ),
        };
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Flush plan built"
        );
        Ok(plan)
    }

    /// Execute the flush plan inside `tx`.
    ///
    /// With `verify_row_counts`, an UPDATE or DELETE that matches no row
    /// fails with an optimistic-lock error.
    #[tracing::instrument(level = "info", skip(self, cx, tx))]
    pub async fn execute<T: TransactionOps>(
        &self,
        cx: &Cx,
        tx: &T,
        dialect: Dialect,
        verify_row_counts: bool,
    ) -> Outcome<FlushResult, Error> {
        let started = Instant::now();
        let mut result = FlushResult::default();

        for op in &self.inserts {
            let (sql, params) = op.to_sql(dialect);
            tracing::trace!(table = op.table, sql = %sql, "insert");
            if matches!(op.action, Action::Insert { generated_key: true }) {
                let id = try_outcome!(tx.insert(cx, &sql, &params).await);
                result.generated_keys.push((op.change, id));
            } else {
                try_outcome!(tx.execute(cx, &sql, &params).await);
            }
            result.inserted += 1;
        }
        for op in &self.updates {
            try_outcome!(Self::execute_checked(cx, tx, op, dialect, verify_row_counts).await);
            result.updated += 1;
        }
        for op in &self.deletes {
            try_outcome!(Self::execute_checked(cx, tx, op, dialect, verify_row_counts).await);
            result.deleted += 1;
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    async fn execute_checked<T: TransactionOps>(
        cx: &Cx,
        tx: &T,
        op: &PendingOp,
        dialect: Dialect,
        verify_row_counts: bool,
    ) -> Outcome<(), Error> {
        let (sql, params) = op.to_sql(dialect);
        tracing::debug!(table = op.table, sql = %sql, "Executing statement");
        let affected = try_outcome!(tx.execute(cx, &sql, &params).await);
        if affected == 0 && verify_row_counts {
            return Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::OptimisticLock,
                message: format!("statement on table '{}' matched no row", op.table),
                sql: Some(sql),
                sqlstate: None,
                source: None,
            }));
        }
        Outcome::Ok(())
    }
}

/// Keys of the objects `object` references through reference mappings.
fn referenced_keys(object: &ObjectChangeSet) -> Vec<IdentityKey> {
    object
        .descriptor
        .mappings()
        .iter()
        .enumerate()
        .filter_map(|(index, mapping)| {
            let target = mapping.reference_target()?;
            let value = object.state.get(index)?;
            (!value.is_null()).then(|| IdentityKey::new(target, vec![value.clone()]))
        })
        .collect()
}

/// Kahn's algorithm over the reference edges among `members`.
///
/// Referenced objects come first; with `reverse`, referencing objects come
/// first. Among ready objects the lowest entity rank, then the lowest
/// position, is taken.
fn order_by_references(
    objects: &[ObjectChangeSet],
    members: Vec<usize>,
    rank: &HashMap<&str, usize>,
    reverse: bool,
) -> Result<Vec<usize>> {
    let by_key: HashMap<&IdentityKey, usize> = members
        .iter()
        .filter_map(|&i| objects[i].key.as_ref().map(|k| (k, i)))
        .collect();

    // prerequisites[i] = members that must be flushed before i
    let mut prerequisites: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in &members {
        for key in referenced_keys(&objects[i]) {
            let Some(&j) = by_key.get(&key) else { continue };
            if i == j {
                continue;
            }
            let (before, after) = if reverse { (i, j) } else { (j, i) };
            prerequisites.entry(after).or_default().push(before);
        }
    }

    let entity_rank = |i: usize| {
        let entity = objects[i].entity();
        let base = rank.get(entity).copied().unwrap_or(usize::MAX);
        if reverse { usize::MAX - base } else { base }
    };

    let mut remaining = members;
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &i)| {
                prerequisites
                    .get(&i)
                    .is_none_or(|deps| deps.iter().all(|d| ordered.contains(d)))
            })
            .min_by_key(|&(pos, &i)| (entity_rank(i), pos))
            .map(|(pos, _)| pos);
        match next {
            Some(pos) => ordered.push(remaining.remove(pos)),
            None => {
                let members = remaining
                    .iter()
                    .map(|&i| match &objects[i].key {
                        Some(key) => key.to_string(),
                        None => format!("{}[new]", objects[i].entity()),
                    })
                    .collect();
                return Err(Error::Cycle(CycleError { members }));
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_set::insert_records;
    use relmap_core::{
        DescriptorBuilder, Entity, ManagedRef, RegistryBuilder, SqlType, erase, object_ref,
    };
    use std::sync::Arc;

    #[derive(Debug, Clone, Default)]
    struct Order {
        id: i64,
        parent: Option<i64>,
    }

    impl Entity for Order {
        const ENTITY_NAME: &'static str = "Order";

        fn descriptor() -> DescriptorBuilder<Self> {
            DescriptorBuilder::<Self>::new("ORDERS")
                .field("id", "ID", SqlType::BigInt, |o| o.id.into(), |o, v| {
                    o.id = v.try_into()?;
                    Ok(())
                })
                .reference("parent", "PARENT_ID", SqlType::BigInt, "Order", |o| o.parent.into(), |o, v| {
                    o.parent = v.try_into()?;
                    Ok(())
                })
                .primary_key(&["id"])
        }
    }

    fn change(
        registry: &DescriptorRegistry,
        kind: ChangeKind,
        order: Order,
    ) -> ObjectChangeSet {
        let descriptor = Arc::clone(registry.of::<Order>().unwrap());
        let object: ManagedRef = erase(&object_ref(order));
        let state = object.read_state(&descriptor).unwrap();
        ObjectChangeSet {
            kind,
            key: descriptor.key_from_state(&state),
            records: insert_records(&descriptor, &state),
            state,
            object,
            descriptor,
        }
    }

    fn registry() -> Arc<DescriptorRegistry> {
        RegistryBuilder::new().register::<Order>().seal().unwrap()
    }

    fn ids(plan: &[PendingOp], changes: &UnitOfWorkChangeSet) -> Vec<String> {
        plan.iter()
            .map(|op| changes.objects()[op.change].key().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_inserts_parent_first_deletes_child_first() {
        let registry = registry();
        let mut changes = UnitOfWorkChangeSet::new();
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 3, parent: Some(2) }));
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 2, parent: Some(1) }));
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 1, parent: None }));
        changes.push(change(&registry, ChangeKind::Delete, Order { id: 10, parent: None }));
        changes.push(change(&registry, ChangeKind::Delete, Order { id: 11, parent: Some(10) }));

        let plan = FlushPlan::build(&changes, &registry).unwrap();
        assert_eq!(plan.len(), 5);
        assert_eq!(ids(&plan.inserts, &changes), ["Order[1]", "Order[2]", "Order[3]"]);
        assert_eq!(ids(&plan.deletes, &changes), ["Order[11]", "Order[10]"]);
    }

    #[test]
    fn test_cycle_among_new_objects_is_reported() {
        let registry = registry();
        let mut changes = UnitOfWorkChangeSet::new();
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 1, parent: Some(2) }));
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 2, parent: Some(1) }));
        let err = FlushPlan::build(&changes, &registry).unwrap_err();
        assert!(matches!(err, Error::Cycle(ref c) if c.members.len() == 2));
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let registry = registry();
        let mut changes = UnitOfWorkChangeSet::new();
        changes.push(change(&registry, ChangeKind::Insert, Order { id: 1, parent: Some(1) }));
        assert_eq!(FlushPlan::build(&changes, &registry).unwrap().inserts.len(), 1);
    }

    #[test]
    fn test_statement_sql() {
        let update = PendingOp {
            change: 0,
            table: "EMPLOYEE",
            action: Action::Update,
            columns: vec![("SALARY", Value::BigInt(0)), ("F_NAME", Value::Text("Bob".into()))],
            key: vec![("EMP_ID", Value::BigInt(5))],
        };
        let (sql, params) = update.to_sql(Dialect::Postgres);
        assert_eq!(
            sql,
            "UPDATE \"EMPLOYEE\" SET \"SALARY\" = $1, \"F_NAME\" = $2 WHERE \"EMP_ID\" = $3"
        );
        assert_eq!(params.last(), Some(&Value::BigInt(5)));

        let delete = PendingOp {
            action: Action::Delete,
            columns: Vec::new(),
            ..update.clone()
        };
        assert_eq!(
            delete.to_sql(Dialect::Sqlite).0,
            "DELETE FROM \"EMPLOYEE\" WHERE \"EMP_ID\" = ?1"
        );

        let insert = PendingOp {
            change: 0,
            table: "EMPLOYEE",
            action: Action::Insert { generated_key: false },
            columns: vec![("EMP_ID", Value::BigInt(5)), ("SALARY", Value::Null)],
            key: Vec::new(),
        };
        assert_eq!(
            insert.to_sql(Dialect::Mysql).0,
            "INSERT INTO `EMPLOYEE` (`EMP_ID`, `SALARY`) VALUES (?, ?)"
        );
    }
}
