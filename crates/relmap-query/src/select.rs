//! SELECT statements and read-all queries.

use std::fmt;
use std::marker::PhantomData;

use relmap_core::{Descriptor, Entity, IdentityKey, Result, Value};

use crate::expr::{Dialect, Expr, SqlFragment};

/// A query for every object of `T` matching optional criteria.
///
/// Criteria added with [`ReadAllQuery::filter`] are ANDed together. Inside a
/// unit of work, [`ReadAllQuery::conform_results_in_unit_of_work`] asks for
/// the result to reflect the unit's uncommitted registrations and deletions.
pub struct ReadAllQuery<T> {
    criteria: Option<Expr>,
    conform: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ReadAllQuery<T> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            conform: self.conform,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ReadAllQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadAllQuery")
            .field("entity", &std::any::type_name::<T>())
            .field("criteria", &self.criteria)
            .field("conform", &self.conform)
            .finish()
    }
}

impl<T: Entity> Default for ReadAllQuery<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> ReadAllQuery<T> {
    /// Select every object of `T`.
    pub fn new() -> Self {
        Self {
            criteria: None,
            conform: false,
            _marker: PhantomData,
        }
    }

    /// Add a WHERE condition.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.criteria = Some(match self.criteria.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Merge in-flight changes of the executing unit of work into the result.
    pub fn conform_results_in_unit_of_work(mut self) -> Self {
        self.conform = true;
        self
    }

    pub fn criteria(&self) -> Option<&Expr> {
        self.criteria.as_ref()
    }

    pub fn conforms(&self) -> bool {
        self.conform
    }

    /// Render for `descriptor` in `dialect`.
    pub fn to_sql(&self, descriptor: &Descriptor, dialect: Dialect) -> Result<SqlFragment> {
        SelectStatement::new(descriptor, dialect)
            .filter(self.criteria.as_ref())
            .build()
    }
}

/// Builder for `SELECT <mapped columns> FROM <table> [WHERE ...]`.
#[derive(Debug)]
pub struct SelectStatement<'a> {
    descriptor: &'a Descriptor,
    dialect: Dialect,
    criteria: Option<&'a Expr>,
}

impl<'a> SelectStatement<'a> {
    pub fn new(descriptor: &'a Descriptor, dialect: Dialect) -> Self {
        Self {
            descriptor,
            dialect,
            criteria: None,
        }
    }

    pub fn filter(mut self, criteria: Option<&'a Expr>) -> Self {
        self.criteria = criteria;
        self
    }

    fn head(&self) -> String {
        let columns = self
            .descriptor
            .columns()
            .map(|c| self.dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {} FROM {}",
            columns,
            self.dialect.quote_identifier(self.descriptor.table())
        )
    }

    pub fn build(&self) -> Result<SqlFragment> {
        let mut text = self.head();
        let mut params = Vec::new();
        if let Some(expr) = self.criteria {
            let clause = expr.build(self.descriptor, self.dialect, &mut params, 0)?;
            text.push_str(" WHERE ");
            text.push_str(&clause);
        }
        tracing::trace!(sql = %text, params = params.len(), "Built SELECT");
        Ok(SqlFragment { text, params })
    }

    /// Select the single row identified by `key`.
    pub fn by_key(&self, key: &IdentityKey) -> SqlFragment {
        let mut text = self.head();
        text.push_str(" WHERE ");
        text.push_str(&key_clause(self.descriptor, self.dialect, 0));
        SqlFragment {
            text,
            params: key.values().to_vec(),
        }
    }
}

/// `"PK1" = $n AND "PK2" = $n+1`, numbering placeholders after `offset`.
pub fn key_clause(descriptor: &Descriptor, dialect: Dialect, offset: usize) -> String {
    descriptor
        .primary_key()
        .iter()
        .enumerate()
        .map(|(i, &index)| {
            let column = descriptor.mappings()[index].column();
            format!(
                "{} = {}",
                dialect.quote_identifier(column),
                dialect.placeholder(offset + i + 1)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Primary-key values of `key` in statement order.
pub fn key_params(key: &IdentityKey) -> Vec<Value> {
    key.values().to_vec()
}
