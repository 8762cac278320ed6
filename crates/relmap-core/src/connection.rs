//! The database collaborator.
//!
//! The engine renders every statement itself, so a [`Connection`] only runs
//! parameterized SQL, reports affected row counts accurately and opens
//! transactions. Every call takes the caller's `Cx` and may end `Cancelled`.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Shared by a session and every unit of work acquired from it.
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT \"EMP_ID\" FROM \"EMPLOYEE\" WHERE \"EMP_ID\" = $1", &[Value::BigInt(5)]).await;
///
/// let tx = conn.begin(&cx).await?;
/// tx.execute(&cx, "UPDATE \"EMPLOYEE\" SET \"SALARY\" = $1 WHERE \"EMP_ID\" = $2", &params).await;
/// tx.commit(&cx).await;
/// ```
pub trait Connection: Send + Sync {
    type Tx<'conn>: TransactionOps
    where
        Self: 'conn;

    /// Run a SELECT outside any transaction.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Run DDL or DML outside any transaction; returns the affected row count.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;
}

/// An open transaction. Ends only through `commit` or `rollback`.
pub trait TransactionOps: Send {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Returns the affected row count, which flush uses to detect stale rows.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Run an INSERT into a table with a generated key and return that key.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
