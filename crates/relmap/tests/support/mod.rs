//! SQLite database for the integration tests.
//!
//! [`MemoryDatabase`] runs every statement on one in-memory SQLite
//! connection with foreign keys enforced. Transactions are BEGIN/COMMIT on
//! that connection. A statement journal wraps the connection: it logs each
//! statement, counts transactions, and can fail statements or slow down
//! reads before they reach SQLite.

#![allow(dead_code)]

pub mod model;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use relmap::error::{QueryError, QueryErrorKind};
use relmap::{
    ColumnInfo, Connection, Cx, Dialect, Error, Outcome, Row, Session, SessionConfig, TableCreator,
    TransactionOps, Value,
};
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{ErrorCode, OptionalExtension, params_from_iter};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

// ============================================================================
// Value conversion
// ============================================================================

fn bind(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::SmallInt(v) => SqliteValue::Integer(i64::from(*v)),
        Value::Int(v) | Value::Date(v) => SqliteValue::Integer(i64::from(*v)),
        Value::BigInt(v) | Value::Timestamp(v) => SqliteValue::Integer(*v),
        Value::Double(v) => SqliteValue::Real(*v),
        Value::Decimal(s) | Value::Text(s) => SqliteValue::Text(s.clone()),
        Value::Bytes(b) => SqliteValue::Blob(b.clone()),
        Value::Uuid(u) => SqliteValue::Blob(u.to_vec()),
        Value::Json(j) => SqliteValue::Text(j.to_string()),
        Value::Array(_) => SqliteValue::Text(value.to_string()),
    }
}

fn read(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::BigInt(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn query_error(sql: &str, err: rusqlite::Error) -> Error {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            QueryErrorKind::Constraint
        }
        _ => QueryErrorKind::Database,
    };
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: err.to_string(),
        source: Some(Box::new(err)),
    })
}

// ============================================================================
// SQLite
// ============================================================================

fn query_sync(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let columns = Arc::new(ColumnInfo::new(names));
    let mut rows = stmt.query(params_from_iter(params.iter().map(bind)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|i| row.get_ref(i).map(read))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(Row::with_columns(Arc::clone(&columns), values));
    }
    Ok(out)
}

fn execute_sync(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> rusqlite::Result<u64> {
    let changed = conn.execute(sql, params_from_iter(params.iter().map(bind)))?;
    Ok(changed as u64)
}

/// Statement log, injected failures and counters.
#[derive(Debug, Default)]
struct Journal {
    log: Vec<String>,
    fail_on: Vec<String>,
    query_delay: Option<Duration>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

impl Journal {
    fn admit(&mut self, sql: &str) -> Result<(), Error> {
        self.log.push(sql.to_string());
        if self.fail_on.iter().any(|needle| sql.contains(needle.as_str())) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: "injected failure".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

struct Inner {
    conn: Mutex<rusqlite::Connection>,
    journal: Mutex<Journal>,
}

/// An in-memory SQLite database; clones share the connection.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("statements", &self.journal().log.len())
            .finish()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let conn = rusqlite::Connection::open_in_memory().expect("open in-memory SQLite");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("enable foreign keys");
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                journal: Mutex::new(Journal::default()),
            }),
        }
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.inner.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every later statement whose SQL contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.journal().fail_on.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.journal().fail_on.clear();
    }

    /// Sleep this long before every SELECT outside a transaction.
    pub fn set_query_delay(&self, delay: Duration) {
        self.journal().query_delay = Some(delay);
    }

    /// Every statement received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.journal().log.clone()
    }

    pub fn count_statements(&self, prefix: &str) -> usize {
        self.journal().log.iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub fn clear_log(&self) {
        self.journal().log.clear();
    }

    pub fn begins(&self) -> usize {
        self.journal().begins
    }

    pub fn commits(&self) -> usize {
        self.journal().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.journal().rollbacks
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, i64>(0),
            )
            .is_ok_and(|n| n > 0)
    }

    pub fn row_count(&self, table: &str) -> usize {
        let sql = format!("SELECT count(*) FROM {}", Dialect::Sqlite.quote_identifier(table));
        self.conn()
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map_or(0, |n| n as usize)
    }

    /// Value of `column` in the row whose first key column equals `key`.
    pub fn value(&self, table: &str, key: &Value, column: &str) -> Option<Value> {
        let conn = self.conn();
        let pk: String = conn
            .query_row(
                "SELECT name FROM pragma_table_info(?1) WHERE pk = 1",
                [table],
                |row| row.get(0),
            )
            .ok()?;
        let q = |name: &str| Dialect::Sqlite.quote_identifier(name);
        let sql = format!("SELECT {} FROM {} WHERE {} = ?1", q(column), q(table), q(&pk));
        conn.query_row(&sql, [bind(key)], |row| row.get_ref(0).map(read))
            .optional()
            .ok()
            .flatten()
    }

    /// Insert a row directly, bypassing the journal.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) {
        let q = |name: &str| Dialect::Sqlite.quote_identifier(name);
        let names: Vec<String> = values.iter().map(|(name, _)| q(name)).collect();
        let slots: Vec<String> = (1..=values.len()).map(|i| Dialect::Sqlite.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            q(table),
            names.join(", "),
            slots.join(", ")
        );
        let params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        execute_sync(&self.conn(), &sql, &params)
            .unwrap_or_else(|e| std::panic::panic_any(format!("seeding {table}: {e}")));
    }

    fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let delay = {
            let mut journal = self.journal();
            journal.admit(sql)?;
            journal.query_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        query_sync(&self.conn(), sql, params).map_err(|e| query_error(sql, e))
    }

    fn statement(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.journal().admit(sql)?;
        execute_sync(&self.conn(), sql, params).map_err(|e| query_error(sql, e))
    }

    fn insert_sync(&self, sql: &str, params: &[Value]) -> Result<i64, Error> {
        self.journal().admit(sql)?;
        let conn = self.conn();
        execute_sync(&conn, sql, params).map_err(|e| query_error(sql, e))?;
        Ok(conn.last_insert_rowid())
    }

    fn begin_sync(&self) -> Result<(), Error> {
        {
            let mut journal = self.journal();
            journal.log.push("BEGIN".to_string());
            journal.begins += 1;
        }
        self.conn()
            .execute_batch("BEGIN")
            .map_err(|e| query_error("BEGIN", e))
    }

    fn commit_sync(&self) -> Result<(), Error> {
        self.journal().admit("COMMIT")?;
        self.conn()
            .execute_batch("COMMIT")
            .map_err(|e| query_error("COMMIT", e))?;
        self.journal().commits += 1;
        Ok(())
    }

    fn rollback_sync(&self) -> Result<(), Error> {
        {
            let mut journal = self.journal();
            journal.log.push("ROLLBACK".to_string());
            journal.rollbacks += 1;
        }
        self.conn()
            .execute_batch("ROLLBACK")
            .map_err(|e| query_error("ROLLBACK", e))
    }
}

fn settle<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Connection for MemoryDatabase {
    type Tx<'conn>
        = MemoryTransaction<'conn>
    where
        Self: 'conn;

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = settle(self.select(sql, params));
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = settle(self.statement(sql, params));
        async move { result }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = settle(self.begin_sync().map(|()| MemoryTransaction {
            db: self,
            finished: false,
        }));
        async move { result }
    }
}

/// An open SQLite transaction; rolled back when dropped unfinished.
pub struct MemoryTransaction<'conn> {
    db: &'conn MemoryDatabase,
    finished: bool,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.db.conn().execute_batch("ROLLBACK");
        }
    }
}

impl TransactionOps for MemoryTransaction<'_> {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let admitted = self.db.journal().admit(sql);
        let result = settle(admitted.and_then(|()| {
            query_sync(&self.db.conn(), sql, params).map_err(|e| query_error(sql, e))
        }));
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = settle(self.db.statement(sql, params));
        async move { result }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = settle(self.db.insert_sync(sql, params));
        async move { result }
    }

    fn commit(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.db.commit_sync();
        self.finished = result.is_ok();
        let result = settle(result);
        async move { result }
    }

    fn rollback(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.finished = true;
        let result = settle(self.db.rollback_sync());
        async move { result }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A table creator for the test entities, speaking SQLite.
pub fn creator() -> TableCreator {
    TableCreator::new(model::registry()).dialect(Dialect::Sqlite)
}

/// Create every registered table in `db`.
pub async fn create_schema(cx: &Cx, db: &MemoryDatabase) {
    let report = unwrap_outcome(creator().create_tables(cx, db).await);
    assert!(report.is_success(), "schema creation failed: {report:?}");
}

/// A session over `db` rendering SQLite placeholders.
pub fn session(db: &MemoryDatabase) -> Session<MemoryDatabase> {
    let config = SessionConfig {
        dialect: Dialect::Sqlite,
        ..SessionConfig::default()
    };
    Session::with_config(db.clone(), model::registry(), config)
}
