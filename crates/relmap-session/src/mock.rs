//! In-memory connection used by this crate's unit tests.

use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use relmap_core::{
    Connection, DescriptorBuilder, DescriptorRegistry, Entity, Error, RegistryBuilder, Row,
    SqlType, TransactionOps, Value,
};

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub salary: Option<i64>,
}

impl Entity for Employee {
    const ENTITY_NAME: &'static str = "Employee";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("EMPLOYEE")
            .field("id", "EMP_ID", SqlType::BigInt, |e| e.id.into(), |e, v| {
                e.id = v.try_into()?;
                Ok(())
            })
            .field("name", "NAME", SqlType::Text, |e| e.name.clone().into(), |e, v| {
                e.name = v.try_into()?;
                Ok(())
            })
            .field("salary", "SALARY", SqlType::BigInt, |e| e.salary.into(), |e, v| {
                e.salary = v.try_into()?;
                Ok(())
            })
            .primary_key(&["id"])
            .generated_key()
    }
}

pub(crate) fn registry() -> Arc<DescriptorRegistry> {
    RegistryBuilder::new()
        .register::<Employee>()
        .seal()
        .expect("seal test registry")
}

pub(crate) fn employee_row(id: i64, name: &str, salary: i64) -> Row {
    Row::new(
        vec!["EMP_ID".into(), "NAME".into(), "SALARY".into()],
        vec![
            Value::BigInt(id),
            Value::Text(name.into()),
            Value::BigInt(salary),
        ],
    )
}

#[derive(Debug)]
pub(crate) struct MockState {
    pub rows: Vec<Row>,
    pub query_calls: usize,
    pub last_sql: Option<String>,
    pub executed: Vec<(String, Vec<Value>)>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Fail any statement whose SQL contains this text.
    pub fail_on: Option<String>,
    pub fail_queries: bool,
    pub next_id: i64,
    /// Rows reported as affected by UPDATE and DELETE.
    pub affected: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            query_calls: 0,
            last_sql: None,
            executed: Vec::new(),
            begins: 0,
            commits: 0,
            rollbacks: 0,
            fail_on: None,
            fail_queries: false,
            next_id: 100,
            affected: 1,
        }
    }
}

impl MockState {
    pub(crate) fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    fn select(&mut self, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        self.query_calls += 1;
        self.last_sql = Some(sql.to_string());
        if self.fail_queries {
            return Outcome::Err(Error::database("query failed"));
        }
        // Keyed reads filter on the first column; other reads return every row.
        let rows = if sql.contains("WHERE \"EMP_ID\" = ") {
            self.rows
                .iter()
                .filter(|row| match (row.get(0), params.first()) {
                    (Some(value), Some(param)) => value.key_eq(param),
                    _ => false,
                })
                .cloned()
                .collect()
        } else {
            self.rows.clone()
        };
        Outcome::Ok(rows)
    }

    fn statement(&mut self, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        if self.fail_on.as_deref().is_some_and(|needle| sql.contains(needle)) {
            return Outcome::Err(Error::database(format!("injected failure: {sql}")));
        }
        self.executed.push((sql.to_string(), params.to_vec()));
        Outcome::Ok(self.affected)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub(crate) fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl Connection for MockConnection {
    type Tx<'conn>
        = MockTransaction
    where
        Self: 'conn;

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.state.lock().expect("lock poisoned").select(sql, params);
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.state.lock().expect("lock poisoned").statement(sql, params);
        async move { result }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.state.lock().expect("lock poisoned").begins += 1;
        let tx = MockTransaction {
            state: Arc::clone(&self.state),
        };
        async move { Outcome::Ok(tx) }
    }
}

pub(crate) struct MockTransaction {
    state: Arc<Mutex<MockState>>,
}

impl TransactionOps for MockTransaction {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.state.lock().expect("lock poisoned").select(sql, params);
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.state.lock().expect("lock poisoned").statement(sql, params);
        async move { result }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let mut state = self.state.lock().expect("lock poisoned");
        let result = match state.statement(sql, params) {
            Outcome::Ok(_) => {
                let id = state.next_id;
                state.next_id += 1;
                Outcome::Ok(id)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        drop(state);
        async move { result }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().expect("lock poisoned").commits += 1;
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().expect("lock poisoned").rollbacks += 1;
        async { Outcome::Ok(()) }
    }
}
