//! In-memory evaluation must select exactly the rows SQLite selects.

mod support;

use relmap::prelude::*;

use support::model::{Employee, registry};
use support::{MemoryDatabase, block_on, create_schema, session, unwrap_outcome};

fn staff() -> Vec<Employee> {
    [
        (1, "Ann", Some(500)),
        (2, "Bo", Some(1_500)),
        (3, "Cy", None),
        (4, "Di", Some(1_000)),
        (5, "Ed", Some(0)),
    ]
    .into_iter()
    .map(|(id, name, salary)| Employee {
        id: Some(id),
        name: name.to_string(),
        salary,
        dept: if id % 2 == 0 { Some(10) } else { None },
    })
    .collect()
}

fn predicates() -> Vec<Expr> {
    let salary = || Expr::attr("salary");
    vec![
        salary().eq(1_000_i64),
        salary().ne(1_000_i64),
        salary().lt(1_000_i64),
        salary().ge(500_i64),
        salary().is_null(),
        salary().is_not_null(),
        salary().gt(100_i64).not(),
        salary().lt(600_i64).or(Expr::attr("name").eq("Cy")),
        salary().gt(100_i64).and(Expr::attr("dept").is_null()),
        salary().gt(2_000_i64).or(salary().lt(0_i64)).not(),
        Expr::attr("dept").eq(10_i64).or(salary().eq(0_i64)).and(Expr::attr("name").ne("Bo")),
        Expr::attr("name").ge("Cy"),
        salary().eq(Expr::lit(Value::Null)),
        salary().eq(Expr::lit(Value::Null)).not(),
    ]
}

/// Seed `staff` into a fresh SQLite database and check that every predicate
/// selects the same names in memory and in the database.
fn assert_agreement(staff: &[Employee], predicates: &[Expr]) {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();
    block_on(create_schema(&cx, &db));
    db.seed(
        "DEPARTMENT",
        &[("DEPT_ID", Value::BigInt(10)), ("NAME", Value::Text("Sales".into()))],
    );
    for e in staff {
        db.seed(
            "EMPLOYEE",
            &[
                ("EMP_ID", e.id.into()),
                ("NAME", e.name.clone().into()),
                ("SALARY", e.salary.into()),
                ("DEPT_ID", e.dept.into()),
            ],
        );
    }

    let registry = registry();
    let descriptor = registry.of::<Employee>().unwrap();

    for predicate in predicates {
        let mut in_memory: Vec<String> = staff
            .iter()
            .filter(|e| {
                let state = descriptor.read_state(*e).unwrap();
                predicate.evaluate(descriptor, &state).unwrap().is_true()
            })
            .map(|e| e.name.clone())
            .collect();
        in_memory.sort();

        // A fresh session each time so every answer comes from the database.
        let session = session(&db);
        let query = ReadAllQuery::<Employee>::new().filter(predicate.clone());
        let mut selected: Vec<String> = block_on(async {
            unwrap_outcome(session.read_all(&cx, &query).await)
                .iter()
                .map(|e| e.read().unwrap().name.clone())
                .collect()
        });
        selected.sort();

        assert_eq!(in_memory, selected, "disagreement on {predicate:?}");
    }
}

#[test]
fn evaluation_agrees_with_database_for_every_predicate() {
    assert_agreement(&staff(), &predicates());
}

#[test]
fn text_ordering_agrees_with_database_collation() {
    let staff: Vec<Employee> = ["Ann", "ann", "Bo", "Zed", "\u{c9}mile", "B", ""]
        .into_iter()
        .zip(1..)
        .map(|(name, id)| Employee {
            id: Some(id),
            ..Employee::new(name, 100)
        })
        .collect();
    let name = || Expr::attr("name");
    assert_agreement(
        &staff,
        &[
            name().lt("Bo"),
            name().le("B"),
            name().gt("Zed"),
            name().ge("a"),
            name().gt("").and(name().lt("an")),
            name().ne("ann").and(name().ge("Ann")),
        ],
    );
}

#[test]
fn comparisons_with_null_are_unknown_in_both_directions() {
    let registry = registry();
    let descriptor = registry.of::<Employee>().unwrap();
    let unpaid = Employee::new("Cy", 0);
    let unpaid = Employee {
        salary: None,
        ..unpaid
    };
    let state = descriptor.read_state(&unpaid).unwrap();

    let lt = Expr::attr("salary").lt(10_i64);
    assert_eq!(lt.evaluate(descriptor, &state).unwrap(), Truth::Unknown);
    assert_eq!(lt.clone().not().evaluate(descriptor, &state).unwrap(), Truth::Unknown);
    assert_eq!(
        lt.or(Expr::attr("name").eq("Cy"))
            .evaluate(descriptor, &state)
            .unwrap(),
        Truth::True
    );
}

#[test]
fn rendered_sql_uses_columns_and_placeholders() {
    let registry = registry();
    let descriptor = registry.of::<Employee>().unwrap();
    let expr = Expr::attr("salary")
        .gt(100_i64)
        .or(Expr::attr("name").eq("Cy"))
        .and(Expr::attr("dept").is_not_null().not());

    let fragment = expr.to_sql_fragment(descriptor, relmap::Dialect::Postgres).unwrap();
    assert_eq!(
        fragment.text,
        "(\"SALARY\" > $1 OR \"NAME\" = $2) AND NOT (\"DEPT_ID\" IS NOT NULL)"
    );
    assert_eq!(fragment.params, [Value::BigInt(100), Value::Text("Cy".into())]);

    let sqlite = expr.to_sql_fragment(descriptor, relmap::Dialect::Sqlite).unwrap();
    assert!(sqlite.text.contains("?1") && sqlite.text.contains("?2"));
}

#[test]
fn unknown_attribute_is_a_descriptor_error() {
    let registry = registry();
    let descriptor = registry.of::<Employee>().unwrap();
    let err = Expr::attr("bonus")
        .gt(1_i64)
        .to_sql_fragment(descriptor, relmap::Dialect::Postgres)
        .unwrap_err();
    assert!(matches!(err, Error::Descriptor(_)));
}
