mod support;

use relmap::prelude::*;
use relmap::{DdlErrorPolicy, DdlOutcome, Dialect};

use support::{MemoryDatabase, block_on, creator, unwrap_outcome};

#[test]
fn creates_referenced_tables_first() {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();

    let report = block_on(async {
        unwrap_outcome(creator().create_tables(&cx, &db).await)
    });
    assert!(report.is_success());
    assert_eq!(report.applied(), 3);

    let creates: Vec<String> = db
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("CREATE TABLE"))
        .collect();
    let position = |table: &str| {
        creates
            .iter()
            .position(|s| s.starts_with(&format!("CREATE TABLE \"{table}\"")))
            .expect("table created")
    };
    assert!(position("DEPARTMENT") < position("EMPLOYEE"));
    assert!(db.has_table("VEHICLE"));
}

#[test]
fn existing_tables_are_ignored_or_reported_by_policy() {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();

    block_on(async {
        unwrap_outcome(creator().create_tables(&cx, &db).await);

        let ignoring = creator().error_policy(DdlErrorPolicy::Ignore);
        let report = unwrap_outcome(ignoring.create_tables(&cx, &db).await);
        assert!(report.is_success());
        assert_eq!(report.ignored(), 3);
        assert!(matches!(report.outcome("EMPLOYEE"), Some(DdlOutcome::Ignored(_))));

        let strict = creator();
        let report = unwrap_outcome(strict.create_tables(&cx, &db).await);
        assert!(!report.is_success());
        assert_eq!(report.entries().len(), 1, "the first failure stops the run");
        match report.into_result() {
            Err(Error::Schema(e)) => assert!(e.source.is_some()),
            other => panic!("expected schema error, got {other:?}"),
        }
    });
}

#[test]
fn replace_drops_dependents_first_then_recreates() {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();

    block_on(async {
        let creator = creator();
        unwrap_outcome(creator.create_tables(&cx, &db).await);
        db.clear_log();

        let report = unwrap_outcome(creator.replace_tables(&cx, &db).await);
        assert!(report.is_success());
        assert_eq!(report.applied(), 6);
    });

    let statements = db.statements();
    let drop_emp = statements
        .iter()
        .position(|s| s == "DROP TABLE \"EMPLOYEE\"")
        .expect("employee dropped");
    let drop_dept = statements
        .iter()
        .position(|s| s == "DROP TABLE \"DEPARTMENT\"")
        .expect("department dropped");
    assert!(drop_emp < drop_dept);
    assert_eq!(db.count_statements("CREATE TABLE"), 3);
}

#[test]
fn drop_is_retried_before_it_counts_as_failed() {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();
    db.fail_on("DROP TABLE \"VEHICLE\"");

    block_on(async {
        let creator = creator().drop_retries(3);
        unwrap_outcome(creator.create_tables(&cx, &db).await);

        let report = unwrap_outcome(creator.drop_tables(&cx, &db).await);
        assert!(matches!(report.outcome("VEHICLE"), Some(DdlOutcome::Failed(_))));
        assert!(!report.is_success());
    });

    assert_eq!(db.count_statements("DROP TABLE \"VEHICLE\""), 3);
}

#[derive(Debug, Clone, Default)]
struct Team {
    id: i64,
    captain: Option<i64>,
}

impl Entity for Team {
    const ENTITY_NAME: &'static str = "Team";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("TEAM")
            .field("id", "ID", SqlType::BigInt, |t| t.id.into(), |t, v| {
                t.id = v.try_into()?;
                Ok(())
            })
            .reference("captain", "CAPTAIN_ID", SqlType::BigInt, "Player", |t| t.captain.into(), |t, v| {
                t.captain = v.try_into()?;
                Ok(())
            })
            .primary_key(&["id"])
    }
}

#[derive(Debug, Clone, Default)]
struct Player {
    id: i64,
    team: Option<i64>,
}

impl Entity for Player {
    const ENTITY_NAME: &'static str = "Player";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("PLAYER")
            .field("id", "ID", SqlType::BigInt, |p| p.id.into(), |p, v| {
                p.id = v.try_into()?;
                Ok(())
            })
            .reference("team", "TEAM_ID", SqlType::BigInt, "Team", |p| p.team.into(), |p, v| {
                p.team = v.try_into()?;
                Ok(())
            })
            .primary_key(&["id"])
    }
}

#[test]
fn mutually_referencing_tables_round_trip() {
    let db = MemoryDatabase::new();
    let cx = Cx::for_testing();
    let registry = RegistryBuilder::new()
        .register::<Team>()
        .register::<Player>()
        .seal()
        .unwrap();
    let creator = TableCreator::new(registry).dialect(Dialect::Sqlite);

    block_on(async {
        let report = unwrap_outcome(creator.create_tables(&cx, &db).await);
        assert!(report.is_success(), "{report:?}");
        assert!(db.has_table("TEAM") && db.has_table("PLAYER"));

        db.clear_log();
        let report = unwrap_outcome(creator.replace_tables(&cx, &db).await);
        assert!(report.is_success(), "{report:?}");

        // Both keys are enforced once the tables exist.
        db.seed("TEAM", &[("ID", Value::BigInt(1))]);
        db.seed("PLAYER", &[("ID", Value::BigInt(7)), ("TEAM_ID", Value::BigInt(1))]);
        let dangling = db
            .execute(&cx, "INSERT INTO \"TEAM\" (\"ID\", \"CAPTAIN_ID\") VALUES (2, 99)", &[])
            .await;
        assert!(matches!(
            dangling,
            Outcome::Err(Error::Query(ref e)) if e.kind == relmap::error::QueryErrorKind::Constraint
        ));
    });

    assert_eq!(db.count_statements("DROP TABLE"), 2);
    assert_eq!(db.count_statements("CREATE TABLE"), 2);
    assert_eq!(db.row_count("TEAM"), 1);
}
