#[path = "../support/mod.rs"]
mod support;

use strata::{
    ArrayRow, BatchOperation, DatabaseBridge, ErrorKind, InitOutcome, MigrationSet, Result,
    Schema, SqlValue,
};
use support::{init_tracing, TempDb};

const SCHEMA_V1: &str = "CREATE TABLE posts (id TEXT PRIMARY KEY, body TEXT);";

fn insert_post(id: &str) -> BatchOperation {
    BatchOperation::insert(
        "posts",
        "INSERT INTO posts (id, body) VALUES (?, 'hello')",
        vec![vec![SqlValue::from(id)]],
    )
}

#[test]
fn queued_calls_replay_in_order_after_schema_setup() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("queue.db")?;
    let bridge = DatabaseBridge::new();

    let outcome = bridge.initialize(1, temp.config(), 1).wait()?;
    assert_eq!(outcome, InitOutcome::SchemaNeeded);
    assert!(bridge.is_waiting(1));

    let mut inserted = bridge.batch(1, vec![insert_post("p1")]);
    let counted = bridge.count(1, "SELECT count(*) FROM posts".into(), Vec::new());
    let found = bridge.find(1, "posts".into(), "p1".into());
    assert!(inserted.try_take().is_none());

    bridge
        .set_up_with_schema(1, temp.config(), Schema::new(1, SCHEMA_V1))
        .wait()?;
    assert!(!bridge.is_waiting(1));

    inserted.wait()?;
    assert_eq!(counted.wait()?, 1);
    assert!(matches!(found.wait()?, strata::FindResult::Cached(id) if id == "p1"));

    bridge.close(1);
    assert!(!bridge.has_connection(1));
    Ok(())
}

#[test]
fn failed_migration_fails_queued_calls() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("migrate.db")?;
    {
        let db = temp.open()?;
        db.execute_script(SCHEMA_V1)?;
        db.set_version(1)?;
        db.close();
    }

    let bridge = DatabaseBridge::new();
    let outcome = bridge.initialize(9, temp.config(), 2).wait()?;
    assert_eq!(outcome, InitOutcome::MigrationsNeeded { database_version: 1 });

    let queued = bridge.count(9, "SELECT count(*) FROM posts".into(), Vec::new());
    let err = bridge
        .set_up_with_migrations(
            9,
            temp.config(),
            MigrationSet::new(1, 2, "ALTER TABLE missing ADD COLUMN x TEXT;"),
        )
        .wait()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);

    assert_eq!(queued.wait().unwrap_err().kind(), ErrorKind::Closed);
    assert!(!bridge.has_connection(9));

    let db = temp.open()?;
    assert_eq!(db.version()?, 1);
    Ok(())
}

#[test]
fn successful_migration_connects_and_bumps_version() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("migrate_ok.db")?;
    {
        let db = temp.open()?;
        db.execute_script(SCHEMA_V1)?;
        db.set_version(1)?;
    }

    let bridge = DatabaseBridge::new();
    bridge.initialize(3, temp.config(), 2).wait()?;
    let queued = bridge.query_ids(3, "SELECT id, tag FROM posts".into(), Vec::new());
    bridge
        .set_up_with_migrations(
            3,
            temp.config(),
            MigrationSet::new(1, 2, "ALTER TABLE posts ADD COLUMN tag TEXT;"),
        )
        .wait()?;
    assert!(queued.wait()?.is_empty());
    assert_eq!(
        bridge.count(3, "PRAGMA user_version".into(), Vec::new()).wait()?,
        2
    );
    Ok(())
}

#[test]
fn current_schema_connects_immediately() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("current.db")?;
    let bridge = DatabaseBridge::new();
    bridge.initialize(4, temp.config(), 1).wait()?;
    bridge
        .set_up_with_schema(4, temp.config(), Schema::new(1, SCHEMA_V1))
        .wait()?;
    bridge.close(4);

    let outcome = bridge.initialize(4, temp.config(), 1).wait()?;
    assert_eq!(outcome, InitOutcome::Ok);
    assert_eq!(bridge.unsafe_get_local_synchronously(4, "missing")?, None);

    let err = bridge.initialize(4, temp.config(), 1).wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    Ok(())
}

#[test]
fn synchronous_local_read_rejects_waiting_tag() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("waiting.db")?;
    let bridge = DatabaseBridge::new();
    bridge.initialize(5, temp.config(), 1).wait()?;
    let err = bridge.unsafe_get_local_synchronously(5, "k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    Ok(())
}

#[test]
fn json_batch_array_query_and_raw_script_queue_like_other_calls() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("json.db")?;
    let bridge = DatabaseBridge::new();
    bridge.initialize(6, temp.config(), 1).wait()?;

    let inserted = bridge.batch_json(
        6,
        r#"[
            {"effect": 1, "table": "posts", "sql": "INSERT INTO posts (id, body) VALUES (?, ?)", "args": [["p1", "first"], ["p2", "second"]]},
            {"effect": 0, "sql": "INSERT INTO posts (id, body) VALUES (?, ?)", "args": [["p3", "third"]]},
            {"effect": -1, "table": "posts", "sql": "DELETE FROM posts WHERE id = ?", "args": [["p2"]]}
        ]"#
        .to_owned(),
    );
    let scripted = bridge.unsafe_execute_multiple(
        6,
        "CREATE TABLE notes (id TEXT PRIMARY KEY); INSERT INTO notes VALUES ('n1');".to_owned(),
    );
    let array = bridge.query_as_array(
        6,
        "posts".into(),
        "SELECT id, body FROM posts ORDER BY id".into(),
        Vec::new(),
    );

    bridge
        .set_up_with_schema(6, temp.config(), Schema::new(1, SCHEMA_V1))
        .wait()?;
    inserted.wait()?;
    scripted.wait()?;

    let array = array.wait()?;
    assert_eq!(array.columns, vec!["id", "body"]);
    assert_eq!(
        array.rows,
        vec![
            ArrayRow::Cached("p1".into()),
            ArrayRow::Values(vec![SqlValue::from("p3"), SqlValue::from("third")]),
        ]
    );
    assert_eq!(
        bridge.count(6, "SELECT count(*) FROM notes".into(), Vec::new()).wait()?,
        1
    );

    let again = bridge
        .query_as_array(6, "posts".into(), "SELECT id, body FROM posts WHERE id = 'p3'".into(), Vec::new())
        .wait()?;
    assert_eq!(again.rows, vec![ArrayRow::Cached("p3".into())]);
    Ok(())
}

#[test]
fn malformed_payloads_fail_as_engine_errors() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("bad_json.db")?;
    let bridge = DatabaseBridge::new();
    bridge.initialize(7, temp.config(), 1).wait()?;
    bridge
        .set_up_with_schema(7, temp.config(), Schema::new(1, SCHEMA_V1))
        .wait()?;

    let err = bridge
        .batch_json(7, r#"[{"effect": 2, "table": "posts", "sql": "DELETE FROM posts"}]"#.into())
        .wait()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    let err = bridge.batch_json(7, "not json".into()).wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);

    let err = bridge
        .unsafe_execute_multiple(7, "INSERT INTO posts (id) VALUES ('x'); SELECT * FROM missing;".into())
        .wait()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert_eq!(
        bridge.count(7, "SELECT count(*) FROM posts".into(), Vec::new()).wait()?,
        1
    );

    let err = bridge.batch_json(99, "[]".into()).wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}
