#[path = "../support/mod.rs"]
mod support;

use strata::{
    BatchOperation, DatabaseDriver, ErrorKind, FindResult, QueryRow, Result, Schema, SqlValue,
};
use support::{init_tracing, memory_db};

const TASKS_SCHEMA: &str = "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT, _status TEXT)";

fn driver() -> Result<DatabaseDriver> {
    init_tracing();
    let mut driver = DatabaseDriver::new(memory_db()?);
    driver.unsafe_reset_database(&Schema::new(1, TASKS_SCHEMA))?;
    Ok(driver)
}

fn insert_task(id: &str, title: &str) -> BatchOperation {
    BatchOperation::insert(
        "tasks",
        "INSERT INTO tasks (id, title, _status) VALUES (?, ?, 'synced')",
        vec![vec![SqlValue::from(id), SqlValue::from(title)]],
    )
}

#[test]
fn second_find_returns_only_the_id() -> Result<()> {
    let mut driver = driver()?;
    driver
        .database()
        .execute_sql("INSERT INTO tasks (id, title) VALUES ('t1', 'write tests')", &[])?;

    match driver.find("tasks", "t1")? {
        FindResult::Record(record) => {
            assert_eq!(record.id().as_deref(), Some("t1"));
            assert_eq!(record.get("title"), Some(&SqlValue::from("write tests")));
        }
        other => panic!("expected full record, got {other:?}"),
    }
    assert_eq!(driver.find("tasks", "t1")?, FindResult::Cached("t1".into()));
    assert_eq!(driver.find("tasks", "nope")?, FindResult::NotFound);
    assert!(!driver.cache().contains("tasks", "nope"));
    Ok(())
}

#[test]
fn batch_insert_then_delete_leaves_id_uncached() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[
        insert_task("1", "one"),
        insert_task("2", "two"),
        BatchOperation::delete(
            "tasks",
            "DELETE FROM tasks WHERE id = ?",
            vec![vec![SqlValue::from("2")]],
        ),
    ])?;

    assert!(driver.cache().contains("tasks", "1"));
    assert!(!driver.cache().contains("tasks", "2"));
    assert_eq!(driver.count("SELECT count(*) FROM tasks", &[])?, 1);
    Ok(())
}

#[test]
fn failed_batch_changes_neither_rows_nor_cache() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[insert_task("1", "one")])?;

    let err = driver
        .batch(&[
            insert_task("3", "three"),
            BatchOperation::neutral("INSERT INTO no_such_table VALUES (?)", vec![vec![SqlValue::Int(1)]]),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);

    assert!(!driver.cache().contains("tasks", "3"));
    assert_eq!(driver.cache().table_len("tasks"), 1);
    assert_eq!(driver.count("SELECT count(*) FROM tasks", &[])?, 1);
    Ok(())
}

#[test]
fn failed_batch_keeps_cached_id_it_tried_to_remove() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[insert_task("1", "one")])?;
    assert!(driver.cache().contains("tasks", "1"));

    let err = driver
        .batch(&[
            BatchOperation::delete(
                "tasks",
                "DELETE FROM tasks WHERE id = ?",
                vec![vec![SqlValue::from("1")]],
            ),
            BatchOperation::neutral("INSERT INTO no_such_table VALUES (?)", vec![vec![SqlValue::Int(1)]]),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);

    assert!(driver.cache().contains("tasks", "1"));
    assert_eq!(driver.count("SELECT count(*) FROM tasks WHERE id = '1'", &[])?, 1);
    assert_eq!(driver.find("tasks", "1")?, FindResult::Cached("1".into()));
    Ok(())
}

#[test]
fn batch_rejects_cache_effect_without_id() -> Result<()> {
    let mut driver = driver()?;
    let err = driver
        .batch(&[BatchOperation::insert(
            "tasks",
            "INSERT INTO tasks (id, title) VALUES (?, ?)",
            vec![vec![SqlValue::Null, SqlValue::from("anonymous")]],
        )])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(driver.cache().is_empty());
    assert_eq!(driver.count("SELECT count(*) FROM tasks", &[])?, 0);
    Ok(())
}

#[test]
fn cached_query_mixes_ids_and_records() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[BatchOperation::neutral(
        "INSERT INTO tasks (id, title) VALUES (?, ?)",
        vec![
            vec![SqlValue::from("a"), SqlValue::from("alpha")],
            vec![SqlValue::from("b"), SqlValue::from("beta")],
        ],
    )])?;
    assert!(driver.cache().is_empty());
    driver.find("tasks", "a")?;

    let rows = driver.cached_query("tasks", "SELECT * FROM tasks ORDER BY id", &[])?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], QueryRow::Cached("a".into()));
    match &rows[1] {
        QueryRow::Record(record) => assert_eq!(record.id().as_deref(), Some("b")),
        other => panic!("expected record, got {other:?}"),
    }

    let again = driver.cached_query_as_array("tasks", "SELECT * FROM tasks ORDER BY id", &[])?;
    assert_eq!(again.columns, vec!["id", "title", "_status"]);
    assert!(again
        .rows
        .iter()
        .all(|row| matches!(row, strata::driver::ArrayRow::Cached(_))));
    Ok(())
}

#[test]
fn destroyed_records_are_forgotten() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[
        insert_task("x", "keep"),
        insert_task("y", "drop"),
        BatchOperation::neutral(
            "UPDATE tasks SET _status = 'deleted' WHERE id = ?",
            vec![vec![SqlValue::from("y")]],
        ),
    ])?;
    let deleted = driver.get_deleted_records("tasks")?;
    assert_eq!(deleted, vec!["y".to_owned()]);

    driver.destroy_deleted_records("tasks", &deleted)?;
    assert!(!driver.cache().contains("tasks", "y"));
    assert!(driver.cache().contains("tasks", "x"));
    assert!(driver.get_deleted_records("tasks")?.is_empty());
    Ok(())
}

#[test]
fn reset_clears_cache_and_local_storage_survives_setup() -> Result<()> {
    let mut driver = driver()?;
    driver.batch(&[insert_task("1", "one")])?;
    driver.set_local("token", "abc")?;
    assert_eq!(driver.get_local("token")?.as_deref(), Some("abc"));

    driver.unsafe_reset_database(&Schema::new(2, TASKS_SCHEMA))?;
    assert!(driver.cache().is_empty());
    assert_eq!(driver.get_local("token")?, None);
    assert_eq!(driver.database().version()?, 2);
    assert_eq!(driver.count("SELECT count(*) FROM tasks", &[])?, 0);
    Ok(())
}
