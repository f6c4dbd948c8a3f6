#[path = "../support/mod.rs"]
mod support;

use std::cell::Cell;
use std::rc::Rc;

use strata::{
    Database, ErrorKind, Result, SqlValue, StrataError, TransactionListener, TransactionMode,
};
use support::{init_tracing, memory_db, row_count};

fn items_db() -> Result<Database> {
    init_tracing();
    let db = memory_db()?;
    db.execute_sql("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    Ok(db)
}

fn insert(db: &Database, name: &str) -> Result<()> {
    db.execute_sql("INSERT INTO items (name) VALUES (?)", &[SqlValue::from(name)])
}

#[test]
fn nested_levels_commit_when_all_marked() -> Result<()> {
    let db = items_db()?;
    db.begin_transaction()?;
    insert(&db, "outer")?;
    db.begin_transaction()?;
    insert(&db, "inner")?;
    db.set_transaction_successful()?;
    db.end_transaction()?;
    db.set_transaction_successful()?;
    db.end_transaction()?;

    assert!(!db.in_transaction());
    assert_eq!(row_count(&db, "items")?, 2);
    Ok(())
}

#[test]
fn unmarked_outer_level_rolls_back_everything() -> Result<()> {
    let db = items_db()?;
    db.begin_transaction()?;
    db.begin_transaction()?;
    insert(&db, "inner")?;
    db.set_transaction_successful()?;
    db.end_transaction()?;
    db.end_transaction()?;

    assert_eq!(row_count(&db, "items")?, 0);
    Ok(())
}

#[test]
fn failed_child_rolls_back_marked_parent() -> Result<()> {
    let db = items_db()?;
    db.begin_transaction()?;
    insert(&db, "outer")?;
    db.begin_transaction()?;
    insert(&db, "inner")?;
    db.end_transaction()?;
    db.set_transaction_successful()?;
    db.end_transaction()?;

    assert_eq!(row_count(&db, "items")?, 0);
    Ok(())
}

#[test]
fn protocol_violations_are_misuse() -> Result<()> {
    let db = items_db()?;
    let err = db.end_transaction().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    let err = db.set_transaction_successful().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);

    db.begin_transaction()?;
    db.set_transaction_successful()?;
    let err = db.set_transaction_successful().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    let err = db.begin_transaction().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    db.end_transaction()?;
    assert!(!db.in_transaction());
    Ok(())
}

#[test]
fn connection_is_held_for_the_whole_transaction() -> Result<()> {
    let db = items_db()?;
    assert!(!db.is_db_locked_by_current_thread());
    db.begin_transaction_with_mode(TransactionMode::Immediate)?;
    assert!(db.is_db_locked_by_current_thread());
    insert(&db, "a")?;
    assert!(db.is_db_locked_by_current_thread());
    db.set_transaction_successful()?;
    db.end_transaction()?;
    assert!(!db.is_db_locked_by_current_thread());
    Ok(())
}

#[test]
fn sql_transaction_statements_drive_the_session() -> Result<()> {
    let db = items_db()?;
    db.execute_sql("BEGIN", &[])?;
    assert!(db.in_transaction());
    insert(&db, "kept")?;
    db.execute_sql("COMMIT", &[])?;
    assert!(!db.in_transaction());

    db.execute_sql("BEGIN TRANSACTION", &[])?;
    insert(&db, "dropped")?;
    db.execute_sql("ROLLBACK", &[])?;
    assert_eq!(row_count(&db, "items")?, 1);
    Ok(())
}

#[derive(Default)]
struct Recorder {
    begins: Cell<u32>,
    commits: Cell<u32>,
    rollbacks: Cell<u32>,
    fail_begin: bool,
    fail_commit: bool,
}

impl TransactionListener for Recorder {
    fn on_begin(&self) -> Result<()> {
        self.begins.set(self.begins.get() + 1);
        if self.fail_begin {
            return Err(StrataError::Invalid("begin refused".into()));
        }
        Ok(())
    }

    fn on_commit(&self) -> Result<()> {
        self.commits.set(self.commits.get() + 1);
        if self.fail_commit {
            return Err(StrataError::Invalid("commit refused".into()));
        }
        Ok(())
    }

    fn on_rollback(&self) -> Result<()> {
        self.rollbacks.set(self.rollbacks.get() + 1);
        Ok(())
    }
}

#[test]
fn listener_sees_commit_and_rollback() -> Result<()> {
    let db = items_db()?;
    let session = db.session()?;
    let recorder = Rc::new(Recorder::default());

    session.begin_transaction(TransactionMode::Exclusive, Some(recorder.clone()))?;
    session.set_transaction_successful()?;
    session.end_transaction()?;
    session.begin_transaction(TransactionMode::Exclusive, Some(recorder.clone()))?;
    session.end_transaction()?;

    assert_eq!(recorder.begins.get(), 2);
    assert_eq!(recorder.commits.get(), 1);
    assert_eq!(recorder.rollbacks.get(), 1);
    Ok(())
}

#[test]
fn failing_begin_listener_releases_connection() -> Result<()> {
    let db = items_db()?;
    let session = db.session()?;
    let recorder = Rc::new(Recorder {
        fail_begin: true,
        ..Recorder::default()
    });
    assert!(session
        .begin_transaction(TransactionMode::Exclusive, Some(recorder))
        .is_err());
    assert!(!session.has_transaction());
    assert!(!session.has_connection());
    Ok(())
}

#[test]
fn failing_commit_listener_rolls_back() -> Result<()> {
    let db = items_db()?;
    let session = db.session()?;
    let recorder = Rc::new(Recorder {
        fail_commit: true,
        ..Recorder::default()
    });
    session.begin_transaction(TransactionMode::Exclusive, Some(recorder.clone()))?;
    insert(&db, "lost")?;
    session.set_transaction_successful()?;
    assert!(session.end_transaction().is_err());
    assert!(!session.has_transaction());
    assert_eq!(row_count(&db, "items")?, 0);
    Ok(())
}

#[test]
fn closure_transaction_commits_on_ok_and_rolls_back_on_err() -> Result<()> {
    let db = items_db()?;
    db.transaction(|session| {
        session.execute_sql("INSERT INTO items (name) VALUES ('a')", &[])?;
        assert!(session.has_transaction());
        Ok(())
    })?;
    let failed: Result<()> = db.transaction(|session| {
        session.execute_sql("INSERT INTO items (name) VALUES ('b')", &[])?;
        session.execute_sql("INSERT INTO missing_table VALUES (1)", &[])
    });
    assert_eq!(failed.unwrap_err().kind(), ErrorKind::Engine);
    assert_eq!(row_count(&db, "items")?, 1);
    Ok(())
}

#[test]
fn yield_rules() -> Result<()> {
    let db = items_db()?;
    assert_eq!(db.yield_if_contended(None).unwrap_err().kind(), ErrorKind::Misuse);

    db.begin_transaction()?;
    assert!(!db.yield_if_contended(None)?);
    db.begin_transaction()?;
    assert_eq!(db.yield_if_contended(None).unwrap_err().kind(), ErrorKind::Misuse);
    db.end_transaction()?;
    db.set_transaction_successful()?;
    assert_eq!(db.yield_if_contended(None).unwrap_err().kind(), ErrorKind::Misuse);
    db.end_transaction()?;
    Ok(())
}

#[test]
fn closed_database_fails_closed() -> Result<()> {
    let db = items_db()?;
    let session = db.session()?;
    db.close();
    assert!(!db.is_open());
    assert_eq!(db.session().unwrap_err().kind(), ErrorKind::Closed);
    assert_eq!(
        session.execute_sql("SELECT 1", &[]).unwrap_err().kind(),
        ErrorKind::Closed
    );
    Ok(())
}

#[test]
fn thread_exiting_inside_a_transaction_rolls_back() -> Result<()> {
    let db = items_db()?;
    let worker = db.clone();
    std::thread::spawn(move || -> Result<()> {
        worker.begin_transaction()?;
        insert(&worker, "abandoned")?;
        Ok(())
    })
    .join()
    .expect("worker panicked")?;

    assert!(!db.in_transaction());
    assert_eq!(row_count(&db, "items")?, 0);
    insert(&db, "after")?;
    assert_eq!(row_count(&db, "items")?, 1);
    Ok(())
}
