#[path = "../support/mod.rs"]
mod support;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata::{
    delete_database, CorruptDatabase, CorruptionHandler, Database, DeleteDatabaseOnCorruption,
    ErrorKind, OpenMode, Result,
};
use support::{init_tracing, TempDb};

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl CorruptionHandler for CountingHandler {
    fn on_corruption(&self, database: &CorruptDatabase) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DeleteDatabaseOnCorruption.on_corruption(database);
    }
}

fn write_garbage(temp: &TempDb) -> Result<()> {
    let garbage: Vec<u8> = (0..8192u32).map(|i| (i * 31 % 251) as u8).collect();
    fs::write(&temp.path, garbage)?;
    Ok(())
}

#[test]
fn corrupt_file_is_deleted_and_reopened() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("garbage.db")?;
    write_garbage(&temp)?;

    let handler = Arc::new(CountingHandler::default());
    let db = Database::open(temp.config().with_corruption_handler(handler.clone()))?;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    db.execute_sql("CREATE TABLE fresh (id INTEGER PRIMARY KEY)", &[])?;
    db.execute_sql("INSERT INTO fresh DEFAULT VALUES", &[])?;
    assert_eq!(db.query_num_entries("fresh", None, &[])?, 1);
    assert!(db.is_database_integrity_ok()?);
    Ok(())
}

#[test]
fn read_only_open_reports_corruption_without_deleting() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("readonly.db")?;
    write_garbage(&temp)?;

    let handler = Arc::new(CountingHandler::default());
    let err = Database::open(
        temp.config()
            .with_open_mode(OpenMode::ReadOnly)
            .with_corruption_handler(handler.clone()),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert!(temp.path.exists());
    Ok(())
}

#[test]
fn delete_database_removes_sidecars() -> Result<()> {
    let temp = TempDb::new("sidecars.db")?;
    let base = temp.path.to_string_lossy().into_owned();
    for path in [
        base.clone(),
        format!("{base}-journal"),
        format!("{base}-wal"),
        format!("{base}-shm"),
        format!("{base}-mj0123ABCD"),
    ] {
        fs::write(&path, b"x")?;
    }
    fs::write(temp.dir.path().join("unrelated.db"), b"x")?;

    assert!(delete_database(&temp.path)?);
    let remaining: Vec<String> = fs::read_dir(temp.dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["unrelated.db".to_owned()]);
    assert!(!delete_database(&temp.path)?);
    Ok(())
}
