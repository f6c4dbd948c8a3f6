#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata::{
    CustomFunction, Database, DatabaseOptions, ErrorKind, FunctionResult, Result, RowChange,
    SqlValue, UpdateHook,
};
use support::{init_tracing, memory_db, TempDb};

fn people_db() -> Result<Database> {
    init_tracing();
    let db = memory_db()?;
    db.execute_sql("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
    Ok(db)
}

fn journal_mode(db: &Database) -> Result<String> {
    Ok(db
        .string_for_query("PRAGMA journal_mode", &[])?
        .unwrap_or_default()
        .to_ascii_lowercase())
}

#[test]
fn write_ahead_logging_toggles_on_a_file_database() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("journal.db")?;
    let db = Database::open(temp.config_with(DatabaseOptions::fully_durable()))?;
    assert_eq!(journal_mode(&db)?, "delete");

    assert!(db.enable_write_ahead_logging()?);
    assert!(db.config().options.write_ahead_logging);
    assert_eq!(journal_mode(&db)?, "wal");
    assert!(db.enable_write_ahead_logging()?);

    db.disable_write_ahead_logging()?;
    assert!(!db.config().options.write_ahead_logging);
    assert_eq!(journal_mode(&db)?, "delete");
    Ok(())
}

#[test]
fn write_ahead_logging_is_unavailable_in_memory() -> Result<()> {
    let db = people_db()?;
    let before = db.config().options.clone();
    assert!(!db.enable_write_ahead_logging()?);
    assert_eq!(db.config().options, before);
    Ok(())
}

#[test]
fn write_ahead_logging_cannot_change_inside_a_transaction() -> Result<()> {
    init_tracing();
    let temp = TempDb::new("busy.db")?;
    let db = Database::open(temp.config_with(DatabaseOptions::fully_durable()))?;
    db.begin_transaction()?;
    let err = db.enable_write_ahead_logging().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    db.end_transaction()?;
    assert!(!db.config().options.write_ahead_logging);
    Ok(())
}

#[test]
fn statement_cache_size_is_bounded() -> Result<()> {
    let db = people_db()?;
    let err = db.set_max_sql_cache_size(101).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    assert_ne!(db.config().options.max_sql_cache_size, 101);

    db.set_max_sql_cache_size(100)?;
    assert_eq!(db.config().options.max_sql_cache_size, 100);
    db.set_max_sql_cache_size(0)?;
    assert_eq!(db.config().options.max_sql_cache_size, 0);
    assert_eq!(db.long_for_query("SELECT count(*) FROM people", &[])?, 0);
    Ok(())
}

#[test]
fn foreign_keys_toggle_outside_transactions_only() -> Result<()> {
    let db = people_db()?;
    db.execute_sql(
        "CREATE TABLE pets (id INTEGER PRIMARY KEY, owner INTEGER REFERENCES people(id))",
        &[],
    )?;

    db.begin_transaction()?;
    let err = db.set_foreign_key_constraints_enabled(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    db.end_transaction()?;

    db.set_foreign_key_constraints_enabled(false)?;
    db.execute_sql("INSERT INTO pets (owner) VALUES (42)", &[])?;

    db.set_foreign_key_constraints_enabled(true)?;
    assert!(db.config().options.foreign_keys);
    assert_eq!(db.long_for_query("PRAGMA foreign_keys", &[])?, 1);
    assert!(db.execute_sql("INSERT INTO pets (owner) VALUES (43)", &[]).is_err());
    Ok(())
}

#[test]
fn locale_is_recorded_and_empty_locale_rejected() -> Result<()> {
    let db = people_db()?;
    assert_eq!(db.set_locale("  ").unwrap_err().kind(), ErrorKind::Misuse);

    db.set_locale("fr_FR")?;
    assert_eq!(db.config().options.locale.as_deref(), Some("fr_FR"));
    assert_eq!(
        db.string_for_query("SELECT locale FROM locale_metadata", &[])?.as_deref(),
        Some("fr_FR")
    );

    db.set_locale("de_DE")?;
    assert_eq!(
        db.long_for_query("SELECT count(*) FROM locale_metadata", &[])?,
        1
    );
    Ok(())
}

#[test]
fn custom_function_is_callable_and_replaceable() -> Result<()> {
    let db = people_db()?;
    db.add_custom_function(CustomFunction::new("answer", 0, |_| FunctionResult::Long(1)))?;
    assert_eq!(db.long_for_query("SELECT answer()", &[])?, 1);

    db.add_custom_function(CustomFunction::new("answer", 0, |_| FunctionResult::Long(2)))?;
    assert_eq!(db.long_for_query("SELECT answer()", &[])?, 2);
    assert_eq!(db.config().functions.len(), 1);

    db.add_custom_function(CustomFunction::new("shout", 1, |args| {
        match args.get_string(0) {
            Ok(Some(text)) => FunctionResult::String(text.to_uppercase()),
            Ok(None) => FunctionResult::Null,
            Err(err) => FunctionResult::Error(err.to_string()),
        }
    }))?;
    assert_eq!(
        db.string_for_query("SELECT shout(?)", &[SqlValue::from("hey")])?.as_deref(),
        Some("HEY")
    );
    assert_eq!(db.long_for_query("SELECT answer()", &[])?, 2);
    Ok(())
}

#[derive(Default)]
struct CountingHook {
    inserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl UpdateHook for CountingHook {
    fn on_change(&self, change: RowChange, _database: &str, table: &str, _rowid: i64) {
        if table != "people" {
            return;
        }
        match change {
            RowChange::Insert => self.inserts.fetch_add(1, Ordering::SeqCst),
            RowChange::Delete => self.deletes.fetch_add(1, Ordering::SeqCst),
            RowChange::Update => 0,
        };
    }
}

#[test]
fn update_hook_sees_changes_until_removed() -> Result<()> {
    let db = people_db()?;
    let hook = Arc::new(CountingHook::default());
    db.set_update_hook(Some(hook.clone()))?;

    db.execute_sql("INSERT INTO people (name) VALUES ('ada')", &[])?;
    db.execute_sql("INSERT INTO people (name) VALUES ('bob')", &[])?;
    db.execute_sql("DELETE FROM people WHERE name = 'bob'", &[])?;
    assert_eq!(hook.inserts.load(Ordering::SeqCst), 2);
    assert_eq!(hook.deletes.load(Ordering::SeqCst), 1);

    db.set_update_hook(None)?;
    db.execute_sql("INSERT INTO people (name) VALUES ('cy')", &[])?;
    assert_eq!(hook.inserts.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn rejected_change_keeps_the_previous_configuration() -> Result<()> {
    let db = people_db()?;
    db.add_custom_function(CustomFunction::new("answer", 0, |_| FunctionResult::Long(7)))?;
    let before = db.config();

    let broken = CustomFunction::new("bad\0name", 0, |_| FunctionResult::Null);
    assert!(db.add_custom_function(broken).is_err());

    let after = db.config();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.functions.len(), 1);
    assert_eq!(db.long_for_query("SELECT answer()", &[])?, 7);

    db.set_max_sql_cache_size(5)?;
    assert_eq!(db.config().options.max_sql_cache_size, 5);
    assert_eq!(db.config().functions.len(), 1);
    Ok(())
}
