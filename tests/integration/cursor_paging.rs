#[path = "../support/mod.rs"]
mod support;

use strata::{
    CancellationSignal, Database, DatabaseOptions, ErrorKind, FieldType, Result, SqlValue,
};
use support::{init_tracing, TempDb};

const ROWS: i64 = 500;

fn seeded(temp: &TempDb, window_size: usize) -> Result<Database> {
    init_tracing();
    let db = Database::open(temp.config_with(DatabaseOptions {
        cursor_window_size: window_size,
        ..DatabaseOptions::default()
    }))?;
    db.execute_sql(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, weight REAL)",
        &[],
    )?;
    db.transaction(|session| {
        for i in 0..ROWS {
            session.execute_sql(
                "INSERT INTO notes (id, body, weight) VALUES (?, ?, ?)",
                &[
                    SqlValue::Int(i),
                    SqlValue::from(format!("note number {i:04}")),
                    SqlValue::Float(i as f64 / 2.0),
                ],
            )?;
        }
        Ok(())
    })?;
    Ok(db)
}

#[test]
fn forward_scan_visits_every_row_in_order() -> Result<()> {
    let temp = TempDb::new("forward.db")?;
    let db = seeded(&temp, 2048)?;
    let mut cursor = db.raw_query("SELECT id, body FROM notes ORDER BY id", &[])?;
    assert_eq!(cursor.count()?, ROWS);

    let mut seen = 0;
    while cursor.move_to_next()? {
        assert_eq!(cursor.get_long(0)?, seen);
        assert_eq!(
            cursor.get_string(1)?.as_deref(),
            Some(format!("note number {seen:04}").as_str())
        );
        seen += 1;
    }
    assert_eq!(seen, ROWS);
    assert!(cursor.is_after_last()?);
    cursor.close();
    Ok(())
}

#[test]
fn window_never_holds_the_whole_result() -> Result<()> {
    let temp = TempDb::new("bounded.db")?;
    let db = seeded(&temp, 2048)?;
    let mut cursor = db.raw_query("SELECT id, body FROM notes ORDER BY id", &[])?;
    assert!(cursor.move_to_first()?);
    let first_rows = cursor.window().map_or(0, |w| w.num_rows());
    assert!(first_rows > 0);
    assert!((first_rows as i64) < ROWS);
    cursor.close();
    Ok(())
}

#[test]
fn backward_scan_and_random_jumps_refill() -> Result<()> {
    let temp = TempDb::new("backward.db")?;
    let db = seeded(&temp, 2048)?;
    let mut cursor = db.raw_query("SELECT id FROM notes ORDER BY id", &[])?;

    assert!(cursor.move_to_last()?);
    assert!(cursor.is_last()?);
    let mut expected = ROWS - 1;
    loop {
        assert_eq!(cursor.get_long(0)?, expected);
        if !cursor.move_to_previous()? {
            break;
        }
        expected -= 1;
    }
    assert_eq!(expected, 0);
    assert!(cursor.is_before_first()?);

    for target in [250, 3, 499, 120, 121, 0] {
        assert!(cursor.move_to_position(target)?);
        assert_eq!(cursor.get_long(0)?, target);
        let window = cursor.window().expect("window after move");
        let start = window.start_position() as i64;
        assert!(start <= target && target < start + window.num_rows() as i64);
    }
    cursor.close();
    Ok(())
}

#[test]
fn typed_getters_and_null_handling() -> Result<()> {
    let temp = TempDb::new("typed.db")?;
    let db = seeded(&temp, 2048)?;
    db.execute_sql("UPDATE notes SET weight = NULL WHERE id = 7", &[])?;
    let mut cursor = db.raw_query(
        "SELECT id, body, weight FROM notes WHERE id IN (6, 7) ORDER BY id",
        &[],
    )?;
    assert!(cursor.move_to_first()?);
    assert_eq!(cursor.get_type(2)?, FieldType::Float);
    assert_eq!(cursor.get_double(2)?, 3.0);
    assert_eq!(cursor.get_int(0)?, 6);

    assert!(cursor.move_to_next()?);
    assert!(cursor.is_null(2)?);
    assert_eq!(cursor.get_type(2)?, FieldType::Null);
    assert_eq!(cursor.get_long(2)?, 0);
    assert_eq!(cursor.get_string(2)?, None);
    assert_eq!(cursor.column_index("weight"), Some(2));
    assert_eq!(
        cursor.column_index_or_err("missing").unwrap_err().kind(),
        ErrorKind::Engine
    );
    cursor.close();
    Ok(())
}

#[test]
fn requery_sees_new_rows() -> Result<()> {
    let temp = TempDb::new("requery.db")?;
    let db = seeded(&temp, 2048)?;
    let mut cursor = db.raw_query("SELECT count(*) FROM notes WHERE id >= ?", &[SqlValue::Int(490)])?;
    assert!(cursor.move_to_first()?);
    assert_eq!(cursor.get_long(0)?, 10);

    db.execute_sql(
        "INSERT INTO notes (id, body) VALUES (?, 'late')",
        &[SqlValue::Int(ROWS)],
    )?;
    assert!(cursor.requery()?);
    assert_eq!(cursor.position(), -1);
    assert!(cursor.move_to_first()?);
    assert_eq!(cursor.get_long(0)?, 11);

    cursor.set_selection_arguments(&[SqlValue::Int(0)])?;
    assert!(cursor.requery()?);
    assert!(cursor.move_to_first()?);
    assert_eq!(cursor.get_long(0)?, ROWS + 1);

    cursor.close();
    assert!(cursor.is_closed());
    assert!(!cursor.requery()?);
    assert_eq!(cursor.count().unwrap_err().kind(), ErrorKind::Misuse);
    Ok(())
}

#[test]
fn empty_result_has_no_rows() -> Result<()> {
    let temp = TempDb::new("empty.db")?;
    let db = seeded(&temp, 2048)?;
    let mut cursor = db.raw_query("SELECT id FROM notes WHERE id < 0", &[])?;
    assert_eq!(cursor.count()?, 0);
    assert!(!cursor.move_to_first()?);
    assert!(cursor.is_before_first()?);
    assert_eq!(
        cursor.get_long(0).unwrap_err().kind(),
        ErrorKind::Engine
    );
    cursor.close();
    Ok(())
}

#[test]
fn canceled_signal_stops_query_before_it_runs() -> Result<()> {
    let temp = TempDb::new("cancel.db")?;
    let db = seeded(&temp, 2048)?;
    let signal = CancellationSignal::new();
    signal.cancel();
    let err = db
        .session()?
        .raw_query_with_cancellation("SELECT id FROM notes", &[], Some(signal))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    Ok(())
}
