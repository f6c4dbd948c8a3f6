#[path = "../support/mod.rs"]
mod support;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use strata::{Database, DatabaseOptions, Result, SqlValue};
use support::{init_tracing, row_count, TempDb};

fn counters(temp: &TempDb, options: DatabaseOptions) -> Result<Database> {
    init_tracing();
    let db = Database::open(temp.config_with(options))?;
    db.execute_sql("CREATE TABLE hits (id INTEGER PRIMARY KEY, worker INTEGER)", &[])?;
    Ok(db)
}

fn wait_for_waiter(db: &Database) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if db.pool_stats().is_some_and(|stats| stats.waiting > 0) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn readers_proceed_while_writer_holds_a_transaction() -> Result<()> {
    let temp = TempDb::new("wal.db")?;
    let db = counters(&temp, DatabaseOptions::default())?;
    db.execute_sql("INSERT INTO hits (worker) VALUES (0)", &[])?;

    db.begin_transaction()?;
    db.execute_sql("INSERT INTO hits (worker) VALUES (1)", &[])?;

    let seen: Vec<i64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| scope.spawn(|| db.long_for_query("SELECT count(*) FROM hits", &[])))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("reader thread panicked"))
            .collect::<Result<_>>()
    })?;
    assert_eq!(seen, vec![1, 1, 1]);

    db.set_transaction_successful()?;
    db.end_transaction()?;
    assert_eq!(row_count(&db, "hits")?, 2);
    Ok(())
}

#[test]
fn writers_serialize_on_the_primary_connection() -> Result<()> {
    let temp = TempDb::new("writers.db")?;
    let db = counters(&temp, DatabaseOptions::default())?;

    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let db = &db;
                scope.spawn(move || {
                    db.transaction(|session| {
                        assert!(session.has_connection());
                        for _ in 0..50 {
                            session.execute_sql(
                                "INSERT INTO hits (worker) VALUES (?)",
                                &[SqlValue::Int(worker)],
                            )?;
                        }
                        Ok(())
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked")?;
        }
        Ok::<_, strata::StrataError>(())
    })?;

    assert_eq!(row_count(&db, "hits")?, 200);
    let stats = db.pool_stats().expect("pool open");
    assert!(!stats.primary_in_use);
    assert_eq!(stats.waiting, 0);
    Ok(())
}

#[test]
fn contended_transaction_yields_to_a_waiting_writer() -> Result<()> {
    let temp = TempDb::new("yield.db")?;
    let db = counters(&temp, DatabaseOptions::default())?;

    db.begin_transaction()?;
    db.execute_sql("INSERT INTO hits (worker) VALUES (1)", &[])?;
    assert!(!db.yield_if_contended(None)?);

    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|scope| -> Result<()> {
        let other = db.clone();
        scope.spawn(move || {
            let result = other.execute_sql("INSERT INTO hits (worker) VALUES (2)", &[]);
            let _ = done_tx.send(result.is_ok());
        });

        assert!(wait_for_waiter(&db), "second writer never blocked");
        assert!(db.yield_if_contended(Some(Duration::from_millis(20)))?);
        assert!(db.in_transaction());
        db.execute_sql("INSERT INTO hits (worker) VALUES (1)", &[])?;
        db.set_transaction_successful()?;
        db.end_transaction()?;
        Ok(())
    })?;

    assert_eq!(done_rx.recv().ok(), Some(true));
    assert_eq!(row_count(&db, "hits")?, 3);
    Ok(())
}

#[test]
fn rollback_journal_mode_uses_only_the_primary() -> Result<()> {
    let temp = TempDb::new("journal.db")?;
    let db = counters(&temp, DatabaseOptions::fully_durable())?;
    db.execute_sql("INSERT INTO hits (worker) VALUES (1)", &[])?;
    assert_eq!(db.long_for_query("SELECT count(*) FROM hits", &[])?, 1);

    let stats = db.pool_stats().expect("pool open");
    assert_eq!(stats.max_connections, 1);
    assert_eq!(stats.open_connections, 1);
    Ok(())
}

#[test]
fn closing_wakes_and_fails_new_checkouts() -> Result<()> {
    let temp = TempDb::new("close.db")?;
    let db = counters(&temp, DatabaseOptions::default())?;
    let other = db.clone();
    db.close();
    let err = thread::spawn(move || other.execute_sql("SELECT 1", &[]))
        .join()
        .expect("thread panicked")
        .unwrap_err();
    assert_eq!(err.kind(), strata::ErrorKind::Closed);
    assert!(db.pool_stats().is_none());
    Ok(())
}
