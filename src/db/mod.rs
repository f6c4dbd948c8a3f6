//! Database handles, configuration and per-thread sessions.

pub(crate) mod config;
mod corruption;
pub(crate) mod functions;
mod registry;
mod session;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

pub use config::{DatabaseConfig, DatabaseOptions, OpenMode, SyncMode, MAX_SQL_CACHE_SIZE, MEMORY_DB_PATH};
pub use corruption::{delete_database, CorruptDatabase, CorruptionHandler, DeleteDatabaseOnCorruption};
pub use functions::{CustomFunction, FunctionArgs, FunctionResult, RowChange, UpdateHook};
pub use registry::{DatabaseRegistry, DatabaseStats};
pub use session::{Session, TransactionListener, TransactionMode};

use crate::cursor::Cursor;
use crate::pool::{ConnectionPool, PoolStats};
use crate::types::{ErrorKind, Result, SqlValue, StrataError};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SESSIONS: RefCell<FxHashMap<u64, Session>> = RefCell::new(FxHashMap::default());
}

pub(crate) struct DatabaseShared {
    id: u64,
    label: String,
    path: String,
    config: Mutex<Arc<DatabaseConfig>>,
    config_change: Mutex<()>,
    pool: Mutex<Option<Arc<ConnectionPool>>>,
    registry: Option<DatabaseRegistry>,
}

impl DatabaseShared {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn config(&self) -> Arc<DatabaseConfig> {
        self.config.lock().clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub(crate) fn pool(&self) -> Result<Arc<ConnectionPool>> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| StrataError::Closed(self.label.clone()))
    }

    pub(crate) fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            label: self.label.clone(),
            path: self.path.clone(),
            pool: self.pool.lock().as_ref().map(|pool| pool.stats()),
        }
    }

    fn close(&self) -> bool {
        let pool = self.pool.lock().take();
        let Some(pool) = pool else {
            return false;
        };
        pool.close();
        if let Some(registry) = &self.registry {
            registry.unregister(self.id);
        }
        info!(db = %self.label, "database closed");
        true
    }

    pub(crate) fn handle_corruption(&self, attached: Vec<(String, String)>) {
        error!(db = %self.label, path = %self.path, "database corruption detected, closing");
        self.close();
        let handler = self.config().corruption_handler.clone();
        handler.on_corruption(&CorruptDatabase {
            label: self.label.clone(),
            path: self.path.clone(),
            attached,
        });
    }
}

impl Drop for DatabaseShared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to an open database.
///
/// Handles are cheap to clone and can be shared across threads. All
/// statement execution goes through the calling thread's [`Session`]; the
/// convenience methods here fetch it on every call. The database closes
/// when [`Database::close`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// Opens a database.
    ///
    /// If the file turns out to be corrupt the configured
    /// [`CorruptionHandler`] runs and the open is retried once.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.options.validate()?;
        let config = Arc::new(config);
        let pool = match ConnectionPool::open(config.clone()) {
            Ok(pool) => pool,
            Err(err) if err.kind() == ErrorKind::Corruption && !config.is_read_only() => {
                error!(db = %config.label, path = %config.path, error = %err, "database is corrupt, running recovery");
                config.corruption_handler.on_corruption(&CorruptDatabase {
                    label: config.label.clone(),
                    path: config.path.clone(),
                    attached: Vec::new(),
                });
                ConnectionPool::open(config.clone())?
            }
            Err(err) => return Err(err),
        };

        let id = NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(DatabaseShared {
            id,
            label: config.label.clone(),
            path: config.path.clone(),
            registry: config.registry.clone(),
            config: Mutex::new(config),
            config_change: Mutex::new(()),
            pool: Mutex::new(Some(pool)),
        });
        if let Some(registry) = &shared.registry {
            registry.register(id, &shared);
        }
        info!(db = %shared.label, path = %shared.path, "database opened");
        Ok(Self { shared })
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    /// Closes the pool. Idle connections close now, checked-out ones when
    /// their holder releases them. Later operations fail with
    /// [`ErrorKind::Closed`].
    pub fn close(&self) {
        if self.shared.close() {
            let id = self.shared.id;
            SESSIONS.with(|sessions| {
                sessions.borrow_mut().remove(&id);
            });
        }
    }

    /// True until [`Database::close`].
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Database path.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Diagnostics label.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// True if opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.shared.config().is_read_only()
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<DatabaseConfig> {
        self.shared.config()
    }

    /// Pool bookkeeping, absent once closed.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.shared.stats().pool
    }

    /// The calling thread's session for this database, created on first
    /// use.
    pub fn session(&self) -> Result<Session> {
        if !self.shared.is_open() {
            return Err(StrataError::Closed(self.shared.label.clone()));
        }
        let id = self.shared.id;
        Ok(SESSIONS.with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            if let Some(session) = sessions.get(&id) {
                if session.belongs_to(&self.shared) {
                    return session.clone();
                }
            }
            sessions.retain(|_, session| !session.is_stale());
            let session = Session::new(&self.shared);
            debug!(db = %self.shared.label, "session created");
            sessions.insert(id, session.clone());
            session
        }))
    }

    /// True while the calling thread holds a connection of this database.
    pub fn is_db_locked_by_current_thread(&self) -> bool {
        self.session().is_ok_and(|session| session.has_connection())
    }

    /// True while the calling thread is inside a transaction.
    pub fn in_transaction(&self) -> bool {
        self.session().is_ok_and(|session| session.has_transaction())
    }

    /// Begins an exclusive transaction on the calling thread.
    pub fn begin_transaction(&self) -> Result<()> {
        self.session()?.begin_transaction(TransactionMode::Exclusive, None)
    }

    /// Begins a transaction with an explicit mode.
    pub fn begin_transaction_with_mode(&self, mode: TransactionMode) -> Result<()> {
        self.session()?.begin_transaction(mode, None)
    }

    /// See [`Session::set_transaction_successful`].
    pub fn set_transaction_successful(&self) -> Result<()> {
        self.session()?.set_transaction_successful()
    }

    /// See [`Session::end_transaction`].
    pub fn end_transaction(&self) -> Result<()> {
        self.session()?.end_transaction()
    }

    /// See [`Session::yield_if_contended`].
    pub fn yield_if_contended(&self, delay: Option<Duration>) -> Result<bool> {
        self.session()?.yield_if_contended(delay)
    }

    /// Runs `f` in a transaction that commits when it returns Ok.
    pub fn transaction<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        self.session()?.transaction(TransactionMode::Exclusive, f)
    }

    /// Runs a single SQL statement, discarding rows.
    pub fn execute_sql(&self, sql: &str, args: &[SqlValue]) -> Result<()> {
        self.session()?.execute_sql(sql, args)
    }

    /// Runs several statements separated by semicolons.
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        self.session()?.execute_script(sql, None)
    }

    /// Opens a cursor over a query.
    pub fn raw_query(&self, sql: &str, args: &[SqlValue]) -> Result<Cursor> {
        self.session()?.raw_query(sql, args)
    }

    /// First column of the first row as an integer.
    pub fn long_for_query(&self, sql: &str, args: &[SqlValue]) -> Result<i64> {
        let session = self.session()?;
        let program = session.compile(sql, args)?;
        session.execute_for_long(&program, None)
    }

    /// First column of the first row as text.
    pub fn string_for_query(&self, sql: &str, args: &[SqlValue]) -> Result<Option<String>> {
        let session = self.session()?;
        let program = session.compile(sql, args)?;
        session.execute_for_string(&program, None)
    }

    /// Row count of `table`, optionally filtered by a WHERE clause.
    pub fn query_num_entries(
        &self,
        table: &str,
        selection: Option<&str>,
        args: &[SqlValue],
    ) -> Result<i64> {
        let sql = match selection.filter(|s| !s.is_empty()) {
            Some(selection) => format!("SELECT count(*) FROM {table} WHERE {selection}"),
            None => format!("SELECT count(*) FROM {table}"),
        };
        self.long_for_query(&sql, args)
    }

    /// Schema version stored in `user_version`.
    pub fn version(&self) -> Result<i64> {
        self.long_for_query("PRAGMA user_version", &[])
    }

    /// Stores `version` in `user_version`.
    pub fn set_version(&self, version: i64) -> Result<()> {
        self.execute_sql(&format!("PRAGMA user_version = {version}"), &[])
    }

    /// `(schema, file)` of every attached database, main first.
    pub fn attached_databases(&self) -> Result<Vec<(String, String)>> {
        self.session()?.attached_databases()
    }

    /// Runs `integrity_check` on every attached database.
    pub fn is_database_integrity_ok(&self) -> Result<bool> {
        let session = self.session()?;
        for (name, _) in session.attached_databases()? {
            let program = session.compile(&format!("PRAGMA \"{name}\".integrity_check(1)"), &[])?;
            let verdict = session.execute_for_string(&program, None)?;
            if !verdict.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("ok")) {
                warn!(db = %self.shared.label, schema = %name, verdict = ?verdict, "integrity check failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn update_config(&self, f: impl FnOnce(&mut DatabaseConfig) -> Result<()>) -> Result<()> {
        let _serialized = self.shared.config_change.lock();
        let mut next = (*self.shared.config()).clone();
        f(&mut next)?;
        next.options.validate()?;
        let next = Arc::new(next);
        self.shared.pool()?.reconfigure(next.clone())?;
        *self.shared.config.lock() = next;
        Ok(())
    }

    /// Switches to write-ahead logging. Returns false when the database
    /// cannot use it: read-only, in-memory or with attached databases.
    pub fn enable_write_ahead_logging(&self) -> Result<bool> {
        let config = self.shared.config();
        if config.options.write_ahead_logging {
            return Ok(true);
        }
        if config.is_read_only() || config.is_in_memory() {
            debug!(db = %self.shared.label, "write-ahead logging not available");
            return Ok(false);
        }
        let attached = self.attached_databases()?;
        if attached.iter().any(|(name, _)| name != "main" && name != "temp") {
            warn!(db = %self.shared.label, "write-ahead logging refused with attached databases");
            return Ok(false);
        }
        self.update_config(|config| {
            config.options.write_ahead_logging = true;
            Ok(())
        })?;
        Ok(true)
    }

    /// Switches back to rollback journaling.
    pub fn disable_write_ahead_logging(&self) -> Result<()> {
        self.update_config(|config| {
            config.options.write_ahead_logging = false;
            Ok(())
        })
    }

    /// Resizes every connection's prepared statement cache.
    pub fn set_max_sql_cache_size(&self, size: usize) -> Result<()> {
        if size > MAX_SQL_CACHE_SIZE {
            return Err(StrataError::misuse(format!(
                "expected value between 0 and {MAX_SQL_CACHE_SIZE}, got {size}"
            )));
        }
        self.update_config(|config| {
            config.options.max_sql_cache_size = size;
            Ok(())
        })
    }

    /// Turns foreign key enforcement on or off.
    pub fn set_foreign_key_constraints_enabled(&self, enabled: bool) -> Result<()> {
        if self.in_transaction() {
            return Err(StrataError::misuse(
                "foreign key constraints may not be changed while in a transaction",
            ));
        }
        self.update_config(|config| {
            config.options.foreign_keys = enabled;
            Ok(())
        })
    }

    /// Sets the locale used by the `LOCALIZED` collation.
    pub fn set_locale(&self, locale: &str) -> Result<()> {
        if locale.trim().is_empty() {
            return Err(StrataError::misuse("locale must not be empty"));
        }
        self.update_config(|config| {
            config.options.locale = Some(locale.to_owned());
            Ok(())
        })
    }

    /// Registers a scalar SQL function on every connection.
    pub fn add_custom_function(&self, function: CustomFunction) -> Result<()> {
        self.update_config(|config| {
            config.functions.retain(|f| {
                !(f.name().eq_ignore_ascii_case(function.name()) && f.num_args() == function.num_args())
            });
            config.functions.push(function);
            Ok(())
        })
    }

    /// Installs or removes the row change hook of the primary connection.
    pub fn set_update_hook(&self, hook: Option<Arc<dyn UpdateHook>>) -> Result<()> {
        self.update_config(|config| {
            config.update_hook = hook;
            Ok(())
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("label", &self.shared.label)
            .field("path", &self.shared.path)
            .field("open", &self.shared.is_open())
            .finish()
    }
}
