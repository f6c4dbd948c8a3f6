use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags, OptionalExtension, Row};
use tracing::{debug, trace, warn};

use crate::cancel::{AttachedSignal, CancellationSignal};
use crate::db::config::DatabaseConfig;
use crate::db::functions::install_update_hook;
use crate::db::TransactionMode;
use crate::statement::{Program, StatementInfo, StatementKind};
use crate::types::{Result, SqlValue, StrataError};
use crate::window::CursorWindow;

/// Name of the locale-aware collation registered on every connection.
pub const LOCALIZED_COLLATION: &str = "LOCALIZED";

const LOCALE_TABLE: &str = "locale_metadata";

/// Outcome of filling a window from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFill {
    /// Logical index of the first row in the window.
    pub start_position: usize,
    /// Rows stepped through; the full count when `count_all_rows` was set.
    pub total_rows: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum CopyRow {
    Ok,
    Full,
}

/// One engine connection plus the settings applied to it.
pub struct SqlConnection {
    id: u64,
    primary: bool,
    label: String,
    conn: Connection,
    applied: Arc<DatabaseConfig>,
    generation: u64,
    statements: Option<LruCache<String, StatementInfo>>,
}

impl SqlConnection {
    /// Opens and configures a connection. Secondary connections are read-only.
    pub(crate) fn open(
        config: &Arc<DatabaseConfig>,
        id: u64,
        primary: bool,
        generation: u64,
    ) -> Result<Self> {
        let flags = if primary {
            config.open_mode.flags()
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = if config.is_in_memory() {
            Connection::open_in_memory_with_flags(flags)?
        } else {
            Connection::open_with_flags(&config.path, flags)?
        };
        let mut connection = Self {
            id,
            primary,
            label: config.label.clone(),
            conn,
            applied: Arc::clone(config),
            generation,
            statements: statement_cache(config.options.max_sql_cache_size),
        };
        connection.configure(config)?;
        debug!(db = %connection.label, connection = id, primary, "connection opened");
        Ok(connection)
    }

    /// Pool-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True for the read-write connection.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn is_read_only(&self) -> bool {
        !self.primary || self.applied.is_read_only()
    }

    fn configure(&mut self, config: &Arc<DatabaseConfig>) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_millis(config.options.busy_timeout_ms))?;
        self.conn
            .set_prepared_statement_cache_capacity(config.options.max_sql_cache_size);
        // Reads the header so a damaged file fails here rather than mid-query.
        self.conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

        if !self.is_read_only() {
            if !config.is_in_memory() {
                self.set_journal_mode(config.uses_write_ahead_logging())?;
            }
            self.conn
                .pragma_update(None, "synchronous", config.options.synchronous.pragma_value())?;
            self.set_foreign_keys(config.options.foreign_keys)?;
        }

        self.conn
            .create_collation(LOCALIZED_COLLATION, localized_compare)?;
        for function in &config.functions {
            function.register(&self.conn)?;
        }
        if self.primary {
            self.set_locale(config.options.locale.as_deref())?;
            install_update_hook(&self.conn, config.update_hook.as_ref());
        }
        self.applied = Arc::clone(config);
        Ok(())
    }

    /// Applies the difference between the current settings and `config`.
    pub(crate) fn reconfigure(&mut self, config: &Arc<DatabaseConfig>, generation: u64) -> Result<()> {
        let old = Arc::clone(&self.applied);
        if old.options.busy_timeout_ms != config.options.busy_timeout_ms {
            self.conn
                .busy_timeout(Duration::from_millis(config.options.busy_timeout_ms))?;
        }
        if !self.is_read_only() {
            if old.uses_write_ahead_logging() != config.uses_write_ahead_logging()
                && !config.is_in_memory()
            {
                self.set_journal_mode(config.uses_write_ahead_logging())?;
            }
            if old.options.synchronous != config.options.synchronous {
                self.conn.pragma_update(
                    None,
                    "synchronous",
                    config.options.synchronous.pragma_value(),
                )?;
            }
            if old.options.foreign_keys != config.options.foreign_keys {
                self.set_foreign_keys(config.options.foreign_keys)?;
            }
        }
        if old.options.max_sql_cache_size != config.options.max_sql_cache_size {
            self.conn
                .set_prepared_statement_cache_capacity(config.options.max_sql_cache_size);
            self.statements = statement_cache(config.options.max_sql_cache_size);
        }

        for function in &config.functions {
            if !old.functions.iter().any(|f| f.is_same(function)) {
                function.register(&self.conn)?;
            }
        }

        if self.primary {
            if old.options.locale != config.options.locale {
                self.set_locale(config.options.locale.as_deref())?;
            }
            let hook_changed = match (&old.update_hook, &config.update_hook) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            };
            if hook_changed {
                install_update_hook(&self.conn, config.update_hook.as_ref());
            }
        }

        self.applied = Arc::clone(config);
        self.generation = generation;
        trace!(db = %self.label, connection = self.id, generation, "connection reconfigured");
        Ok(())
    }

    fn set_journal_mode(&self, wal: bool) -> Result<()> {
        let wanted = if wal { "WAL" } else { "DELETE" };
        let mode: String = self
            .conn
            .pragma_update_and_check(None, "journal_mode", wanted, |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case(wanted) {
            debug!(db = %self.label, requested = wanted, actual = %mode, "journal mode not changed");
        }
        Ok(())
    }

    fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        self.conn
            .pragma_update(None, "foreign_keys", if enabled { "ON" } else { "OFF" })?;
        Ok(())
    }

    fn set_locale(&self, locale: Option<&str>) -> Result<()> {
        let Some(locale) = locale else {
            return Ok(());
        };
        if self.applied.is_read_only() {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LOCALE_TABLE} (locale TEXT)"
        ))?;
        let current: Option<String> = self
            .conn
            .query_row(&format!("SELECT locale FROM {LOCALE_TABLE} LIMIT 1"), [], |row| {
                row.get(0)
            })
            .optional()?;
        if current.as_deref() == Some(locale) {
            return Ok(());
        }

        self.conn.execute_batch("BEGIN")?;
        let result = self
            .conn
            .execute(&format!("DELETE FROM {LOCALE_TABLE}"), [])
            .and_then(|_| {
                self.conn
                    .execute(&format!("INSERT INTO {LOCALE_TABLE} (locale) VALUES (?1)"), [locale])
            })
            .and_then(|_| self.conn.execute_batch(&format!("REINDEX {LOCALIZED_COLLATION}")));
        match result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                debug!(db = %self.label, locale, "locale updated");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!(db = %self.label, error = %rollback, "rollback of locale update failed");
                }
                Err(err.into())
            }
        }
    }

    /// Prepares `sql` and reports its shape, using the metadata cache.
    pub(crate) fn prepare(&mut self, sql: &str, kind: StatementKind) -> Result<StatementInfo> {
        if let Some(info) = self.statements.as_mut().and_then(|cache| cache.get(sql)) {
            return Ok(info.clone());
        }
        let stmt = self.conn.prepare_cached(sql)?;
        let info = StatementInfo {
            column_names: stmt
                .column_names()
                .into_iter()
                .map(str::to_owned)
                .collect::<Vec<_>>()
                .into(),
            parameter_count: stmt.parameter_count(),
            read_only: stmt.readonly(),
        };
        if kind.is_cacheable() {
            if let Some(cache) = self.statements.as_mut() {
                cache.put(sql.to_owned(), info.clone());
            }
        } else {
            stmt.discard();
        }
        Ok(info)
    }

    fn attach<'a>(
        &self,
        cancel: Option<&'a CancellationSignal>,
    ) -> Result<Option<AttachedSignal<'a>>> {
        cancel
            .map(|signal| signal.attach(self.conn.get_interrupt_handle()))
            .transpose()
    }

    fn with_rows<T>(
        &mut self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
        f: impl FnOnce(&mut rusqlite::Rows<'_>, usize) -> Result<T>,
    ) -> Result<T> {
        let _attached = self.attach(cancel)?;
        let mut stmt = self.conn.prepare_cached(program.sql())?;
        for (index, value) in program.bind_args().iter().enumerate() {
            stmt.raw_bind_parameter(index + 1, value)?;
        }
        let columns = stmt.column_count();
        let result = {
            let mut rows = stmt.raw_query();
            f(&mut rows, columns)
        };
        if program.kind().is_cacheable() {
            drop(stmt);
        } else {
            stmt.discard();
        }
        if program.kind() == StatementKind::Ddl {
            self.forget_statements();
        }
        result
    }

    // Column lists of cached statements go stale once the schema changes.
    fn forget_statements(&mut self) {
        if let Some(cache) = self.statements.as_mut() {
            cache.clear();
        }
    }

    /// Runs a statement to completion.
    pub(crate) fn execute(
        &mut self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<()> {
        self.with_rows(program, cancel, |rows, _| {
            while rows.next()?.is_some() {
                check_canceled(cancel)?;
            }
            Ok(())
        })
    }

    /// Runs a statement and returns the rows it changed.
    pub(crate) fn execute_for_changed_row_count(
        &mut self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<usize> {
        self.execute(program, cancel)?;
        Ok(usize::try_from(self.conn.changes()).unwrap_or(usize::MAX))
    }

    /// Runs an insert and returns its row id, or -1 if no row changed.
    pub(crate) fn execute_for_last_inserted_row_id(
        &mut self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<i64> {
        self.execute(program, cancel)?;
        if self.conn.changes() > 0 {
            Ok(self.conn.last_insert_rowid())
        } else {
            Ok(-1)
        }
    }

    /// First column of the first row, or None when there are no rows.
    pub(crate) fn execute_for_value(
        &mut self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<Option<SqlValue>> {
        self.with_rows(program, cancel, |rows, columns| match rows.next()? {
            Some(row) if columns > 0 => Ok(Some(SqlValue::from_value_ref(row.get_ref(0)?))),
            _ => Ok(None),
        })
    }

    /// Fills `window` with rows of a query, starting at `start_position`.
    ///
    /// Rows before `start_position` are skipped. If the window fills up
    /// before `required_position` is reached it is cleared and filling
    /// restarts at the current row. With `count_all_rows` every remaining row
    /// is stepped so the total is exact.
    pub(crate) fn execute_for_window(
        &mut self,
        program: &Program,
        window: &mut CursorWindow,
        start_position: usize,
        required_position: usize,
        count_all_rows: bool,
        cancel: Option<&CancellationSignal>,
    ) -> Result<WindowFill> {
        window.clear();
        self.with_rows(program, cancel, |rows, columns| {
            if !window.set_num_columns(columns) {
                return Err(StrataError::Invalid(format!(
                    "could not set window column count to {columns}"
                )));
            }

            let mut start = start_position;
            let mut total_rows = 0usize;
            let mut added_rows = 0usize;
            let mut window_full = false;
            while !window_full || count_all_rows {
                check_canceled(cancel)?;
                let Some(row) = rows.next()? else {
                    break;
                };
                total_rows += 1;
                if start >= total_rows || window_full {
                    continue;
                }

                let mut status = copy_row(window, row, columns)?;
                if status == CopyRow::Full
                    && added_rows > 0
                    && start + added_rows <= required_position
                {
                    window.clear();
                    window.set_num_columns(columns);
                    start += added_rows;
                    added_rows = 0;
                    status = copy_row(window, row, columns)?;
                }

                match status {
                    CopyRow::Ok => added_rows += 1,
                    CopyRow::Full if added_rows == 0 => {
                        return Err(StrataError::RowTooBig {
                            row: total_rows - 1,
                            capacity: window.capacity(),
                        });
                    }
                    CopyRow::Full => window_full = true,
                }
            }

            window.set_start_position(start);
            trace!(
                start,
                added_rows,
                total_rows,
                required_position,
                "window filled"
            );
            Ok(WindowFill {
                start_position: start,
                total_rows,
            })
        })
    }

    /// Issues BEGIN in the given mode.
    pub(crate) fn begin(&self, mode: TransactionMode) -> Result<()> {
        self.conn.execute_batch(mode.begin_sql())?;
        Ok(())
    }

    /// Issues COMMIT.
    pub(crate) fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Issues ROLLBACK if a transaction is open.
    pub(crate) fn rollback(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// True while an engine transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Runs semicolon-separated SQL text.
    pub(crate) fn execute_script(
        &mut self,
        sql: &str,
        cancel: Option<&CancellationSignal>,
    ) -> Result<()> {
        let _attached = self.attach(cancel)?;
        let result = self.conn.execute_batch(sql);
        self.forget_statements();
        result.map_err(Into::into)
    }

    /// `(name, file)` for every attached database, main first.
    pub(crate) fn attached_databases(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare("PRAGMA database_list")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?.unwrap_or_default()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Handle that interrupts the statement currently running.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }
}

impl std::fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnection")
            .field("id", &self.id)
            .field("primary", &self.primary)
            .field("label", &self.label)
            .field("generation", &self.generation)
            .finish()
    }
}

fn statement_cache(size: usize) -> Option<LruCache<String, StatementInfo>> {
    NonZeroUsize::new(size).map(LruCache::new)
}

fn check_canceled(cancel: Option<&CancellationSignal>) -> Result<()> {
    cancel.map_or(Ok(()), CancellationSignal::throw_if_canceled)
}

fn copy_row(window: &mut CursorWindow, row: &Row<'_>, columns: usize) -> Result<CopyRow> {
    if !window.alloc_row() {
        return Ok(CopyRow::Full);
    }
    let index = window.num_rows() - 1;
    for column in 0..columns {
        let stored = match row.get_ref(column)? {
            ValueRef::Null => window.put_null(index, column),
            ValueRef::Integer(v) => window.put_long(index, column, v),
            ValueRef::Real(v) => window.put_double(index, column, v),
            ValueRef::Text(text) => window.put_text_bytes(index, column, text),
            ValueRef::Blob(blob) => window.put_blob(index, column, blob),
        };
        if !stored {
            window.free_last_row();
            return Ok(CopyRow::Full);
        }
    }
    Ok(CopyRow::Ok)
}

/// Case-insensitive ordering with a case-sensitive tie break.
fn localized_compare(a: &str, b: &str) -> Ordering {
    let folded = a
        .chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase));
    folded.then_with(|| a.cmp(b))
}
