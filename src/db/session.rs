use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::DatabaseShared;
use crate::cancel::CancellationSignal;
use crate::cursor::Cursor;
use crate::pool::{ConnectionFlags, PooledConnection, SqlConnection, WindowFill};
use crate::statement::{Program, StatementInfo, StatementKind};
use crate::types::{ErrorKind, Result, SqlValue, StrataError};
use crate::window::CursorWindow;

/// Locking mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Locks are taken when first needed.
    Deferred,
    /// The write lock is taken at begin.
    Immediate,
    /// An exclusive lock is taken at begin.
    #[default]
    Exclusive,
}

impl TransactionMode {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN",
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Callbacks for one transaction level.
///
/// A failing `on_begin` aborts the begin. A failing `on_commit` turns the
/// level into a rollback; the error is returned from `end_transaction`.
pub trait TransactionListener {
    /// Called after the level begins.
    fn on_begin(&self) -> Result<()> {
        Ok(())
    }

    /// Called before the level ends successfully.
    fn on_commit(&self) -> Result<()> {
        Ok(())
    }

    /// Called before the level ends unsuccessfully.
    fn on_rollback(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct TransactionLevel {
    mode: TransactionMode,
    listener: Option<Rc<dyn TransactionListener>>,
    marked_successful: bool,
    child_failed: bool,
}

#[derive(Default)]
struct SessionState {
    connection: Option<PooledConnection>,
    transactions: SmallVec<[TransactionLevel; 4]>,
    interactive: bool,
}

pub(super) struct SessionInner {
    db: Weak<DatabaseShared>,
    label: String,
    state: RefCell<SessionState>,
}

/// Per-thread access to a database.
///
/// A session owns the transaction stack of its thread and the connection
/// held for the outermost transaction. It is `!Send`: obtain one per thread
/// from [`crate::Database::session`]. Clones share the same state. Every
/// operation fails with [`ErrorKind::Closed`] once the database is closed.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    pub(super) fn new(db: &Arc<DatabaseShared>) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                db: Arc::downgrade(db),
                label: db.label().to_owned(),
                state: RefCell::new(SessionState::default()),
            }),
        }
    }

    pub(super) fn belongs_to(&self, db: &Arc<DatabaseShared>) -> bool {
        self.inner.db.upgrade().is_some_and(|own| Arc::ptr_eq(&own, db))
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.inner.db.upgrade().map_or(true, |db| !db.is_open())
    }

    /// Diagnostics label of the owning database.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn database(&self) -> Result<Arc<DatabaseShared>> {
        self.inner
            .db
            .upgrade()
            .filter(|db| db.is_open())
            .ok_or_else(|| StrataError::Closed(self.inner.label.clone()))
    }

    /// Marks later connection requests as latency-sensitive.
    pub fn set_interactive(&self, interactive: bool) {
        self.inner.state.borrow_mut().interactive = interactive;
    }

    /// True while this session holds a connection.
    pub fn has_connection(&self) -> bool {
        self.inner.state.borrow().connection.is_some()
    }

    /// True while a transaction is active.
    pub fn has_transaction(&self) -> bool {
        !self.inner.state.borrow().transactions.is_empty()
    }

    /// True while more than one transaction level is active.
    pub fn has_nested_transaction(&self) -> bool {
        self.inner.state.borrow().transactions.len() > 1
    }

    /// Number of active transaction levels.
    pub fn transaction_depth(&self) -> usize {
        self.inner.state.borrow().transactions.len()
    }

    fn flags(&self, read_only: bool) -> ConnectionFlags {
        ConnectionFlags {
            read_only,
            interactive: self.inner.state.borrow().interactive,
        }
    }

    fn acquire(&self, read_only: bool) -> Result<SessionConnection<'_>> {
        let db = self.database()?;
        let held = self.inner.state.borrow_mut().connection.take();
        let conn = match held {
            Some(conn) => conn,
            None => db.pool()?.acquire(self.flags(read_only))?,
        };
        Ok(SessionConnection {
            session: self,
            conn: Some(conn),
        })
    }

    fn release(&self, conn: PooledConnection) {
        let mut state = self.inner.state.borrow_mut();
        if state.transactions.is_empty() {
            drop(state);
            drop(conn);
        } else {
            state.connection = Some(conn);
        }
    }

    fn with_connection<T>(
        &self,
        read_only: bool,
        f: impl FnOnce(&mut SqlConnection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.acquire(read_only)?;
        let result = f(&mut conn);
        let attached = corruption_context(&result, &conn);
        drop(conn);
        if let Some(attached) = attached {
            self.corrupted(attached);
        }
        result
    }

    fn corrupted(&self, attached: Vec<(String, String)>) {
        if let Some(db) = self.inner.db.upgrade() {
            db.handle_corruption(attached);
        }
    }

    /// Prepares `sql` and reports its shape.
    pub fn prepare(
        &self,
        sql: &str,
        read_only: bool,
        cancel: Option<&CancellationSignal>,
    ) -> Result<StatementInfo> {
        if let Some(signal) = cancel {
            signal.throw_if_canceled()?;
        }
        let kind = StatementKind::classify(sql);
        self.with_connection(read_only, |conn| conn.prepare(sql, kind))
    }

    /// Compiles SQL into a program bound to `args`.
    pub fn compile(&self, sql: &str, args: &[SqlValue]) -> Result<Program> {
        Program::compile(self, sql, args, None)
    }

    fn execute_special(&self, program: &Program) -> Result<bool> {
        match program.kind() {
            StatementKind::Begin => {
                self.begin_transaction(TransactionMode::Exclusive, None)?;
                Ok(true)
            }
            StatementKind::Commit => {
                self.set_transaction_successful()?;
                self.end_transaction()?;
                Ok(true)
            }
            StatementKind::Rollback => {
                self.end_transaction()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Runs a program, discarding rows.
    pub fn execute(&self, program: &Program, cancel: Option<&CancellationSignal>) -> Result<()> {
        if self.execute_special(program)? {
            return Ok(());
        }
        self.with_connection(program.is_read_only(), |conn| conn.execute(program, cancel))
    }

    /// Runs a program and returns the number of rows it changed.
    pub fn execute_for_changed_row_count(
        &self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<usize> {
        if self.execute_special(program)? {
            return Ok(0);
        }
        self.with_connection(program.is_read_only(), |conn| {
            conn.execute_for_changed_row_count(program, cancel)
        })
    }

    /// Runs an insert and returns its row id, or -1 if nothing was inserted.
    pub fn execute_for_last_inserted_row_id(
        &self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<i64> {
        if self.execute_special(program)? {
            return Ok(-1);
        }
        self.with_connection(program.is_read_only(), |conn| {
            conn.execute_for_last_inserted_row_id(program, cancel)
        })
    }

    /// First column of the first row as an integer, or -1 without rows.
    pub fn execute_for_long(
        &self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<i64> {
        if self.execute_special(program)? {
            return Ok(0);
        }
        let value = self.with_connection(program.is_read_only(), |conn| {
            conn.execute_for_value(program, cancel)
        })?;
        match value {
            Some(value) => value.to_long().map_err(StrataError::TypeMismatch),
            None => Ok(-1),
        }
    }

    /// First column of the first row as text, or None without rows.
    pub fn execute_for_string(
        &self,
        program: &Program,
        cancel: Option<&CancellationSignal>,
    ) -> Result<Option<String>> {
        if self.execute_special(program)? {
            return Ok(None);
        }
        let value = self.with_connection(program.is_read_only(), |conn| {
            conn.execute_for_value(program, cancel)
        })?;
        match value {
            Some(value) => value.to_text().map_err(StrataError::TypeMismatch),
            None => Ok(None),
        }
    }

    /// Fills a cursor window from a query.
    pub fn execute_for_window(
        &self,
        program: &Program,
        window: &mut CursorWindow,
        start_position: usize,
        required_position: usize,
        count_all_rows: bool,
        cancel: Option<&CancellationSignal>,
    ) -> Result<WindowFill> {
        self.with_connection(program.is_read_only(), |conn| {
            conn.execute_for_window(
                program,
                window,
                start_position,
                required_position,
                count_all_rows,
                cancel,
            )
        })
    }

    /// Runs semicolon-separated statements on the write connection.
    pub fn execute_script(&self, sql: &str, cancel: Option<&CancellationSignal>) -> Result<()> {
        self.with_connection(false, |conn| conn.execute_script(sql, cancel))
    }

    /// Compiles and runs SQL, discarding rows.
    pub fn execute_sql(&self, sql: &str, args: &[SqlValue]) -> Result<()> {
        let program = self.compile(sql, args)?;
        self.execute(&program, None)
    }

    /// Opens a cursor over a query.
    pub fn raw_query(&self, sql: &str, args: &[SqlValue]) -> Result<Cursor> {
        self.raw_query_with_cancellation(sql, args, None)
    }

    /// Opens a cursor over a query that can be canceled.
    pub fn raw_query_with_cancellation(
        &self,
        sql: &str,
        args: &[SqlValue],
        cancel: Option<CancellationSignal>,
    ) -> Result<Cursor> {
        let db = self.database()?;
        let program = Program::compile(self, sql, args, cancel.as_ref())?;
        let window_size = db.config().options.cursor_window_size;
        Ok(Cursor::new(self.clone(), program, window_size, cancel))
    }

    /// `(schema, file)` for every database attached to the connection.
    pub fn attached_databases(&self) -> Result<Vec<(String, String)>> {
        self.with_connection(true, |conn| conn.attached_databases())
    }

    /// Begins a transaction level.
    ///
    /// The outermost level checks out the primary connection and keeps it
    /// until the matching [`Session::end_transaction`].
    pub fn begin_transaction(
        &self,
        mode: TransactionMode,
        listener: Option<Rc<dyn TransactionListener>>,
    ) -> Result<()> {
        self.database()?;
        self.throw_if_transaction_marked_successful()?;
        self.begin_transaction_unchecked(mode, listener)
    }

    fn begin_transaction_unchecked(
        &self,
        mode: TransactionMode,
        listener: Option<Rc<dyn TransactionListener>>,
    ) -> Result<()> {
        let outermost = !self.has_transaction();
        if outermost {
            let db = self.database()?;
            let conn = db.pool()?.acquire(self.flags(false))?;
            conn.begin(mode)?;
            self.inner.state.borrow_mut().connection = Some(conn);
        }

        if let Some(listener) = &listener {
            if let Err(err) = listener.on_begin() {
                if outermost {
                    let conn = self.inner.state.borrow_mut().connection.take();
                    if let Some(conn) = conn {
                        if let Err(rollback) = conn.rollback() {
                            warn!(db = %self.inner.label, error = %rollback, "rollback after failed begin listener failed");
                        }
                    }
                }
                return Err(err);
            }
        }

        let mut state = self.inner.state.borrow_mut();
        state.transactions.push(TransactionLevel {
            mode,
            listener,
            marked_successful: false,
            child_failed: false,
        });
        debug!(db = %self.inner.label, depth = state.transactions.len(), ?mode, "transaction begun");
        Ok(())
    }

    /// Marks the innermost level successful. Fails if there is no
    /// transaction or the level is already marked.
    pub fn set_transaction_successful(&self) -> Result<()> {
        self.database()?;
        self.throw_if_no_transaction()?;
        self.throw_if_transaction_marked_successful()?;
        if let Some(top) = self.inner.state.borrow_mut().transactions.last_mut() {
            top.marked_successful = true;
        }
        Ok(())
    }

    /// Ends the innermost level.
    ///
    /// The outermost end commits only if every level was marked successful
    /// and no nested level failed; otherwise everything rolls back.
    pub fn end_transaction(&self) -> Result<()> {
        self.throw_if_no_transaction()?;
        self.end_transaction_unchecked(false)
    }

    fn end_transaction_unchecked(&self, yielding: bool) -> Result<()> {
        let Some(top) = self.inner.state.borrow().transactions.last().cloned() else {
            return Ok(());
        };
        let mut successful = (top.marked_successful || yielding) && !top.child_failed;
        let mut listener_error = None;
        if let Some(listener) = &top.listener {
            let outcome = if successful {
                listener.on_commit()
            } else {
                listener.on_rollback()
            };
            if let Err(err) = outcome {
                listener_error = Some(err);
                successful = false;
            }
        }

        let mut state = self.inner.state.borrow_mut();
        state.transactions.pop();
        let depth = state.transactions.len();
        let engine_result = if let Some(parent) = state.transactions.last_mut() {
            if !successful {
                parent.child_failed = true;
            }
            Ok(())
        } else {
            let conn = state.connection.take();
            drop(state);
            match conn {
                Some(conn) => self.finish_outermost(conn, successful),
                None => Ok(()),
            }
        };
        trace!(db = %self.inner.label, depth, successful, "transaction level ended");

        match listener_error {
            Some(err) => Err(err),
            None => engine_result,
        }
    }

    fn finish_outermost(&self, conn: PooledConnection, successful: bool) -> Result<()> {
        let result = if successful {
            conn.commit().or_else(|err| {
                if let Err(rollback) = conn.rollback() {
                    warn!(db = %self.inner.label, error = %rollback, "rollback after failed commit failed");
                }
                Err(err)
            })
        } else {
            conn.rollback()
        };
        let attached = corruption_context(&result, &conn);
        drop(conn);
        if let Some(attached) = attached {
            self.corrupted(attached);
        }
        debug!(db = %self.inner.label, committed = successful && result.is_ok(), "transaction finished");
        result
    }

    /// Temporarily ends the transaction when another caller waits for the
    /// connection, sleeps for `delay`, and begins again in the same mode.
    ///
    /// Only valid with exactly one level that has not been marked
    /// successful. Returns true if the transaction yielded.
    pub fn yield_if_contended(&self, delay: Option<Duration>) -> Result<bool> {
        let db = self.database()?;
        self.throw_if_no_transaction()?;
        self.throw_if_transaction_marked_successful()?;
        self.throw_if_nested_transaction()?;

        let (holding_primary, interactive, top) = {
            let state = self.inner.state.borrow();
            let holding_primary = state.connection.as_ref().map_or(true, |c| c.is_primary());
            (holding_primary, state.interactive, state.transactions.last().cloned())
        };
        let Some(top) = top else {
            return Ok(false);
        };
        if !db.pool()?.should_yield(holding_primary, interactive) {
            return Ok(false);
        }

        debug!(db = %self.inner.label, "yielding contended transaction");
        self.end_transaction_unchecked(true)?;
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            thread::sleep(delay);
        }
        self.begin_transaction_unchecked(top.mode, top.listener)?;
        Ok(true)
    }

    /// Runs `f` inside a transaction level: marks it successful when `f`
    /// returns Ok and always ends it.
    pub fn transaction<T>(
        &self,
        mode: TransactionMode,
        f: impl FnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        self.begin_transaction(mode, None)?;
        let result = f(self).and_then(|value| {
            self.set_transaction_successful()?;
            Ok(value)
        });
        let ended = self.end_transaction();
        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    fn throw_if_no_transaction(&self) -> Result<()> {
        if self.has_transaction() {
            Ok(())
        } else {
            Err(StrataError::misuse(
                "cannot perform this operation because there is no current transaction",
            ))
        }
    }

    fn throw_if_transaction_marked_successful(&self) -> Result<()> {
        let marked = self
            .inner
            .state
            .borrow()
            .transactions
            .last()
            .is_some_and(|top| top.marked_successful);
        if marked {
            Err(StrataError::misuse(
                "cannot perform this operation because the transaction has already been \
                 marked successful; the only thing you can do now is call end_transaction",
            ))
        } else {
            Ok(())
        }
    }

    fn throw_if_nested_transaction(&self) -> Result<()> {
        if self.has_nested_transaction() {
            Err(StrataError::misuse(
                "cannot perform this operation because a nested transaction is in progress",
            ))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Session")
            .field("db", &self.inner.label)
            .field("depth", &state.transactions.len())
            .field("has_connection", &state.connection.is_some())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.transactions.is_empty() {
            warn!(db = %self.label, depth = state.transactions.len(), "session dropped inside a transaction, rolling back");
            if let Some(conn) = state.connection.take() {
                if let Err(err) = conn.rollback() {
                    warn!(db = %self.label, error = %err, "rollback of abandoned transaction failed");
                }
            }
        }
    }
}

/// Connection lent to a single session operation.
struct SessionConnection<'s> {
    session: &'s Session,
    conn: Option<PooledConnection>,
}

impl Deref for SessionConnection<'_> {
    type Target = SqlConnection;

    fn deref(&self) -> &SqlConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("session connection used after release"),
        }
    }
}

impl DerefMut for SessionConnection<'_> {
    fn deref_mut(&mut self) -> &mut SqlConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("session connection used after release"),
        }
    }
}

impl Drop for SessionConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.session.release(conn);
        }
    }
}

fn corruption_context<T>(result: &Result<T>, conn: &SqlConnection) -> Option<Vec<(String, String)>> {
    match result {
        Err(err) if err.kind() == ErrorKind::Corruption => {
            Some(conn.attached_databases().unwrap_or_default())
        }
        _ => None,
    }
}
