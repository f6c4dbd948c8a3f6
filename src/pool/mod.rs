//! Bounded pool of engine connections.
//!
//! The pool owns one primary read-write connection and, when write-ahead
//! logging is enabled, up to `max_connections - 1` read-only connections.
//! The pool lock only guards bookkeeping; opening, reconfiguring and closing
//! connections happen with the lock released.

mod connection;

pub use connection::{SqlConnection, WindowFill, LOCALIZED_COLLATION};

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::config::DatabaseConfig;
use crate::types::{Result, StrataError};

const BUSY_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// What a caller needs from the connection it acquires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    /// The work only reads, so a secondary connection will do.
    pub read_only: bool,
    /// Latency-sensitive caller; served before other waiters.
    pub interactive: bool,
}

impl ConnectionFlags {
    /// Flags for work that may write.
    pub fn primary() -> Self {
        Self::default()
    }

    /// Flags for work that only reads.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            interactive: false,
        }
    }

    /// Marks the request interactive.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// Snapshot of pool bookkeeping for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Database label.
    pub label: String,
    /// Maximum connections including the primary.
    pub max_connections: usize,
    /// Connections currently open.
    pub open_connections: usize,
    /// Open connections not checked out.
    pub idle_connections: usize,
    /// Whether the primary connection is checked out.
    pub primary_in_use: bool,
    /// Callers blocked waiting for a connection.
    pub waiting: usize,
    /// Configuration generation.
    pub generation: u64,
    /// Successful acquisitions since open.
    pub total_acquired: u64,
}

/// Thread-safe connection pool.
pub struct ConnectionPool {
    label: String,
    state: Mutex<PoolState>,
    available: Condvar,
    reconfigure_lock: Mutex<()>,
}

struct PoolState {
    open: bool,
    config: Arc<DatabaseConfig>,
    generation: u64,
    next_id: u64,
    max_connections: usize,
    primary: Option<SqlConnection>,
    primary_out: bool,
    idle: Vec<SqlConnection>,
    secondary_total: usize,
    secondary_out: usize,
    waiters: Waiters,
    total_acquired: u64,
}

#[derive(Debug, Default)]
struct Waiters {
    primary: usize,
    secondary: usize,
    interactive_primary: usize,
    interactive_secondary: usize,
}

impl Waiters {
    fn adjust(&mut self, flags: ConnectionFlags, add: bool) {
        let (all, interactive) = if flags.read_only {
            (&mut self.secondary, &mut self.interactive_secondary)
        } else {
            (&mut self.primary, &mut self.interactive_primary)
        };
        if add {
            *all += 1;
            if flags.interactive {
                *interactive += 1;
            }
        } else {
            *all -= 1;
            if flags.interactive {
                *interactive -= 1;
            }
        }
    }

    fn total(&self) -> usize {
        self.primary + self.secondary
    }
}

impl PoolState {
    fn can_take_primary(&self, flags: ConnectionFlags) -> bool {
        !self.primary_out && (flags.interactive || self.waiters.interactive_primary == 0)
    }

    fn can_take_secondary(&self, flags: ConnectionFlags) -> bool {
        flags.interactive || self.waiters.interactive_secondary == 0
    }

    fn max_secondaries(&self) -> usize {
        self.max_connections.saturating_sub(1)
    }

    fn open_connections(&self) -> usize {
        usize::from(self.primary.is_some() || self.primary_out) + self.secondary_total
    }
}

impl ConnectionPool {
    /// Opens the pool and its primary connection.
    pub fn open(config: Arc<DatabaseConfig>) -> Result<Arc<Self>> {
        let primary = SqlConnection::open(&config, 0, true, 0)?;
        info!(db = %config.label, max_connections = config.effective_pool_size(), "connection pool opened");
        Ok(Arc::new(Self {
            label: config.label.clone(),
            available: Condvar::new(),
            reconfigure_lock: Mutex::new(()),
            state: Mutex::new(PoolState {
                open: true,
                max_connections: config.effective_pool_size(),
                config,
                generation: 0,
                next_id: 1,
                primary: Some(primary),
                primary_out: false,
                idle: Vec::new(),
                secondary_total: 0,
                secondary_out: 0,
                waiters: Waiters::default(),
                total_acquired: 0,
            }),
        }))
    }

    /// Database label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<DatabaseConfig> {
        Arc::clone(&self.state.lock().config)
    }

    /// Checks out a connection, blocking while none is available.
    pub fn acquire(self: &Arc<Self>, flags: ConnectionFlags) -> Result<PooledConnection> {
        let mut state = self.state.lock();
        let mut waiting = false;
        let mut secondary_failed = false;
        let started = Instant::now();
        let result = loop {
            if !state.open {
                break Err(StrataError::Closed(self.label.clone()));
            }

            if flags.read_only && state.can_take_secondary(flags) {
                if let Some(conn) = state.idle.pop() {
                    state.secondary_out += 1;
                    break Ok(conn);
                }
                if !secondary_failed && state.secondary_total < state.max_secondaries() {
                    match self.open_secondary(&mut state) {
                        Ok(conn) => break Ok(conn),
                        Err(err) => {
                            warn!(db = %self.label, error = %err, "failed to open read-only connection");
                            secondary_failed = true;
                        }
                    }
                    continue;
                }
            }

            if state.can_take_primary(flags) {
                match state.primary.take() {
                    Some(conn) => {
                        state.primary_out = true;
                        break Ok(conn);
                    }
                    None => break self.reopen_primary(&mut state),
                }
            }

            if !waiting {
                state.waiters.adjust(flags, true);
                waiting = true;
            }
            if self
                .available
                .wait_for(&mut state, BUSY_LOG_INTERVAL)
                .timed_out()
            {
                warn!(
                    db = %self.label,
                    waited_ms = started.elapsed().as_millis() as u64,
                    read_only = flags.read_only,
                    "still waiting for a database connection"
                );
            }
        };

        if waiting {
            state.waiters.adjust(flags, false);
        }
        let conn = result?;
        state.total_acquired += 1;
        drop(state);
        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    fn open_secondary(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<SqlConnection> {
        let id = state.next_id;
        state.next_id += 1;
        state.secondary_total += 1;
        state.secondary_out += 1;
        let config = Arc::clone(&state.config);
        let generation = state.generation;
        let opened = MutexGuard::unlocked(state, || {
            SqlConnection::open(&config, id, false, generation)
        });
        if opened.is_err() {
            state.secondary_total -= 1;
            state.secondary_out -= 1;
        }
        opened
    }

    fn reopen_primary(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<SqlConnection> {
        state.primary_out = true;
        let config = Arc::clone(&state.config);
        let generation = state.generation;
        let opened = MutexGuard::unlocked(state, || SqlConnection::open(&config, 0, true, generation));
        if opened.is_err() {
            state.primary_out = false;
            self.available.notify_all();
        }
        opened
    }

    fn release(&self, mut conn: SqlConnection) {
        let mut state = self.state.lock();
        while state.open && conn.generation() != state.generation {
            let config = Arc::clone(&state.config);
            let generation = state.generation;
            let reconfigured =
                MutexGuard::unlocked(&mut state, || conn.reconfigure(&config, generation));
            if let Err(err) = reconfigured {
                warn!(db = %self.label, connection = conn.id(), error = %err, "dropping connection that failed to reconfigure");
                self.discard_locked(&mut state, conn.is_primary());
                drop(state);
                drop(conn);
                self.available.notify_all();
                return;
            }
        }

        let primary = conn.is_primary();
        let excess = !primary && state.secondary_total > state.max_secondaries();
        if !state.open || excess {
            self.discard_locked(&mut state, primary);
            drop(state);
            debug!(db = %self.label, connection = conn.id(), "connection closed on release");
            drop(conn);
        } else if primary {
            state.primary = Some(conn);
            state.primary_out = false;
            drop(state);
        } else {
            state.secondary_out -= 1;
            state.idle.push(conn);
            drop(state);
        }
        self.available.notify_all();
    }

    fn discard_locked(&self, state: &mut PoolState, primary: bool) {
        if primary {
            state.primary_out = false;
        } else {
            state.secondary_out -= 1;
            state.secondary_total -= 1;
        }
    }

    /// Applies a new configuration to every connection.
    ///
    /// Idle connections are updated immediately; checked-out connections are
    /// updated when released. If the primary connection rejects the new
    /// configuration, the previous one is restored and the error returned.
    pub fn reconfigure(&self, config: Arc<DatabaseConfig>) -> Result<()> {
        let _serial = self.reconfigure_lock.lock();
        let (old, generation, primary, idle) = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(StrataError::Closed(self.label.clone()));
            }
            let old = Arc::clone(&state.config);
            let wal_changed = old.uses_write_ahead_logging() != config.uses_write_ahead_logging();
            let in_use = state.primary_out || state.secondary_out > 0;
            if wal_changed && in_use {
                return Err(StrataError::misuse(
                    "write-ahead logging cannot be enabled or disabled while there are \
                     transactions in progress; release all active connections first",
                ));
            }
            if old.options.foreign_keys != config.options.foreign_keys && in_use {
                return Err(StrataError::misuse(
                    "foreign key constraints cannot be enabled or disabled while there are \
                     transactions in progress",
                ));
            }
            if wal_changed {
                state.secondary_total -= state.idle.len();
                let stale = std::mem::take(&mut state.idle);
                MutexGuard::unlocked(&mut state, || drop(stale));
            }

            state.config = Arc::clone(&config);
            state.max_connections = config.effective_pool_size();
            state.generation += 1;
            let primary = state.primary.take();
            if primary.is_some() {
                state.primary_out = true;
            }
            let idle = std::mem::take(&mut state.idle);
            state.secondary_out += idle.len();
            (old, state.generation, primary, idle)
        };

        let mut primary_error = None;
        let primary = primary.and_then(|mut conn| match conn.reconfigure(&config, generation) {
            Ok(()) => Some(conn),
            Err(err) => {
                primary_error = Some(err);
                match conn.reconfigure(&old, generation + 1) {
                    Ok(()) => Some(conn),
                    Err(err) => {
                        warn!(db = %self.label, error = %err, "closing primary connection after failed rollback");
                        None
                    }
                }
            }
        });

        let taken = idle.len();
        let idle: Vec<SqlConnection> = if primary_error.is_some() {
            idle
        } else {
            idle.into_iter()
                .filter_map(|mut conn| match conn.reconfigure(&config, generation) {
                    Ok(()) => Some(conn),
                    Err(err) => {
                        warn!(db = %self.label, connection = conn.id(), error = %err, "closing read-only connection that failed to reconfigure");
                        None
                    }
                })
                .collect()
        };

        let mut state = self.state.lock();
        state.secondary_out -= taken;
        state.secondary_total -= taken - idle.len();
        if primary_error.is_some() {
            state.config = Arc::clone(&old);
            state.max_connections = old.effective_pool_size();
            state.generation += 1;
        }
        state.primary_out = false;
        state.primary = primary;
        state.idle.extend(idle);
        drop(state);
        self.available.notify_all();

        match primary_error {
            Some(err) => Err(err),
            None => {
                debug!(db = %self.label, generation, "pool reconfigured");
                Ok(())
            }
        }
    }

    /// True if a caller is blocked on a connection the holder could give up.
    pub fn should_yield(&self, holding_primary: bool, interactive: bool) -> bool {
        let state = self.state.lock();
        let waiters = &state.waiters;
        match (holding_primary, interactive) {
            (true, false) => waiters.total() > 0,
            (true, true) => waiters.interactive_primary + waiters.interactive_secondary > 0,
            (false, false) => waiters.secondary > 0,
            (false, true) => waiters.interactive_secondary > 0,
        }
    }

    /// Returns `(schema, file)` of every attached database, using an idle
    /// connection when one is available.
    pub fn attached_databases(self: &Arc<Self>) -> Result<Vec<(String, String)>> {
        let conn = self.acquire(ConnectionFlags::read_only())?;
        conn.attached_databases()
    }

    /// Closes idle connections and refuses new checkouts. Connections still
    /// checked out close when released.
    pub fn close(&self) {
        let (primary, idle) = {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.secondary_total -= state.idle.len();
            (state.primary.take(), std::mem::take(&mut state.idle))
        };
        self.available.notify_all();
        drop(primary);
        drop(idle);
        info!(db = %self.label, "connection pool closed");
    }

    /// True until [`ConnectionPool::close`].
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Bookkeeping snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            label: self.label.clone(),
            max_connections: state.max_connections,
            open_connections: state.open_connections(),
            idle_connections: usize::from(state.primary.is_some()) + state.idle.len(),
            primary_in_use: state.primary_out,
            waiting: state.waiters.total(),
            generation: state.generation,
            total_acquired: state.total_acquired,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// A checked-out connection, returned to the pool on drop.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<SqlConnection>,
}

impl PooledConnection {
    /// The pool this connection returns to.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = SqlConnection;

    fn deref(&self) -> &SqlConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut SqlConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.label)
            .field("conn", &self.conn)
            .finish()
    }
}
