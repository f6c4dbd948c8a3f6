//! Asynchronous host boundary over tagged drivers.
//!
//! Every call returns a [`Pending`] that resolves once the driver has run
//! it. A tag whose database still needs a schema or a migration is
//! `Waiting`: calls against it queue up and replay in order when
//! [`DatabaseBridge::set_up_with_schema`] or
//! [`DatabaseBridge::set_up_with_migrations`] connects the driver.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::db::DatabaseConfig;
use crate::driver::{
    BatchOperation, DatabaseDriver, FindResult, MigrationSet, QueryArray, QueryRow, Record, Schema,
};
use crate::types::{Result, SqlValue, StrataError};

/// Identifies one logical connection of the host.
pub type ConnectionTag = u32;

type PendingCall = Box<dyn FnOnce(Option<&mut DatabaseDriver>) + Send>;

enum ConnectionState {
    Connected(DatabaseDriver),
    Waiting(VecDeque<PendingCall>),
}

/// Result of [`DatabaseBridge::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum InitOutcome {
    /// The schema is current; calls run immediately.
    Ok,
    /// The database needs a full schema setup.
    SchemaNeeded,
    /// The database must be migrated from `database_version`.
    MigrationsNeeded {
        /// Stored schema version.
        #[serde(rename = "databaseVersion")]
        database_version: i64,
    },
}

/// Result of a bridge call that may not have run yet.
///
/// Await it, or block on it with [`Pending::wait`] from outside an async
/// runtime.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn ready(result: Result<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Blocks until the call has run.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Result if the call has already run.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> StrataError {
    StrataError::Closed("bridge call dropped before it ran".to_owned())
}

fn no_driver(tag: ConnectionTag) -> StrataError {
    StrataError::Closed(format!("no driver with tag {tag} available"))
}

/// Tagged drivers shared by every host thread.
#[derive(Default)]
pub struct DatabaseBridge {
    connections: Mutex<FxHashMap<ConnectionTag, Arc<Mutex<ConnectionState>>>>,
}

impl DatabaseBridge {
    /// Creates a bridge without connections.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, tag: ConnectionTag) -> Option<Arc<Mutex<ConnectionState>>> {
        self.connections.lock().get(&tag).cloned()
    }

    /// True if `tag` is connected or waiting.
    pub fn has_connection(&self, tag: ConnectionTag) -> bool {
        self.connections.lock().contains_key(&tag)
    }

    /// True if `tag` is waiting for setup.
    pub fn is_waiting(&self, tag: ConnectionTag) -> bool {
        self.slot(tag)
            .is_some_and(|slot| matches!(*slot.lock(), ConnectionState::Waiting(_)))
    }

    /// Opens the database for `tag` and checks its schema version.
    ///
    /// A database that needs setup or migration leaves the tag waiting;
    /// later calls queue until it is connected.
    pub fn initialize(
        &self,
        tag: ConnectionTag,
        config: DatabaseConfig,
        schema_version: i64,
    ) -> Pending<InitOutcome> {
        if self.has_connection(tag) {
            return Pending::ready(Err(StrataError::misuse(format!(
                "a driver with tag {tag} is already set up"
            ))));
        }

        let (state, outcome) = match DatabaseDriver::open_checked(config, schema_version) {
            Ok(driver) => (ConnectionState::Connected(driver), InitOutcome::Ok),
            Err(StrataError::SchemaNeeded) => {
                (ConnectionState::Waiting(VecDeque::new()), InitOutcome::SchemaNeeded)
            }
            Err(StrataError::MigrationNeeded { from }) => (
                ConnectionState::Waiting(VecDeque::new()),
                InitOutcome::MigrationsNeeded {
                    database_version: from,
                },
            ),
            Err(err) => return Pending::ready(Err(err)),
        };
        info!(tag, ?outcome, "bridge connection initialized");
        self.connections
            .lock()
            .insert(tag, Arc::new(Mutex::new(state)));
        Pending::ready(Ok(outcome))
    }

    /// Resets the database to `schema` and connects the tag, replaying
    /// queued calls.
    pub fn set_up_with_schema(
        &self,
        tag: ConnectionTag,
        config: DatabaseConfig,
        schema: Schema,
    ) -> Pending<()> {
        match DatabaseDriver::open_with_schema(config, &schema) {
            Ok(driver) => {
                self.connect_driver(tag, driver);
                Pending::ready(Ok(()))
            }
            Err(err) => Pending::ready(Err(err)),
        }
    }

    /// Migrates the database and connects the tag, replaying queued calls.
    ///
    /// If the migration fails the tag is disconnected and every queued
    /// call fails.
    pub fn set_up_with_migrations(
        &self,
        tag: ConnectionTag,
        config: DatabaseConfig,
        migrations: MigrationSet,
    ) -> Pending<()> {
        match DatabaseDriver::open_with_migrations(config, &migrations) {
            Ok(driver) => {
                self.connect_driver(tag, driver);
                Pending::ready(Ok(()))
            }
            Err(err) => {
                warn!(tag, error = %err, "migration failed, disconnecting");
                self.disconnect_driver(tag);
                Pending::ready(Err(err))
            }
        }
    }

    fn connect_driver(&self, tag: ConnectionTag, driver: DatabaseDriver) {
        let slot = {
            let mut connections = self.connections.lock();
            connections
                .entry(tag)
                .or_insert_with(|| Arc::new(Mutex::new(ConnectionState::Waiting(VecDeque::new()))))
                .clone()
        };
        let mut state = slot.lock();
        let previous = std::mem::replace(&mut *state, ConnectionState::Connected(driver));
        let queue = match previous {
            ConnectionState::Waiting(queue) => queue,
            ConnectionState::Connected(old) => {
                old.close();
                VecDeque::new()
            }
        };
        debug!(tag, queued = queue.len(), "driver connected, replaying queue");
        if let ConnectionState::Connected(driver) = &mut *state {
            for call in queue {
                call(Some(driver));
            }
        }
    }

    fn disconnect_driver(&self, tag: ConnectionTag) {
        let slot = self.connections.lock().remove(&tag);
        let Some(slot) = slot else {
            return;
        };
        let previous = std::mem::replace(&mut *slot.lock(), ConnectionState::Waiting(VecDeque::new()));
        match previous {
            ConnectionState::Waiting(queue) => {
                for call in queue {
                    call(None);
                }
            }
            ConnectionState::Connected(driver) => driver.close(),
        }
    }

    /// Closes the tag's database and forgets the tag. Queued calls fail.
    pub fn close(&self, tag: ConnectionTag) {
        info!(tag, "bridge connection closed");
        self.disconnect_driver(tag);
    }

    fn with_driver<T, F>(&self, tag: ConnectionTag, name: &'static str, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DatabaseDriver) -> Result<T> + Send + 'static,
    {
        let (tx, pending) = Pending::channel();
        let call: PendingCall = Box::new(move |driver| {
            let result = match driver {
                Some(driver) => f(driver),
                None => Err(no_driver(tag)),
            };
            if let Err(err) = &result {
                debug!(tag, call = name, error = %err, "bridge call failed");
            }
            let _ = tx.send(result);
        });

        let Some(slot) = self.slot(tag) else {
            call(None);
            return pending;
        };
        let mut state = slot.lock();
        match &mut *state {
            ConnectionState::Connected(driver) => call(Some(driver)),
            ConnectionState::Waiting(queue) => {
                trace!(tag, call = name, position = queue.len(), "queued until setup");
                queue.push_back(call);
            }
        }
        pending
    }

    /// See [`DatabaseDriver::find`].
    pub fn find(&self, tag: ConnectionTag, table: String, id: String) -> Pending<FindResult> {
        self.with_driver(tag, "find", move |driver| driver.find(&table, &id))
    }

    /// See [`DatabaseDriver::cached_query`].
    pub fn query(
        &self,
        tag: ConnectionTag,
        table: String,
        sql: String,
        args: Vec<SqlValue>,
    ) -> Pending<Vec<QueryRow>> {
        self.with_driver(tag, "query", move |driver| driver.cached_query(&table, &sql, &args))
    }

    /// See [`DatabaseDriver::cached_query_as_array`].
    pub fn query_as_array(
        &self,
        tag: ConnectionTag,
        table: String,
        sql: String,
        args: Vec<SqlValue>,
    ) -> Pending<QueryArray> {
        self.with_driver(tag, "query_as_array", move |driver| {
            driver.cached_query_as_array(&table, &sql, &args)
        })
    }

    /// See [`DatabaseDriver::query_ids`].
    pub fn query_ids(&self, tag: ConnectionTag, sql: String, args: Vec<SqlValue>) -> Pending<Vec<String>> {
        self.with_driver(tag, "query_ids", move |driver| driver.query_ids(&sql, &args))
    }

    /// See [`DatabaseDriver::unsafe_query_raw`].
    pub fn unsafe_query_raw(
        &self,
        tag: ConnectionTag,
        sql: String,
        args: Vec<SqlValue>,
    ) -> Pending<Vec<Record>> {
        self.with_driver(tag, "unsafe_query_raw", move |driver| driver.unsafe_query_raw(&sql, &args))
    }

    /// See [`DatabaseDriver::count`].
    pub fn count(&self, tag: ConnectionTag, sql: String, args: Vec<SqlValue>) -> Pending<i64> {
        self.with_driver(tag, "count", move |driver| driver.count(&sql, &args))
    }

    /// See [`DatabaseDriver::batch`].
    pub fn batch(&self, tag: ConnectionTag, operations: Vec<BatchOperation>) -> Pending<()> {
        self.with_driver(tag, "batch", move |driver| driver.batch(&operations))
    }

    /// Runs a batch given as a JSON array of operations, each an object
    /// with `effect` (0, 1 or -1), `table`, `sql` and `args`.
    pub fn batch_json(&self, tag: ConnectionTag, operations: String) -> Pending<()> {
        self.with_driver(tag, "batch_json", move |driver| {
            let operations: Vec<BatchOperation> = serde_json::from_str(&operations)?;
            driver.batch(&operations)
        })
    }

    /// Runs semicolon-separated statements outside any batch.
    pub fn unsafe_execute_multiple(&self, tag: ConnectionTag, sql: String) -> Pending<()> {
        self.with_driver(tag, "unsafe_execute_multiple", move |driver| {
            driver.database().execute_script(&sql)
        })
    }

    /// See [`DatabaseDriver::get_local`].
    pub fn get_local(&self, tag: ConnectionTag, key: String) -> Pending<Option<String>> {
        self.with_driver(tag, "get_local", move |driver| driver.get_local(&key))
    }

    /// See [`DatabaseDriver::unsafe_reset_database`].
    pub fn unsafe_reset_database(&self, tag: ConnectionTag, schema: Schema) -> Pending<()> {
        self.with_driver(tag, "unsafe_reset_database", move |driver| {
            driver.unsafe_reset_database(&schema)
        })
    }

    /// Reads local storage without queueing; a waiting tag is an error.
    pub fn unsafe_get_local_synchronously(&self, tag: ConnectionTag, key: &str) -> Result<Option<String>> {
        let slot = self.slot(tag).ok_or_else(|| no_driver(tag))?;
        let state = slot.lock();
        match &*state {
            ConnectionState::Connected(driver) => driver.get_local(key),
            ConnectionState::Waiting(_) => Err(StrataError::misuse(format!(
                "connection {tag} is waiting for setup"
            ))),
        }
    }
}

impl std::fmt::Debug for DatabaseBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBridge")
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}
