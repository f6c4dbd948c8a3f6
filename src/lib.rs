//! Strata: a client-side data-access layer over an embedded SQLite engine.
//!
//! The crate is organised bottom-up:
//!
//! * [`window`] holds a bounded slice of a result set.
//! * [`cursor`] pages through results by refilling a window on demand.
//! * [`pool`] and [`db`] share one database across threads with nested
//!   transactions on a per-thread [`Session`].
//! * [`statement`] classifies, compiles and binds SQL.
//! * [`driver`] adds the record identity cache and atomic batches.
//! * [`bridge`] exposes drivers to an asynchronous host with per-tag call
//!   queues.

#![warn(missing_docs)]

pub mod bridge;
pub mod cancel;
pub mod cursor;
pub mod db;
pub mod driver;
pub mod pool;
pub mod statement;
pub mod types;
pub mod window;

pub use bridge::{ConnectionTag, DatabaseBridge, InitOutcome, Pending};
pub use cancel::CancellationSignal;
pub use cursor::{cursor_pick_fill_window_start_position, Cursor};
pub use db::{
    delete_database, CorruptDatabase, CorruptionHandler, CustomFunction, Database, DatabaseConfig,
    DatabaseOptions, DatabaseRegistry, DatabaseStats, DeleteDatabaseOnCorruption, FunctionArgs,
    FunctionResult, OpenMode, RowChange, Session, SyncMode, TransactionListener, TransactionMode,
    UpdateHook,
};
pub use driver::{
    ArrayRow, BatchOperation, CacheEffect, DatabaseDriver, FindResult, MigrationSet, QueryArray,
    QueryRow, Record, RecordCache, Schema, SchemaCompatibility,
};
pub use pool::{ConnectionPool, PoolStats};
pub use statement::{Program, Statement, StatementKind};
pub use types::{ErrorKind, FieldType, Result, SqlValue, StrataError};
pub use window::CursorWindow;
