//! Record-level access for a remote caller.
//!
//! The driver sits on top of a [`Database`] and suppresses resending rows
//! the caller has already received: once a row's full payload has been
//! returned, later reads of the same id return only the id. Mutations run
//! through [`DatabaseDriver::batch`], which applies its cache effects only
//! after the transaction commits.

mod batch;
mod cache;
mod record;
mod schema;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use batch::{BatchOperation, CacheEffect};
pub use cache::RecordCache;
pub use record::Record;
pub use schema::{MigrationSet, Schema, SchemaCompatibility};

use crate::cursor::Cursor;
use crate::db::{Database, DatabaseConfig, TransactionMode};
use crate::types::{Result, SqlValue, StrataError};
use batch::PendingCacheChanges;
use schema::{drop_all_objects, quote_identifier as quote, read_local, set_user_version, user_version, LOCAL_STORAGE_SCHEMA};

/// Outcome of [`DatabaseDriver::find`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FindResult {
    /// No such row.
    NotFound,
    /// The caller already holds this row.
    Cached(String),
    /// Full row, now cached.
    Record(Record),
}

/// One row of [`DatabaseDriver::cached_query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryRow {
    /// Id of a row the caller already holds.
    Cached(String),
    /// Full row.
    Record(Record),
}

/// One row of [`DatabaseDriver::cached_query_as_array`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArrayRow {
    /// Id of a row the caller already holds.
    Cached(String),
    /// Values in header order.
    Values(Vec<SqlValue>),
}

/// Column header plus rows, for callers that prefer arrays over maps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryArray {
    /// Result column names.
    pub columns: Vec<String>,
    /// Rows in result order.
    pub rows: Vec<ArrayRow>,
}

/// Record driver over one database.
#[derive(Debug)]
pub struct DatabaseDriver {
    db: Database,
    cache: RecordCache,
}

impl DatabaseDriver {
    /// Wraps an open database with an empty cache.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: RecordCache::new(),
        }
    }

    /// Opens the database without checking its schema.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Ok(Self::new(Database::open(config)?))
    }

    /// Opens the database and checks its schema version.
    ///
    /// Fails with [`StrataError::SchemaNeeded`] or
    /// [`StrataError::MigrationNeeded`] when the stored version does not
    /// match.
    pub fn open_checked(config: DatabaseConfig, schema_version: i64) -> Result<Self> {
        let driver = Self::open(config)?;
        match driver.compatibility(schema_version)? {
            SchemaCompatibility::Compatible => Ok(driver),
            SchemaCompatibility::NeedsSetup => Err(StrataError::SchemaNeeded),
            SchemaCompatibility::NeedsMigration { from } => {
                Err(StrataError::MigrationNeeded { from })
            }
        }
    }

    /// Opens the database and resets it to `schema`.
    pub fn open_with_schema(config: DatabaseConfig, schema: &Schema) -> Result<Self> {
        let mut driver = Self::open(config)?;
        driver.unsafe_reset_database(schema)?;
        Ok(driver)
    }

    /// Opens the database and applies `migrations`.
    pub fn open_with_migrations(config: DatabaseConfig, migrations: &MigrationSet) -> Result<Self> {
        let driver = Self::open(config)?;
        driver.migrate(migrations)?;
        Ok(driver)
    }

    /// Underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Current cache contents.
    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Compares the stored schema version with `expected`.
    pub fn compatibility(&self, expected: i64) -> Result<SchemaCompatibility> {
        let stored = user_version(&self.db.session()?)?;
        Ok(SchemaCompatibility::check(stored, expected))
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Cursor> {
        self.db.session()?.raw_query(sql, args)
    }

    /// Looks up one row by id.
    pub fn find(&mut self, table: &str, id: &str) -> Result<FindResult> {
        if self.cache.contains(table, id) {
            return Ok(FindResult::Cached(id.to_owned()));
        }
        let sql = format!("SELECT * FROM {} WHERE id = ? LIMIT 1", quote(table));
        let mut cursor = self.query(&sql, &[SqlValue::from(id)])?;
        let found = if cursor.move_to_first()? {
            let record = Record::from_cursor(&mut cursor)?;
            self.cache.insert(table, id);
            FindResult::Record(record)
        } else {
            FindResult::NotFound
        };
        cursor.close();
        Ok(found)
    }

    /// Runs a query, returning ids for rows the caller already holds and
    /// full records for the rest.
    ///
    /// Results without an `id` column come back as full records and are
    /// never cached.
    pub fn cached_query(&mut self, table: &str, sql: &str, args: &[SqlValue]) -> Result<Vec<QueryRow>> {
        let mut cursor = self.query(sql, args)?;
        let id_column = cursor.column_index("id");
        let mut rows = Vec::new();
        while cursor.move_to_next()? {
            let id = match id_column {
                Some(column) => cursor.get_string(column)?,
                None => None,
            };
            match id {
                Some(id) if self.cache.contains(table, &id) => rows.push(QueryRow::Cached(id)),
                Some(id) => {
                    rows.push(QueryRow::Record(Record::from_cursor(&mut cursor)?));
                    self.cache.insert(table, &id);
                }
                None => rows.push(QueryRow::Record(Record::from_cursor(&mut cursor)?)),
            }
        }
        cursor.close();
        debug!(table, rows = rows.len(), "cached query");
        Ok(rows)
    }

    /// Like [`DatabaseDriver::cached_query`], with a column header and
    /// value arrays instead of maps.
    pub fn cached_query_as_array(
        &mut self,
        table: &str,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<QueryArray> {
        let mut cursor = self.query(sql, args)?;
        let columns = cursor.column_names().to_vec();
        let id_column = cursor.column_index("id");
        let mut rows = Vec::new();
        while cursor.move_to_next()? {
            let id = match id_column {
                Some(column) => cursor.get_string(column)?,
                None => None,
            };
            match id {
                Some(id) if self.cache.contains(table, &id) => rows.push(ArrayRow::Cached(id)),
                Some(id) => {
                    rows.push(ArrayRow::Values(cursor.row_values()?));
                    self.cache.insert(table, &id);
                }
                None => rows.push(ArrayRow::Values(cursor.row_values()?)),
            }
        }
        cursor.close();
        Ok(QueryArray { columns, rows })
    }

    /// Ids of every row returned, or nothing if there is no `id` column.
    pub fn query_ids(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<String>> {
        let mut cursor = self.query(sql, args)?;
        let mut ids = Vec::new();
        if let Some(column) = cursor.column_index("id") {
            while cursor.move_to_next()? {
                if let Some(id) = cursor.get_string(column)? {
                    ids.push(id);
                }
            }
        }
        cursor.close();
        Ok(ids)
    }

    /// Every row in full, bypassing the cache.
    pub fn unsafe_query_raw(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Record>> {
        let mut cursor = self.query(sql, args)?;
        let mut records = Vec::new();
        while cursor.move_to_next()? {
            records.push(Record::from_cursor(&mut cursor)?);
        }
        cursor.close();
        Ok(records)
    }

    /// First column of the first row as an integer, 0 without rows.
    pub fn count(&self, sql: &str, args: &[SqlValue]) -> Result<i64> {
        let mut cursor = self.query(sql, args)?;
        let count = if cursor.move_to_first()? {
            cursor.get_long(0)?
        } else {
            0
        };
        cursor.close();
        Ok(count)
    }

    /// Value stored under `key` in local storage.
    pub fn get_local(&self, key: &str) -> Result<Option<String>> {
        read_local(&self.db.session()?, key)
    }

    /// Stores `value` under `key` in local storage.
    pub fn set_local(&self, key: &str, value: &str) -> Result<()> {
        self.db.execute_sql(
            "INSERT OR REPLACE INTO local_storage (key, value) VALUES (?, ?)",
            &[SqlValue::from(key), SqlValue::from(value)],
        )
    }

    /// Removes `key` from local storage.
    pub fn remove_local(&self, key: &str) -> Result<()> {
        self.db
            .execute_sql("DELETE FROM local_storage WHERE key = ?", &[SqlValue::from(key)])
    }

    /// Runs every operation in one transaction, then updates the cache.
    ///
    /// Cache effects are collected while the statements run and applied
    /// only after commit: adds first, then removals. A failed batch leaves
    /// the cache untouched.
    pub fn batch(&mut self, operations: &[BatchOperation]) -> Result<()> {
        for operation in operations {
            operation.validate()?;
        }

        let session = self.db.session()?;
        let mut pending = PendingCacheChanges::default();
        let executed = session.transaction(TransactionMode::Exclusive, |session| {
            for operation in operations {
                let mut program = session.compile(&operation.sql, &[])?;
                for args in &operation.args {
                    program.clear_bindings();
                    program.bind_all(args)?;
                    session.execute(&program, None)?;
                    if let Some(id) = operation.tuple_id(args)? {
                        pending.record(operation.effect, &operation.table, id);
                    }
                }
            }
            Ok(())
        });

        match executed {
            Ok(()) => {
                pending.apply(&mut self.cache);
                debug!(operations = operations.len(), "batch committed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "batch rolled back");
                Err(err)
            }
        }
    }

    /// Ids of rows marked deleted in `table`.
    pub fn get_deleted_records(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("SELECT id FROM {} WHERE _status = 'deleted'", quote(table));
        self.query_ids(&sql, &[])
    }

    /// Permanently deletes rows of `table` and forgets them.
    pub fn destroy_deleted_records(&mut self, table: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM {} WHERE id IN ({placeholders})", quote(table));
        let args: Vec<SqlValue> = ids.iter().map(|id| SqlValue::from(id.as_str())).collect();
        self.db.transaction(|session| session.execute_sql(&sql, &args))?;
        for id in ids {
            self.cache.remove(table, id);
        }
        Ok(())
    }

    /// Drops every user object, then creates `schema` and stores its
    /// version, all in one transaction. The cache is cleared first, even
    /// if the reset fails.
    pub fn unsafe_reset_database(&mut self, schema: &Schema) -> Result<()> {
        info!(db = %self.db.label(), version = schema.version, "resetting database");
        self.cache.clear();
        let mut script = schema.sql.trim_end().to_owned();
        if !script.is_empty() && !script.ends_with(';') {
            script.push(';');
        }
        script.push_str(LOCAL_STORAGE_SCHEMA);
        self.db.session()?.transaction(TransactionMode::Exclusive, |session| {
            drop_all_objects(session)?;
            session.execute_script(&script, None)?;
            set_user_version(session, schema.version)
        })
    }

    /// Applies `migrations` if the stored version equals `migrations.from`.
    pub fn migrate(&self, migrations: &MigrationSet) -> Result<()> {
        let session = self.db.session()?;
        let stored = user_version(&session)?;
        if stored != migrations.from {
            return Err(StrataError::Invalid(format!(
                "incompatible migration set applied: database is at {stored}, migration starts at {}",
                migrations.from
            )));
        }
        info!(db = %self.db.label(), from = migrations.from, to = migrations.to, "migrating database");
        session.transaction(TransactionMode::Exclusive, |session| {
            session.execute_script(&migrations.sql, None)?;
            set_user_version(session, migrations.to)
        })
    }

    /// Closes the database.
    pub fn close(&self) {
        self.db.close();
    }
}

impl From<Database> for DatabaseDriver {
    fn from(db: Database) -> Self {
        Self::new(db)
    }
}
