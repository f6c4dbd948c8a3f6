use serde::Deserialize;
use tracing::{debug, info};

use crate::db::Session;
use crate::types::{Result, SqlValue};

pub(crate) const LOCAL_STORAGE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS local_storage (
    key VARCHAR(16) PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS local_storage_key_index ON local_storage (key);
";

pub(crate) const SELECT_LOCAL: &str = "SELECT value FROM local_storage WHERE key = ?";

/// Full schema text plus the version it establishes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema {
    /// Version stored in `user_version` after setup.
    pub version: i64,
    /// Semicolon-separated DDL.
    pub sql: String,
}

impl Schema {
    /// Creates a schema.
    pub fn new(version: i64, sql: impl Into<String>) -> Self {
        Self {
            version,
            sql: sql.into(),
        }
    }
}

/// Migration script from one version to another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrationSet {
    /// Version the database must be at.
    pub from: i64,
    /// Version after the migration.
    pub to: i64,
    /// Semicolon-separated statements.
    pub sql: String,
}

impl MigrationSet {
    /// Creates a migration set.
    pub fn new(from: i64, to: i64, sql: impl Into<String>) -> Self {
        Self {
            from,
            to,
            sql: sql.into(),
        }
    }
}

/// Relation between the stored schema version and the one expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCompatibility {
    /// Versions match.
    Compatible,
    /// The database is empty or newer than supported and must be set up.
    NeedsSetup,
    /// The database is older and must be migrated.
    NeedsMigration {
        /// Stored version.
        from: i64,
    },
}

impl SchemaCompatibility {
    /// Compares a stored `user_version` with the expected version.
    pub fn check(stored: i64, expected: i64) -> Self {
        if stored == expected {
            SchemaCompatibility::Compatible
        } else if stored == 0 {
            SchemaCompatibility::NeedsSetup
        } else if stored < expected {
            SchemaCompatibility::NeedsMigration { from: stored }
        } else {
            info!(stored, expected, "database is newer than supported, it will be reset");
            SchemaCompatibility::NeedsSetup
        }
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Drops every user view, trigger, index and table. Runs inside the
/// caller's transaction.
pub(crate) fn drop_all_objects(session: &Session) -> Result<()> {
    let mut objects = Vec::new();
    {
        let mut cursor = session.raw_query(
            "SELECT type, name FROM sqlite_master \
             WHERE name NOT LIKE 'sqlite_%' AND sql IS NOT NULL",
            &[],
        )?;
        while cursor.move_to_next()? {
            let kind = cursor.get_string(0)?.unwrap_or_default();
            let name = cursor.get_string(1)?.unwrap_or_default();
            objects.push((kind, name));
        }
        cursor.close();
    }

    for kind in ["view", "trigger", "index", "table"] {
        for (_, name) in objects.iter().filter(|(k, _)| k == kind) {
            let sql = format!("DROP {} IF EXISTS {}", kind.to_uppercase(), quote_identifier(name));
            debug!(kind, name = %name, "dropping schema object");
            session.execute_sql(&sql, &[])?;
        }
    }
    Ok(())
}

pub(crate) fn set_user_version(session: &Session, version: i64) -> Result<()> {
    session.execute_sql(&format!("PRAGMA user_version = {version}"), &[])
}

pub(crate) fn user_version(session: &Session) -> Result<i64> {
    let program = session.compile("PRAGMA user_version", &[])?;
    session.execute_for_long(&program, None)
}

pub(crate) fn read_local(session: &Session, key: &str) -> Result<Option<String>> {
    let program = session.compile(SELECT_LOCAL, &[SqlValue::from(key)])?;
    session.execute_for_string(&program, None)
}
