#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use strata::{Database, DatabaseConfig, DatabaseOptions, Result};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Temporary directory holding one database file.
pub struct TempDb {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TempDb {
    pub fn new(name: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(name);
        Ok(Self { dir, path })
    }

    pub fn config(&self) -> DatabaseConfig {
        DatabaseConfig::new(&self.path)
    }

    pub fn config_with(&self, options: DatabaseOptions) -> DatabaseConfig {
        DatabaseConfig::new(&self.path).with_options(options)
    }

    pub fn open(&self) -> Result<Database> {
        Database::open(self.config())
    }
}

pub fn memory_db() -> Result<Database> {
    Database::open(DatabaseConfig::in_memory())
}

pub fn row_count(db: &Database, table: &str) -> Result<i64> {
    db.query_num_entries(table, None, &[])
}
