use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rusqlite::OpenFlags;
use serde::{Deserialize, Serialize};

use super::corruption::{CorruptionHandler, DeleteDatabaseOnCorruption};
use super::functions::{CustomFunction, UpdateHook};
use super::registry::DatabaseRegistry;
use crate::types::{Result, StrataError};
use crate::window::DEFAULT_WINDOW_SIZE;

/// Path that selects a private in-memory database.
pub const MEMORY_DB_PATH: &str = ":memory:";

/// Upper bound for [`DatabaseOptions::max_sql_cache_size`].
pub const MAX_SQL_CACHE_SIZE: usize = 100;

/// `PRAGMA synchronous` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Sync on every commit.
    Full,
    /// Sync at checkpoints only (safe with WAL).
    Normal,
    /// Never sync.
    Off,
}

impl SyncMode {
    pub(crate) fn pragma_value(self) -> &'static str {
        match self {
            SyncMode::Full => "FULL",
            SyncMode::Normal => "NORMAL",
            SyncMode::Off => "OFF",
        }
    }
}

/// How the primary connection opens the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Read-write, creating the file if needed.
    ReadWriteCreate,
    /// Read-write, failing if the file does not exist.
    ReadWrite,
    /// Read-only.
    ReadOnly,
}

impl OpenMode {
    pub(crate) fn flags(self) -> OpenFlags {
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match self {
            OpenMode::ReadWriteCreate => {
                base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
            OpenMode::ReadWrite => base | OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
        }
    }
}

/// Tunables that can be loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseOptions {
    /// Use write-ahead logging. Ignored for in-memory databases.
    pub write_ahead_logging: bool,
    /// `PRAGMA synchronous` mode.
    pub synchronous: SyncMode,
    /// Prepared statements kept per connection, `0..=100`.
    pub max_sql_cache_size: usize,
    /// Connection pool size including the primary connection.
    pub max_connections: usize,
    /// How long the engine retries on a locked database.
    pub busy_timeout_ms: u64,
    /// Byte capacity of each cursor window.
    pub cursor_window_size: usize,
    /// Enforce foreign key constraints.
    pub foreign_keys: bool,
    /// Locale recorded for the `LOCALIZED` collation.
    pub locale: Option<String>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            write_ahead_logging: true,
            synchronous: SyncMode::Normal,
            max_sql_cache_size: 25,
            max_connections: 4,
            busy_timeout_ms: 5000,
            cursor_window_size: DEFAULT_WINDOW_SIZE,
            foreign_keys: false,
            locale: None,
        }
    }
}

impl DatabaseOptions {
    /// Settings for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            write_ahead_logging: false,
            synchronous: SyncMode::Off,
            max_connections: 1,
            ..Self::default()
        }
    }

    /// Durable rollback-journal settings with a single connection.
    pub fn fully_durable() -> Self {
        Self {
            write_ahead_logging: false,
            synchronous: SyncMode::Full,
            max_connections: 1,
            ..Self::default()
        }
    }

    /// Parses options from TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: DatabaseOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects values outside their permitted ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_sql_cache_size > MAX_SQL_CACHE_SIZE {
            return Err(StrataError::misuse(format!(
                "expected value between 0 and {MAX_SQL_CACHE_SIZE}, got {}",
                self.max_sql_cache_size
            )));
        }
        if self.max_connections == 0 {
            return Err(StrataError::misuse("max_connections must be at least 1"));
        }
        if self.cursor_window_size == 0 {
            return Err(StrataError::misuse("cursor_window_size must be positive"));
        }
        Ok(())
    }
}

/// Everything needed to open a [`crate::Database`].
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Database path or [`MEMORY_DB_PATH`].
    pub path: String,
    /// Name used in logs and diagnostics.
    pub label: String,
    /// Primary connection open mode.
    pub open_mode: OpenMode,
    /// Tunables.
    pub options: DatabaseOptions,
    /// Scalar functions registered on every connection.
    pub functions: Vec<CustomFunction>,
    /// Invoked when the engine reports corruption.
    pub corruption_handler: Arc<dyn CorruptionHandler>,
    /// Optional row change observer installed on the primary connection.
    pub update_hook: Option<Arc<dyn UpdateHook>>,
    /// Diagnostics registry the database joins while open.
    pub registry: Option<DatabaseRegistry>,
}

impl DatabaseConfig {
    /// Configuration for an on-disk database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        let options = if path == MEMORY_DB_PATH {
            DatabaseOptions::in_memory()
        } else {
            DatabaseOptions::default()
        };
        Self {
            label: path.clone(),
            path,
            open_mode: OpenMode::ReadWriteCreate,
            options,
            functions: Vec::new(),
            corruption_handler: Arc::new(DeleteDatabaseOnCorruption),
            update_hook: None,
            registry: None,
        }
    }

    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self::new(MEMORY_DB_PATH)
    }

    /// Replaces the tunables.
    pub fn with_options(mut self, options: DatabaseOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the open mode.
    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    /// Sets the diagnostics label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Registers a custom scalar function.
    pub fn with_function(mut self, function: CustomFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Replaces the corruption handler.
    pub fn with_corruption_handler(mut self, handler: Arc<dyn CorruptionHandler>) -> Self {
        self.corruption_handler = handler;
        self
    }

    /// Installs an update hook capability.
    pub fn with_update_hook(mut self, hook: Arc<dyn UpdateHook>) -> Self {
        self.update_hook = Some(hook);
        self
    }

    /// Joins a diagnostics registry.
    pub fn with_registry(mut self, registry: DatabaseRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// True for `:memory:` databases.
    pub fn is_in_memory(&self) -> bool {
        self.path == MEMORY_DB_PATH
    }

    /// True when the primary connection opens read-only.
    pub fn is_read_only(&self) -> bool {
        self.open_mode == OpenMode::ReadOnly
    }

    /// WAL is only honored for writable on-disk databases.
    pub fn uses_write_ahead_logging(&self) -> bool {
        self.options.write_ahead_logging && !self.is_in_memory() && !self.is_read_only()
    }

    /// Number of connections the pool may open.
    pub fn effective_pool_size(&self) -> usize {
        if self.uses_write_ahead_logging() {
            self.options.max_connections.max(2)
        } else {
            1
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("path", &self.path)
            .field("label", &self.label)
            .field("open_mode", &self.open_mode)
            .field("options", &self.options)
            .field(
                "functions",
                &self.functions.iter().map(CustomFunction::name).collect::<Vec<_>>(),
            )
            .field("update_hook", &self.update_hook.is_some())
            .finish()
    }
}
