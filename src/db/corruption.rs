//! Corruption recovery and database file deletion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use super::config::MEMORY_DB_PATH;
use crate::types::Result;

/// Description of a database the engine reported as corrupt.
#[derive(Debug, Clone)]
pub struct CorruptDatabase {
    /// Diagnostics label.
    pub label: String,
    /// Main database path.
    pub path: String,
    /// `(schema name, file)` pairs of every database attached when the
    /// corruption was detected, main included. Empty if the list could not
    /// be read.
    pub attached: Vec<(String, String)>,
}

impl CorruptDatabase {
    /// True for `:memory:` databases, which have nothing to delete.
    pub fn is_in_memory(&self) -> bool {
        self.path == MEMORY_DB_PATH
    }
}

/// Recovery policy invoked after the database has been closed because of
/// corruption. The caller reopens afterwards.
pub trait CorruptionHandler: Send + Sync {
    /// Handles the corrupt database.
    fn on_corruption(&self, database: &CorruptDatabase);
}

/// Default policy: delete the database file, its sidecars and every
/// attached database file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteDatabaseOnCorruption;

impl CorruptionHandler for DeleteDatabaseOnCorruption {
    fn on_corruption(&self, database: &CorruptDatabase) {
        error!(db = %database.label, path = %database.path, "corruption reported, deleting database files");
        if database.is_in_memory() {
            return;
        }

        let mut paths: Vec<&str> = database
            .attached
            .iter()
            .map(|(_, file)| file.as_str())
            .filter(|file| !file.is_empty() && *file != MEMORY_DB_PATH)
            .collect();
        if !paths.contains(&database.path.as_str()) {
            paths.push(&database.path);
        }
        for path in paths {
            if let Err(err) = delete_database(path) {
                warn!(path, error = %err, "failed to delete corrupt database file");
            }
        }
    }
}

/// Deletes a database file and everything the engine keeps next to it:
/// `-journal`, `-shm`, `-wal` and any `<name>-mj*` master journals.
/// Returns true if anything was removed.
pub fn delete_database(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let mut deleted = remove_if_exists(path)?;
    for suffix in ["-journal", "-shm", "-wal"] {
        deleted |= remove_if_exists(&sidecar(path, suffix))?;
    }

    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(deleted);
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{file_name}-mj");
    match fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    deleted |= remove_if_exists(&entry.path())?;
                }
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(deleted)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
