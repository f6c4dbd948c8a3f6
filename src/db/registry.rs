use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;

use super::DatabaseShared;
use crate::pool::PoolStats;

/// Diagnostics snapshot of one open database.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Diagnostics label.
    pub label: String,
    /// Database path.
    pub path: String,
    /// Pool bookkeeping, absent once the pool is closed.
    pub pool: Option<PoolStats>,
}

/// Registry of open databases, handed to a diagnostics collector.
///
/// Databases join when opened with a registry in their config and leave
/// when closed.
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    entries: Arc<Mutex<FxHashMap<u64, Weak<DatabaseShared>>>>,
}

impl DatabaseRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: u64, database: &Arc<DatabaseShared>) {
        trace!(id, "database registered");
        self.entries.lock().insert(id, Arc::downgrade(database));
    }

    pub(crate) fn unregister(&self, id: u64) {
        trace!(id, "database unregistered");
        self.entries.lock().remove(&id);
    }

    /// Number of registered databases.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no database is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects stats for every registered database, ordered by id.
    pub fn snapshot(&self) -> Vec<DatabaseStats> {
        let mut live: Vec<(u64, Arc<DatabaseShared>)> = self
            .entries
            .lock()
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|db| (*id, db)))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        live.into_iter().map(|(_, db)| db.stats()).collect()
    }
}

impl std::fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("databases", &self.len())
            .finish()
    }
}
