use rustc_hash::{FxHashMap, FxHashSet};

/// Ids whose full row has already been handed to the caller, per table.
///
/// Lives in memory only; every new driver starts empty.
#[derive(Debug, Default, Clone)]
pub struct RecordCache {
    tables: FxHashMap<String, FxHashSet<String>>,
}

impl RecordCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the row was already shipped.
    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.tables.get(table).is_some_and(|ids| ids.contains(id))
    }

    /// Records that the full row was shipped.
    pub fn insert(&mut self, table: &str, id: &str) {
        match self.tables.get_mut(table) {
            Some(ids) => {
                ids.insert(id.to_owned());
            }
            None => {
                let mut ids = FxHashSet::default();
                ids.insert(id.to_owned());
                self.tables.insert(table.to_owned(), ids);
            }
        }
    }

    /// Forgets a row.
    pub fn remove(&mut self, table: &str, id: &str) {
        if let Some(ids) = self.tables.get_mut(table) {
            ids.remove(id);
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// Number of cached ids in `table`.
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, FxHashSet::len)
    }

    /// Number of cached ids across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(FxHashSet::len).sum()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
