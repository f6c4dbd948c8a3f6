use serde::Deserialize;

use super::cache::RecordCache;
use crate::types::{Result, SqlValue, StrataError};

/// How a batch operation affects the record cache once the batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "i64")]
pub enum CacheEffect {
    /// No cache change.
    #[default]
    Neutral,
    /// Each tuple's id becomes cached.
    Insert,
    /// Each tuple's id is forgotten.
    Delete,
}

impl CacheEffect {
    /// Wire code: 0 neutral, 1 insert, -1 delete.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(CacheEffect::Neutral),
            1 => Ok(CacheEffect::Insert),
            -1 => Ok(CacheEffect::Delete),
            other => Err(StrataError::Invalid(format!("unknown cache effect code {other}"))),
        }
    }
}

impl TryFrom<i64> for CacheEffect {
    type Error = StrataError;

    fn try_from(code: i64) -> Result<Self> {
        CacheEffect::from_code(code)
    }
}

/// One statement of a batch, run once per argument tuple.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchOperation {
    /// Cache effect applied after commit.
    #[serde(default)]
    pub effect: CacheEffect,
    /// Table whose cache the effect applies to; unused when neutral.
    #[serde(default)]
    pub table: String,
    /// Statement text.
    pub sql: String,
    /// Argument tuples; the first argument of each is the row id when the
    /// effect is not neutral.
    #[serde(default)]
    pub args: Vec<Vec<SqlValue>>,
}

impl BatchOperation {
    /// Operation without cache effect.
    pub fn neutral(sql: impl Into<String>, args: Vec<Vec<SqlValue>>) -> Self {
        Self {
            effect: CacheEffect::Neutral,
            table: String::new(),
            sql: sql.into(),
            args,
        }
    }

    /// Operation whose ids become cached.
    pub fn insert(table: impl Into<String>, sql: impl Into<String>, args: Vec<Vec<SqlValue>>) -> Self {
        Self {
            effect: CacheEffect::Insert,
            table: table.into(),
            sql: sql.into(),
            args,
        }
    }

    /// Operation whose ids are forgotten.
    pub fn delete(table: impl Into<String>, sql: impl Into<String>, args: Vec<Vec<SqlValue>>) -> Self {
        Self {
            effect: CacheEffect::Delete,
            table: table.into(),
            sql: sql.into(),
            args,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.effect != CacheEffect::Neutral && self.table.is_empty() {
            return Err(StrataError::Invalid(format!(
                "batch operation `{}` has a cache effect but no table",
                self.sql
            )));
        }
        Ok(())
    }

    /// Id carried by one argument tuple of a cache-affecting operation.
    pub(crate) fn tuple_id(&self, args: &[SqlValue]) -> Result<Option<String>> {
        if self.effect == CacheEffect::Neutral {
            return Ok(None);
        }
        args.first()
            .and_then(SqlValue::as_id)
            .map(Some)
            .ok_or_else(|| {
                StrataError::Invalid(format!(
                    "batch operation on `{}` needs a text id as its first argument",
                    self.table
                ))
            })
    }
}

/// Cache changes collected while a batch runs, applied only after commit.
#[derive(Debug, Default)]
pub(crate) struct PendingCacheChanges {
    added: Vec<(String, String)>,
    removed: Vec<(String, String)>,
}

impl PendingCacheChanges {
    pub(crate) fn record(&mut self, effect: CacheEffect, table: &str, id: String) {
        match effect {
            CacheEffect::Insert => self.added.push((table.to_owned(), id)),
            CacheEffect::Delete => self.removed.push((table.to_owned(), id)),
            CacheEffect::Neutral => {}
        }
    }

    /// Adds first, then removals, so an id inserted and deleted in the same
    /// batch ends up absent. Not atomic: a crash between the passes leaves
    /// only the adds applied.
    pub(crate) fn apply(self, cache: &mut RecordCache) {
        for (table, id) in &self.added {
            cache.insert(table, id);
        }
        for (table, id) in &self.removed {
            cache.remove(table, id);
        }
    }
}
