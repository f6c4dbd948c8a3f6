use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::cursor::Cursor;
use crate::types::{Result, SqlValue};

/// One full row: column names with their typed values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Record {
    /// Builds a record; `values` line up with `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Reads the cursor's current row.
    pub(crate) fn from_cursor(cursor: &mut Cursor) -> Result<Self> {
        let values = cursor.row_values()?;
        Ok(Self::new(cursor.column_names().clone(), values))
    }

    /// Value of a named column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    /// Row id, if the record has a text or integer `id` column.
    pub fn id(&self) -> Option<String> {
        self.get("id").and_then(SqlValue::as_id)
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(String::as_str).zip(&self.values)
    }

    /// Consumes the record, keeping only the values.
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}
