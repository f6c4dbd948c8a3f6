//! Forward and random access over a query result through a bounded window.
//!
//! A [`Cursor`] never materializes the whole result. It keeps one
//! [`CursorWindow`] of rows and refills it around the requested position,
//! re-executing the query each time. The first fill also counts every row so
//! [`Cursor::count`] is exact after the first move.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use tracing::{trace, warn};

use crate::cancel::CancellationSignal;
use crate::db::Session;
use crate::statement::Program;
use crate::types::{FieldType, Result, SqlValue, StrataError};
use crate::window::CursorWindow;

const NO_COUNT: i64 = -1;

/// Start position for a refill that must contain `position`, leaving about
/// a third of the window for rows before it.
pub fn cursor_pick_fill_window_start_position(position: usize, capacity: usize) -> usize {
    position.saturating_sub(capacity / 3)
}

enum ColumnMap {
    Hashed(FxHashMap<u64, usize>),
    Named(FxHashMap<String, usize>),
}

impl ColumnMap {
    fn build(names: &[String]) -> Self {
        let mut hashed = FxHashMap::default();
        for (index, name) in names.iter().enumerate() {
            if hashed.insert(hash_name(name), index).is_some() {
                let named = names
                    .iter()
                    .enumerate()
                    .map(|(index, name)| (name.clone(), index))
                    .collect();
                return ColumnMap::Named(named);
            }
        }
        ColumnMap::Hashed(hashed)
    }

    fn get(&self, names: &[String], name: &str) -> Option<usize> {
        match self {
            ColumnMap::Hashed(map) => map
                .get(&hash_name(name))
                .copied()
                .filter(|&index| names[index] == name),
            ColumnMap::Named(map) => map.get(name).copied(),
        }
    }
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Paged cursor over one query.
pub struct Cursor {
    session: Session,
    program: Program,
    cancel: Option<CancellationSignal>,
    window: Option<CursorWindow>,
    window_size: usize,
    position: i64,
    count: i64,
    capacity: usize,
    columns: Option<ColumnMap>,
    closed: bool,
}

impl Cursor {
    pub(crate) fn new(
        session: Session,
        program: Program,
        window_size: usize,
        cancel: Option<CancellationSignal>,
    ) -> Self {
        Self {
            session,
            program,
            cancel,
            window: None,
            window_size,
            position: -1,
            count: NO_COUNT,
            capacity: 0,
            columns: None,
            closed: false,
        }
    }

    /// Query this cursor runs.
    pub fn sql(&self) -> &str {
        self.program.sql()
    }

    /// Result column names.
    pub fn column_names(&self) -> &Arc<[String]> {
        self.program.column_names()
    }

    /// Number of result columns.
    pub fn column_count(&self) -> usize {
        self.program.column_names().len()
    }

    /// Name of column `index`.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.program.column_names().get(index).map(String::as_str)
    }

    /// Window currently held, if any.
    pub fn window(&self) -> Option<&CursorWindow> {
        self.window.as_ref()
    }

    fn throw_if_closed(&self) -> Result<()> {
        if self.closed {
            Err(StrataError::misuse("cursor is closed"))
        } else {
            Ok(())
        }
    }

    /// Total number of rows. Runs the first fill if needed.
    pub fn count(&mut self) -> Result<i64> {
        self.throw_if_closed()?;
        if self.count == NO_COUNT {
            self.fill_window(0)?;
        }
        Ok(self.count)
    }

    /// Current position: -1 before the first row, `count` after the last.
    pub fn position(&self) -> i64 {
        self.position
    }

    fn fill_window(&mut self, required: usize) -> Result<()> {
        let mut window = match self.window.take() {
            Some(mut window) => {
                window.clear();
                window
            }
            None => CursorWindow::new(Some(self.session.label()), self.window_size)?,
        };

        let first_fill = self.count == NO_COUNT;
        let start = if first_fill {
            cursor_pick_fill_window_start_position(required, 0)
        } else {
            cursor_pick_fill_window_start_position(required, self.capacity)
        };
        let filled = self.session.execute_for_window(
            &self.program,
            &mut window,
            start,
            required,
            first_fill,
            self.cancel.as_ref(),
        );

        match filled {
            Ok(fill) => {
                if first_fill {
                    self.count = i64::try_from(fill.total_rows).unwrap_or(i64::MAX);
                    self.capacity = window.num_rows();
                }
                trace!(
                    start = fill.start_position,
                    rows = window.num_rows(),
                    required,
                    count = self.count,
                    "cursor window filled"
                );
                self.window = Some(window);
                Ok(())
            }
            Err(err) => {
                self.count = NO_COUNT;
                Err(err)
            }
        }
    }

    fn window_contains(&self, position: usize) -> bool {
        self.window.as_ref().is_some_and(|window| {
            let start = window.start_position();
            position >= start && position < start + window.num_rows()
        })
    }

    /// Moves to an absolute position. Returns false, leaving the cursor
    /// before the first or after the last row, when out of range.
    pub fn move_to_position(&mut self, position: i64) -> Result<bool> {
        let count = self.count()?;
        if position >= count {
            self.position = count;
            return Ok(false);
        }
        if position < 0 {
            self.position = -1;
            return Ok(false);
        }
        if position == self.position && self.window.is_some() {
            return Ok(true);
        }

        let target = position as usize;
        if !self.window_contains(target) {
            if let Err(err) = self.fill_window(target) {
                self.position = -1;
                return Err(err);
            }
        }
        self.position = position;
        Ok(true)
    }

    /// Moves relative to the current position.
    pub fn move_by(&mut self, offset: i64) -> Result<bool> {
        self.move_to_position(self.position.saturating_add(offset))
    }

    /// Moves to the first row.
    pub fn move_to_first(&mut self) -> Result<bool> {
        self.move_to_position(0)
    }

    /// Moves to the last row.
    pub fn move_to_last(&mut self) -> Result<bool> {
        let count = self.count()?;
        self.move_to_position(count - 1)
    }

    /// Moves to the next row.
    pub fn move_to_next(&mut self) -> Result<bool> {
        self.move_to_position(self.position + 1)
    }

    /// Moves to the previous row.
    pub fn move_to_previous(&mut self) -> Result<bool> {
        self.move_to_position(self.position - 1)
    }

    /// True before the first row, and for empty results.
    pub fn is_before_first(&mut self) -> Result<bool> {
        Ok(self.count()? == 0 || self.position == -1)
    }

    /// True after the last row, and for empty results.
    pub fn is_after_last(&mut self) -> Result<bool> {
        let count = self.count()?;
        Ok(count == 0 || self.position == count)
    }

    /// True on the first row.
    pub fn is_first(&mut self) -> Result<bool> {
        Ok(self.position == 0 && self.count()? != 0)
    }

    /// True on the last row.
    pub fn is_last(&mut self) -> Result<bool> {
        let count = self.count()?;
        Ok(self.position == count - 1 && count != 0)
    }

    /// Index of a result column. `table.column` is looked up as `column`.
    pub fn column_index(&mut self, name: &str) -> Option<usize> {
        let name = match name.rfind('.') {
            Some(dot) => {
                warn!(column = name, "requesting column name with table name");
                &name[dot + 1..]
            }
            None => name,
        };
        let names = self.program.column_names().clone();
        let columns = self.columns.get_or_insert_with(|| ColumnMap::build(&names));
        columns.get(&names, name)
    }

    /// Like [`Cursor::column_index`] but a missing column is an error.
    pub fn column_index_or_err(&mut self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| StrataError::NoSuchColumn(name.to_owned()))
    }

    fn current_row(&mut self) -> Result<usize> {
        self.throw_if_closed()?;
        let count = self.count()?;
        if self.position < 0 || self.position >= count {
            return Err(StrataError::CursorIndexOutOfBounds {
                position: self.position,
                count,
            });
        }
        let position = self.position as usize;
        if !self.window_contains(position) {
            self.fill_window(position)?;
        }
        match &self.window {
            Some(window) => Ok(position - window.start_position()),
            None => Err(StrataError::Invalid("cursor has no window".to_owned())),
        }
    }

    fn with_window<T>(
        &mut self,
        read: impl FnOnce(&CursorWindow, usize) -> Result<T>,
    ) -> Result<T> {
        let row = self.current_row()?;
        match &self.window {
            Some(window) => read(window, row),
            None => Err(StrataError::Invalid("cursor has no window".to_owned())),
        }
    }

    /// Storage class of a column on the current row.
    pub fn get_type(&mut self, column: usize) -> Result<FieldType> {
        self.with_window(|window, row| Ok(window.get_type(row, column)))
    }

    /// True if the column is NULL on the current row.
    pub fn is_null(&mut self, column: usize) -> Result<bool> {
        self.with_window(|window, row| window.is_null(row, column))
    }

    /// Column as text.
    pub fn get_string(&mut self, column: usize) -> Result<Option<String>> {
        self.with_window(|window, row| window.get_string(row, column))
    }

    /// Column as bytes.
    pub fn get_blob(&mut self, column: usize) -> Result<Option<Vec<u8>>> {
        self.with_window(|window, row| window.get_blob(row, column))
    }

    /// Column as i64.
    pub fn get_long(&mut self, column: usize) -> Result<i64> {
        self.with_window(|window, row| window.get_long(row, column))
    }

    /// Column as i32, truncated.
    pub fn get_int(&mut self, column: usize) -> Result<i32> {
        self.with_window(|window, row| window.get_int(row, column))
    }

    /// Column as i16, truncated.
    pub fn get_short(&mut self, column: usize) -> Result<i16> {
        self.with_window(|window, row| window.get_short(row, column))
    }

    /// Column as f64.
    pub fn get_double(&mut self, column: usize) -> Result<f64> {
        self.with_window(|window, row| window.get_double(row, column))
    }

    /// Column as f32.
    pub fn get_float(&mut self, column: usize) -> Result<f32> {
        self.with_window(|window, row| window.get_float(row, column))
    }

    /// Column in its stored type.
    pub fn get_value(&mut self, column: usize) -> Result<SqlValue> {
        self.with_window(|window, row| {
            Ok(match window.get_type(row, column) {
                FieldType::Null => {
                    // out-of-range columns type as NULL too
                    window.is_null(row, column)?;
                    SqlValue::Null
                }
                FieldType::Integer => SqlValue::Int(window.get_long(row, column)?),
                FieldType::Float => SqlValue::Float(window.get_double(row, column)?),
                FieldType::String => {
                    SqlValue::String(window.get_string(row, column)?.unwrap_or_default())
                }
                FieldType::Blob => SqlValue::Bytes(window.get_blob(row, column)?.unwrap_or_default()),
            })
        })
    }

    /// Every column of the current row.
    pub fn row_values(&mut self) -> Result<Vec<SqlValue>> {
        (0..self.column_count()).map(|c| self.get_value(c)).collect()
    }

    /// Replaces the bind arguments used by the next [`Cursor::requery`].
    pub fn set_selection_arguments(&mut self, args: &[SqlValue]) -> Result<()> {
        self.throw_if_closed()?;
        self.program.bind_all(args)
    }

    /// Releases the window. The query runs again on the next access.
    pub fn deactivate(&mut self) {
        self.window = None;
    }

    /// Resets the cursor so the query re-executes on the next access.
    ///
    /// Returns false if the cursor or its database is closed.
    pub fn requery(&mut self) -> Result<bool> {
        if self.closed || self.session.is_stale() {
            return Ok(false);
        }
        if let Some(window) = &mut self.window {
            window.clear();
        }
        self.position = -1;
        self.count = NO_COUNT;
        Ok(true)
    }

    /// True after [`Cursor::close`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases the window and marks the cursor closed.
    pub fn close(&mut self) {
        self.closed = true;
        self.window = None;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if cfg!(debug_assertions) && !self.closed && self.window.is_some() {
            warn!(sql = %self.program.sql(), "cursor dropped without close");
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("sql", &self.program.sql())
            .field("position", &self.position)
            .field("count", &self.count)
            .field("closed", &self.closed)
            .finish()
    }
}
