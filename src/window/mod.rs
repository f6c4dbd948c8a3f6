//! Fixed-capacity buffer of typed row fields.
//!
//! A [`CursorWindow`] holds a contiguous slice of a result set inside one
//! bounded byte arena. Every row is a directory of fixed-size field slots;
//! variable-length payloads (text and blobs) are appended to the same arena.
//! Rows and columns are addressed relative to the window, never relative to
//! the cursor: callers subtract [`CursorWindow::start_position`] first.

use tracing::trace;

use crate::types::{format_general, parse_double_prefix, parse_long_prefix, FieldType};
use crate::types::{Result, StrataError};

/// Default window size used by cursors.
pub const DEFAULT_WINDOW_SIZE: usize = 2048 * 1024;

const ROW_HEADER_SIZE: usize = 8;
const FIELD_SLOT_SIZE: usize = 16;
const ALIGN: usize = 8;
const UNNAMED: &str = "<unnamed>";

/// Bounded store of typed row fields.
pub struct CursorWindow {
    name: String,
    data: Vec<u8>,
    free_offset: usize,
    rows: Vec<usize>,
    num_columns: usize,
    start_position: usize,
}

impl CursorWindow {
    /// Allocates a window with `capacity` bytes of field storage.
    pub fn new(name: Option<&str>, capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| StrataError::WindowAllocation {
                requested: capacity,
            })?;
        data.resize(capacity, 0);
        let name = match name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => UNNAMED.to_owned(),
        };
        trace!(window = %name, capacity, "cursor window allocated");
        Ok(Self {
            name,
            data,
            free_offset: 0,
            rows: Vec::new(),
            num_columns: 0,
            start_position: 0,
        })
    }

    /// Window name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arena size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes still available for rows and payloads.
    pub fn free_space(&self) -> usize {
        self.data.len().saturating_sub(self.free_offset)
    }

    /// Logical index of the first row held by this window.
    pub fn start_position(&self) -> usize {
        self.start_position
    }

    /// Sets the logical index of the first row.
    pub fn set_start_position(&mut self, position: usize) {
        self.start_position = position;
    }

    /// Number of rows currently held.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns per row.
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Sets the column count. Fails once rows exist with a different count.
    pub fn set_num_columns(&mut self, columns: usize) -> bool {
        if !self.rows.is_empty() && columns != self.num_columns {
            return false;
        }
        self.num_columns = columns;
        true
    }

    /// Drops all rows and resets counts and start position. The arena is kept.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.free_offset = 0;
        self.num_columns = 0;
        self.start_position = 0;
    }

    /// Appends an empty row with every field NULL. Returns false when the
    /// window is full.
    pub fn alloc_row(&mut self) -> bool {
        let Some(size) = self
            .num_columns
            .checked_mul(FIELD_SLOT_SIZE)
            .and_then(|slots| slots.checked_add(ROW_HEADER_SIZE))
        else {
            return false;
        };
        let Some(offset) = self.alloc(size) else {
            return false;
        };
        self.data[offset..offset + size].fill(0);
        self.data[offset..offset + 4].copy_from_slice(&(self.num_columns as u32).to_le_bytes());
        self.rows.push(offset);
        true
    }

    /// Removes the most recently allocated row.
    pub fn free_last_row(&mut self) {
        self.rows.pop();
    }

    /// Stores a blob. Returns false when out of space or out of range.
    pub fn put_blob(&mut self, row: usize, column: usize, value: &[u8]) -> bool {
        self.put_bytes(row, column, FieldType::Blob, value)
    }

    /// Stores text. Returns false when out of space or out of range.
    pub fn put_string(&mut self, row: usize, column: usize, value: &str) -> bool {
        self.put_bytes(row, column, FieldType::String, value.as_bytes())
    }

    pub(crate) fn put_text_bytes(&mut self, row: usize, column: usize, value: &[u8]) -> bool {
        self.put_bytes(row, column, FieldType::String, value)
    }

    /// Stores an integer.
    pub fn put_long(&mut self, row: usize, column: usize, value: i64) -> bool {
        self.put_scalar(row, column, FieldType::Integer, value.to_le_bytes())
    }

    /// Stores a float.
    pub fn put_double(&mut self, row: usize, column: usize, value: f64) -> bool {
        self.put_scalar(row, column, FieldType::Float, value.to_le_bytes())
    }

    /// Stores NULL.
    pub fn put_null(&mut self, row: usize, column: usize) -> bool {
        self.put_scalar(row, column, FieldType::Null, [0; 8])
    }

    /// Storage class of a field. Out-of-range fields read as NULL.
    pub fn get_type(&self, row: usize, column: usize) -> FieldType {
        self.slot(row, column)
            .map_or(FieldType::Null, |slot| FieldType::from_tag(self.data[slot]))
    }

    /// True if the field is NULL.
    pub fn is_null(&self, row: usize, column: usize) -> Result<bool> {
        Ok(self.field(row, column)? == Field::Null)
    }

    /// Reads a field as bytes. Text yields its raw bytes; numbers are type errors.
    pub fn get_blob(&self, row: usize, column: usize) -> Result<Option<Vec<u8>>> {
        match self.field(row, column)? {
            Field::Null => Ok(None),
            Field::Blob(bytes) | Field::String(bytes) => Ok(Some(bytes.to_vec())),
            Field::Integer(_) => Err(type_error("Unable to convert INTEGER to blob")),
            Field::Float(_) => Err(type_error("Unable to convert FLOAT to blob")),
        }
    }

    /// Reads a field as text.
    pub fn get_string(&self, row: usize, column: usize) -> Result<Option<String>> {
        match self.field(row, column)? {
            Field::Null => Ok(None),
            Field::String(bytes) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
            Field::Integer(v) => Ok(Some(v.to_string())),
            Field::Float(v) => Ok(Some(format_general(v))),
            Field::Blob(_) => Err(type_error("Unable to convert BLOB to string")),
        }
    }

    /// Reads a field as an integer.
    pub fn get_long(&self, row: usize, column: usize) -> Result<i64> {
        match self.field(row, column)? {
            Field::Null => Ok(0),
            Field::String(bytes) => Ok(parse_long_prefix(&String::from_utf8_lossy(bytes))),
            Field::Integer(v) => Ok(v),
            Field::Float(v) => Ok(v as i64),
            Field::Blob(_) => Err(type_error("Unable to convert BLOB to long")),
        }
    }

    /// Reads a field as a float.
    pub fn get_double(&self, row: usize, column: usize) -> Result<f64> {
        match self.field(row, column)? {
            Field::Null => Ok(0.0),
            Field::String(bytes) => Ok(parse_double_prefix(&String::from_utf8_lossy(bytes))),
            Field::Integer(v) => Ok(v as f64),
            Field::Float(v) => Ok(v),
            Field::Blob(_) => Err(type_error("Unable to convert BLOB to double")),
        }
    }

    /// Narrowing view of [`CursorWindow::get_long`].
    pub fn get_int(&self, row: usize, column: usize) -> Result<i32> {
        Ok(self.get_long(row, column)? as i32)
    }

    /// Narrowing view of [`CursorWindow::get_long`].
    pub fn get_short(&self, row: usize, column: usize) -> Result<i16> {
        Ok(self.get_long(row, column)? as i16)
    }

    /// Narrowing view of [`CursorWindow::get_double`].
    pub fn get_float(&self, row: usize, column: usize) -> Result<f32> {
        Ok(self.get_double(row, column)? as f32)
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let offset = self.free_offset.checked_add(ALIGN - 1)? & !(ALIGN - 1);
        let end = offset.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }
        self.free_offset = end;
        Some(offset)
    }

    fn slot(&self, row: usize, column: usize) -> Option<usize> {
        if column >= self.num_columns {
            return None;
        }
        let offset = *self.rows.get(row)?;
        Some(offset + ROW_HEADER_SIZE + column * FIELD_SLOT_SIZE)
    }

    fn put_scalar(&mut self, row: usize, column: usize, kind: FieldType, payload: [u8; 8]) -> bool {
        let Some(slot) = self.slot(row, column) else {
            return false;
        };
        self.data[slot] = kind as u8;
        self.data[slot + 8..slot + 16].copy_from_slice(&payload);
        true
    }

    fn put_bytes(&mut self, row: usize, column: usize, kind: FieldType, value: &[u8]) -> bool {
        let Some(slot) = self.slot(row, column) else {
            return false;
        };
        let Some(offset) = self.alloc(value.len()) else {
            return false;
        };
        self.data[offset..offset + value.len()].copy_from_slice(value);
        self.data[slot] = kind as u8;
        self.data[slot + 8..slot + 12].copy_from_slice(&(offset as u32).to_le_bytes());
        self.data[slot + 12..slot + 16].copy_from_slice(&(value.len() as u32).to_le_bytes());
        true
    }

    fn field(&self, row: usize, column: usize) -> Result<Field<'_>> {
        let slot = self
            .slot(row, column)
            .ok_or(StrataError::FieldOutOfRange { row, column })?;
        let data: &[u8] = &self.data;
        let payload = &data[slot + 8..slot + 16];
        Ok(match FieldType::from_tag(data[slot]) {
            FieldType::Null => Field::Null,
            FieldType::Integer => Field::Integer(i64::from_le_bytes(read_word(payload))),
            FieldType::Float => Field::Float(f64::from_le_bytes(read_word(payload))),
            FieldType::String => Field::String(payload_bytes(data, payload)),
            FieldType::Blob => Field::Blob(payload_bytes(data, payload)),
        })
    }
}

impl std::fmt::Debug for CursorWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorWindow")
            .field("name", &self.name)
            .field("capacity", &self.data.len())
            .field("used", &self.free_offset)
            .field("rows", &self.rows.len())
            .field("columns", &self.num_columns)
            .field("start_position", &self.start_position)
            .finish()
    }
}

#[derive(Debug, PartialEq)]
enum Field<'a> {
    Null,
    Integer(i64),
    Float(f64),
    String(&'a [u8]),
    Blob(&'a [u8]),
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_word(bytes: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    buf
}

fn payload_bytes<'a>(data: &'a [u8], payload: &[u8]) -> &'a [u8] {
    let offset = read_u32(&payload[0..4]) as usize;
    let len = read_u32(&payload[4..8]) as usize;
    &data[offset..offset + len]
}

fn type_error(message: &str) -> StrataError {
    StrataError::TypeMismatch(message.to_owned())
}
