//! Custom scalar functions and the optional update hook capability.

use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::hooks::Action;
use rusqlite::Connection;

use crate::types::{Result, SqlValue, StrataError};

type Callback = dyn Fn(&FunctionArgs) -> FunctionResult + Send + Sync;

/// Value returned from a custom function.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    /// Binary result.
    Blob(Vec<u8>),
    /// Text result.
    String(String),
    /// 32-bit integer result.
    Int(i32),
    /// 64-bit integer result.
    Long(i64),
    /// Float result.
    Double(f64),
    /// NULL result.
    Null,
    /// Raises an error inside the statement.
    Error(String),
}

/// Arguments passed to a custom function, with the window coercion rules.
#[derive(Debug, Clone)]
pub struct FunctionArgs {
    values: Vec<SqlValue>,
}

impl FunctionArgs {
    /// Wraps already-materialized argument values.
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the function was called without arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument value.
    pub fn value(&self, index: usize) -> Result<&SqlValue> {
        self.values.get(index).ok_or_else(|| {
            StrataError::Invalid(format!(
                "requested arg {index} but had {}",
                self.values.len()
            ))
        })
    }

    /// Argument as bytes.
    pub fn get_blob(&self, index: usize) -> Result<Option<Vec<u8>>> {
        self.value(index)?.to_blob().map_err(StrataError::TypeMismatch)
    }

    /// Argument as text.
    pub fn get_string(&self, index: usize) -> Result<Option<String>> {
        self.value(index)?.to_text().map_err(StrataError::TypeMismatch)
    }

    /// Argument as a float.
    pub fn get_double(&self, index: usize) -> Result<f64> {
        self.value(index)?.to_double().map_err(StrataError::TypeMismatch)
    }

    /// Argument as a 32-bit integer.
    pub fn get_int(&self, index: usize) -> Result<i32> {
        Ok(self.get_long(index)? as i32)
    }

    /// Argument as an integer.
    pub fn get_long(&self, index: usize) -> Result<i64> {
        self.value(index)?.to_long().map_err(StrataError::TypeMismatch)
    }
}

/// A scalar function registered on every pooled connection.
#[derive(Clone)]
pub struct CustomFunction {
    name: String,
    num_args: i32,
    callback: Arc<Callback>,
}

impl CustomFunction {
    /// Creates a function taking `num_args` arguments, or any number when -1.
    pub fn new<F>(name: impl Into<String>, num_args: i32, callback: F) -> Self
    where
        F: Fn(&FunctionArgs) -> FunctionResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            num_args,
            callback: Arc::new(callback),
        }
    }

    /// Function name as used in SQL.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument count.
    pub fn num_args(&self) -> i32 {
        self.num_args
    }

    /// True when `other` is this same registration: same signature and callback.
    pub(crate) fn is_same(&self, other: &CustomFunction) -> bool {
        self.name == other.name
            && self.num_args == other.num_args
            && Arc::ptr_eq(&self.callback, &other.callback)
    }

    pub(crate) fn register(&self, conn: &Connection) -> Result<()> {
        let callback = AssertUnwindSafe(Arc::clone(&self.callback));
        conn.create_scalar_function(
            self.name.as_str(),
            self.num_args,
            FunctionFlags::SQLITE_UTF8,
            move |ctx: &Context<'_>| {
                let args = FunctionArgs::new(
                    (0..ctx.len())
                        .map(|i| SqlValue::from_value_ref(ctx.get_raw(i)))
                        .collect(),
                );
                match (callback.deref())(&args) {
                    FunctionResult::Blob(b) => Ok(SqlValue::Bytes(b)),
                    FunctionResult::String(s) => Ok(SqlValue::String(s)),
                    FunctionResult::Int(v) => Ok(SqlValue::Int(i64::from(v))),
                    FunctionResult::Long(v) => Ok(SqlValue::Int(v)),
                    FunctionResult::Double(v) => Ok(SqlValue::Float(v)),
                    FunctionResult::Null => Ok(SqlValue::Null),
                    FunctionResult::Error(message) => {
                        Err(rusqlite::Error::UserFunctionError(message.into()))
                    }
                }
            },
        )?;
        Ok(())
    }
}

impl fmt::Debug for CustomFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFunction")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .finish()
    }
}

/// Kind of row change reported to an [`UpdateHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Optional observer of row changes made through the primary connection.
pub trait UpdateHook: Send + Sync {
    /// Called for every changed row of a rowid table.
    fn on_change(&self, change: RowChange, database: &str, table: &str, rowid: i64);
}

pub(crate) fn install_update_hook(conn: &Connection, hook: Option<&Arc<dyn UpdateHook>>) {
    match hook {
        Some(hook) => {
            let hook = Arc::clone(hook);
            conn.update_hook(Some(
                move |action: Action, database: &str, table: &str, rowid: i64| {
                    let change = match action {
                        Action::SQLITE_INSERT => RowChange::Insert,
                        Action::SQLITE_UPDATE => RowChange::Update,
                        Action::SQLITE_DELETE => RowChange::Delete,
                        _ => return,
                    };
                    hook.on_change(change, database, table, rowid);
                },
            ));
        }
        None => conn.update_hook(None::<fn(Action, &str, &str, i64)>),
    }
}
