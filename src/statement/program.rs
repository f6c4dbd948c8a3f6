use std::sync::Arc;

use crate::cancel::CancellationSignal;
use crate::db::Session;
use crate::types::{Result, SqlValue, StrataError};

use super::StatementKind;

/// Metadata reported by the engine when a statement is prepared.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementInfo {
    /// Result column names, empty for statements that return no rows.
    pub column_names: Arc<[String]>,
    /// Number of bindable parameters.
    pub parameter_count: usize,
    /// Whether the engine considers the statement read-only.
    pub read_only: bool,
}

impl StatementInfo {
    pub(crate) fn empty() -> Self {
        Self {
            column_names: Arc::from(Vec::new()),
            parameter_count: 0,
            read_only: false,
        }
    }
}

/// Compiled SQL plus its bound arguments.
///
/// Parameters are 1-based. Unset parameters bind as NULL.
#[derive(Debug, Clone)]
pub struct Program {
    sql: String,
    kind: StatementKind,
    info: StatementInfo,
    bind_args: Vec<SqlValue>,
}

impl Program {
    /// Compiles `sql` on the session's connection and binds `args`.
    ///
    /// Transaction control statements skip prepare: they declare no
    /// parameters and no columns.
    pub fn compile(
        session: &Session,
        sql: &str,
        args: &[SqlValue],
        cancel: Option<&CancellationSignal>,
    ) -> Result<Program> {
        let sql = sql.trim();
        let kind = StatementKind::classify(sql);
        let info = if kind.is_transaction_control() {
            StatementInfo::empty()
        } else {
            session.prepare(sql, kind.is_read_only(), cancel)?
        };
        Program::from_parts(sql.to_owned(), kind, info, args)
    }

    pub(crate) fn from_parts(
        sql: String,
        kind: StatementKind,
        info: StatementInfo,
        args: &[SqlValue],
    ) -> Result<Program> {
        if args.len() > info.parameter_count {
            return Err(StrataError::misuse(format!(
                "too many bind arguments: {} arguments were provided but the statement needs {}",
                args.len(),
                info.parameter_count
            )));
        }
        let mut bind_args = vec![SqlValue::Null; info.parameter_count];
        bind_args[..args.len()].clone_from_slice(args);
        Ok(Program {
            sql,
            kind,
            info,
            bind_args,
        })
    }

    /// Trimmed SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Classification of the SQL text.
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// True if the statement was classified as a read.
    pub fn is_read_only(&self) -> bool {
        self.kind.is_read_only()
    }

    /// Result column names.
    pub fn column_names(&self) -> &Arc<[String]> {
        &self.info.column_names
    }

    /// Declared parameter count.
    pub fn parameter_count(&self) -> usize {
        self.info.parameter_count
    }

    /// Currently bound values, in parameter order.
    pub fn bind_args(&self) -> &[SqlValue] {
        &self.bind_args
    }

    /// Binds NULL.
    pub fn bind_null(&mut self, index: usize) -> Result<()> {
        self.bind_value(index, SqlValue::Null)
    }

    /// Binds an integer.
    pub fn bind_long(&mut self, index: usize, value: i64) -> Result<()> {
        self.bind_value(index, SqlValue::Int(value))
    }

    /// Binds a float.
    pub fn bind_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.bind_value(index, SqlValue::Float(value))
    }

    /// Binds text.
    pub fn bind_string(&mut self, index: usize, value: impl Into<String>) -> Result<()> {
        self.bind_value(index, SqlValue::String(value.into()))
    }

    /// Binds a blob.
    pub fn bind_blob(&mut self, index: usize, value: impl Into<Vec<u8>>) -> Result<()> {
        self.bind_value(index, SqlValue::Bytes(value.into()))
    }

    /// Binds any value at a 1-based index.
    pub fn bind_value(&mut self, index: usize, value: impl Into<SqlValue>) -> Result<()> {
        if index == 0 || index > self.bind_args.len() {
            return Err(StrataError::misuse(format!(
                "cannot bind argument at index {index} because the index is out of range; \
                 the statement has {} parameters",
                self.bind_args.len()
            )));
        }
        self.bind_args[index - 1] = value.into();
        Ok(())
    }

    /// Replaces every binding, starting at index 1.
    pub fn bind_all(&mut self, args: &[SqlValue]) -> Result<()> {
        if args.len() > self.bind_args.len() {
            return Err(StrataError::misuse(format!(
                "too many bind arguments: {} arguments were provided but the statement needs {}",
                args.len(),
                self.bind_args.len()
            )));
        }
        self.clear_bindings();
        self.bind_args[..args.len()].clone_from_slice(args);
        Ok(())
    }

    /// Resets every slot to NULL.
    pub fn clear_bindings(&mut self) {
        self.bind_args.fill(SqlValue::Null);
    }
}

/// A program bound to the session that executes it.
pub struct Statement {
    session: Session,
    program: Program,
    cancel: Option<CancellationSignal>,
}

impl Statement {
    /// Compiles `sql` for repeated execution on `session`.
    pub fn new(session: &Session, sql: &str, args: &[SqlValue]) -> Result<Self> {
        Ok(Self {
            program: Program::compile(session, sql, args, None)?,
            session: session.clone(),
            cancel: None,
        })
    }

    /// Attaches a cancellation signal to every later execution.
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The compiled program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Mutable access for rebinding.
    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Runs the statement, discarding any rows.
    pub fn execute(&self) -> Result<()> {
        self.session.execute(&self.program, self.cancel.as_ref())
    }

    /// Runs an UPDATE or DELETE and returns the number of changed rows.
    pub fn execute_update_delete(&self) -> Result<usize> {
        self.session
            .execute_for_changed_row_count(&self.program, self.cancel.as_ref())
    }

    /// Runs an INSERT and returns the new row id, or -1 when nothing was inserted.
    pub fn execute_insert(&self) -> Result<i64> {
        self.session
            .execute_for_last_inserted_row_id(&self.program, self.cancel.as_ref())
    }

    /// Returns the first column of the first row as an integer.
    pub fn simple_query_for_long(&self) -> Result<i64> {
        self.session
            .execute_for_long(&self.program, self.cancel.as_ref())
    }

    /// Returns the first column of the first row as text.
    pub fn simple_query_for_string(&self) -> Result<Option<String>> {
        self.session
            .execute_for_string(&self.program, self.cancel.as_ref())
    }
}
