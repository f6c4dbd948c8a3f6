//! Error taxonomy and shared value types.

mod value;

pub use value::{format_general, parse_double_prefix, parse_long_prefix, FieldType, SqlValue};

use rusqlite::ErrorCode;

/// Coarse classification of every [`StrataError`].
///
/// Callers branch on the kind rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The database needs a schema or a migration before it can be used.
    Setup,
    /// The API was used incorrectly. Never retried.
    Misuse,
    /// A bounded resource (window memory) ran out. Close cursors and retry.
    ResourceExhausted,
    /// The storage engine rejected the operation.
    Engine,
    /// The database file is damaged.
    Corruption,
    /// The operation was canceled through a cancellation signal.
    Canceled,
    /// The database or session has been closed.
    Closed,
}

/// Error type for every fallible operation in the crate.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Stored schema version is unset or newer than supported.
    #[error("database needs schema setup")]
    SchemaNeeded,
    /// Stored schema version is older than expected.
    #[error("database needs migrations from version {from}")]
    MigrationNeeded {
        /// Version currently stored in the database.
        from: i64,
    },
    /// Protocol violation by the caller.
    #[error("misuse: {0}")]
    Misuse(String),
    /// A cursor window could not be allocated.
    #[error("cursor window allocation of {requested} bytes failed")]
    WindowAllocation {
        /// Requested arena size in bytes.
        requested: usize,
    },
    /// A single row does not fit into an empty window.
    #[error("row {row} too big to fit into a cursor window of {capacity} bytes")]
    RowTooBig {
        /// Logical row index.
        row: usize,
        /// Window capacity in bytes.
        capacity: usize,
    },
    /// Field access outside the rows or columns held by a window.
    #[error("couldn't read row {row}, col {column} from cursor window")]
    FieldOutOfRange {
        /// Window-relative row.
        row: usize,
        /// Column index.
        column: usize,
    },
    /// Cursor read before the first row or after the last one.
    #[error("index {position} requested, with a size of {count}")]
    CursorIndexOutOfBounds {
        /// Current cursor position.
        position: i64,
        /// Total rows in the result.
        count: i64,
    },
    /// A field could not be coerced to the requested type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A named column does not exist in the result.
    #[error("column '{0}' does not exist")]
    NoSuchColumn(String),
    /// Invalid input that is not a protocol violation.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Engine error.
    #[error("engine: {0}")]
    Engine(#[source] rusqlite::Error),
    /// Engine reported a damaged database.
    #[error("corruption: {0}")]
    Corruption(#[source] rusqlite::Error),
    /// Operation canceled.
    #[error("operation canceled")]
    Canceled,
    /// Database or session closed.
    #[error("database '{0}' is closed")]
    Closed(String),
    /// Filesystem error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// JSON payload error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration file error.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::SchemaNeeded | StrataError::MigrationNeeded { .. } => ErrorKind::Setup,
            StrataError::Misuse(_) => ErrorKind::Misuse,
            StrataError::WindowAllocation { .. } | StrataError::RowTooBig { .. } => {
                ErrorKind::ResourceExhausted
            }
            StrataError::Corruption(_) => ErrorKind::Corruption,
            StrataError::Canceled => ErrorKind::Canceled,
            StrataError::Closed(_) => ErrorKind::Closed,
            StrataError::FieldOutOfRange { .. }
            | StrataError::CursorIndexOutOfBounds { .. }
            | StrataError::TypeMismatch(_)
            | StrataError::NoSuchColumn(_)
            | StrataError::Invalid(_)
            | StrataError::Engine(_)
            | StrataError::Io(_)
            | StrataError::Json(_)
            | StrataError::Config(_) => ErrorKind::Engine,
        }
    }

    /// Builds a misuse error and logs it.
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "API misuse");
        StrataError::Misuse(message)
    }

    /// True for engine busy/locked conditions.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StrataError::Engine(err)
                if matches!(
                    err.sqlite_error_code(),
                    Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
                )
        )
    }
}

impl From<rusqlite::Error> for StrataError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StrataError::Corruption(err)
            }
            Some(ErrorCode::OperationInterrupted) => StrataError::Canceled,
            _ => StrataError::Engine(err),
        }
    }
}
