//! Error types for `livesql`.
//!
//! Every fallible operation returns [`Error`]. Variants carry a stable code
//! (`LSQ-XXX`) so that clients can branch on it without parsing messages.
//! Only the top-level table operations wrap errors into [`Error::Operation`],
//! which is where the human readable `Issue with dbo.<table>.<op>()` prefix
//! comes from.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::sqlstate;

/// Result type alias for `livesql` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured details of an error raised by the database server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbErrorInfo {
    /// SQLSTATE code (e.g. `23505`).
    pub code: Option<String>,
    /// Primary message reported by the server.
    pub message: String,
    /// Column involved, when the server reports one.
    pub column: Option<String>,
    /// Table involved, when the server reports one.
    pub table: Option<String>,
    /// Constraint involved, when the server reports one.
    pub constraint: Option<String>,
    /// Optional detail line.
    pub detail: Option<String>,
}

impl DbErrorInfo {
    /// Creates an error info with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the SQLSTATE code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Human readable label for the SQLSTATE code.
    #[must_use]
    pub fn code_info(&self) -> Option<&'static str> {
        self.code.as_deref().and_then(sqlstate::describe)
    }
}

impl std::fmt::Display for DbErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, self.code_info()) {
            (Some(code), Some(info)) => write!(f, "{} ({code}: {info})", self.message),
            (Some(code), None) => write!(f, "{} ({code})", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Errors that can occur in `livesql` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Field, table or command not allowed by the table rule (LSQ-001).
    #[error("[LSQ-001] Forbidden: {0}")]
    Forbidden(String),

    /// Malformed filter, select, params or payload (LSQ-002).
    #[error("[LSQ-002] Invalid request: {0}")]
    Validation(String),

    /// No join path, ambiguous path or invalid `$path` (LSQ-003).
    #[error("[LSQ-003] Join resolution failed: {0}")]
    JoinResolution(String),

    /// Error reported by the database (LSQ-004).
    #[error("[LSQ-004] Database error: {0}")]
    Database(DbErrorInfo),

    /// `expectOne` was requested but the row count differs (LSQ-005).
    #[error("[LSQ-005] Expected exactly one row, got {0}")]
    ExpectedOne(usize),

    /// Table or view not found in the introspected schema (LSQ-006).
    #[error("[LSQ-006] Table or view '{0}' not found")]
    TableNotFound(String),

    /// Configuration error (LSQ-007).
    #[error("[LSQ-007] Configuration error: {0}")]
    Config(String),

    /// Serialization error (LSQ-008).
    #[error("[LSQ-008] Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error, including catalog lock timeouts and upsert races (LSQ-009).
    #[error("[LSQ-009] Internal error: {0}")]
    Internal(String),

    /// Subscription, sync session or pub/sub manager already torn down (LSQ-010).
    #[error("[LSQ-010] Closed: {0}")]
    Closed(String),

    /// Failure of a top-level table operation (LSQ-011).
    #[error("Issue with dbo.{table}.{op}(): {source}")]
    Operation {
        /// Table the operation ran against.
        table: String,
        /// Operation name (`find`, `insert`, ...).
        op: &'static str,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the error code (e.g. "LSQ-001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "LSQ-001",
            Self::Validation(_) => "LSQ-002",
            Self::JoinResolution(_) => "LSQ-003",
            Self::Database(_) => "LSQ-004",
            Self::ExpectedOne(_) => "LSQ-005",
            Self::TableNotFound(_) => "LSQ-006",
            Self::Config(_) => "LSQ-007",
            Self::Serialization(_) => "LSQ-008",
            Self::Internal(_) => "LSQ-009",
            Self::Closed(_) => "LSQ-010",
            Self::Operation { source, .. } => source.code(),
        }
    }

    /// Wraps the error as the failure of `dbo.<table>.<op>()`.
    ///
    /// Already wrapped errors are left untouched so nested operations
    /// (e.g. `upsert` calling `insert`) keep the outermost context only once.
    #[must_use]
    pub fn within(self, table: &str, op: &'static str) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                table: table.to_string(),
                op,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping operation wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true for permission failures.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self.root(), Self::Forbidden(_))
    }

    /// Returns true if retrying the same request may succeed.
    ///
    /// Only lock contention and serialization failures qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Database(info) => matches!(
                info.code.as_deref(),
                Some("40001" | "40P01" | "55P03")
            ),
            _ => false,
        }
    }

    /// Builds the `{err, msg}` payload sent to clients.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let mut err = Map::new();
        err.insert("code".into(), json!(self.code()));
        match self.root() {
            Self::Database(info) => {
                err.insert("message".into(), json!(info.message));
                if let Some(code) = &info.code {
                    err.insert("code".into(), json!(code));
                }
                for (key, value) in [
                    ("column", &info.column),
                    ("table", &info.table),
                    ("constraint", &info.constraint),
                    ("detail", &info.detail),
                ] {
                    if let Some(v) = value {
                        err.insert(key.into(), json!(v));
                    }
                }
                if let Some(code_info) = info.code_info() {
                    err.insert("code_info".into(), json!(code_info));
                }
            }
            root => {
                err.insert("message".into(), json!(root.to_string()));
            }
        }
        ErrorPayload {
            err: Value::Object(err),
            msg: self.to_string(),
        }
    }
}

impl From<DbErrorInfo> for Error {
    fn from(info: DbErrorInfo) -> Self {
        Self::Database(info)
    }
}

/// Conversion from configuration errors.
impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// The `{err, msg}` error shape surfaced to sockets and local callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Structured error for programmatic handling.
    pub err: Value,
    /// Human readable message.
    pub msg: String,
}
