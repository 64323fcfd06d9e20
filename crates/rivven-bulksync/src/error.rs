//! Error types for rivven-bulksync
//!
//! Every failure of a sync operation maps to exactly one stage:
//! - Validation: malformed request, raised before any I/O
//! - Staging: staging table creation or bulk load failed
//! - Merge: the generated insert/update/delete failed
//! - Transaction: begin/commit/rollback failed
//!
//! Driver-level failures (connection, query, type conversion) are wrapped by
//! the stage they occurred in and remain reachable through `source()`.

use std::fmt;
use thiserror::Error;

/// Result type for rivven-bulksync operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed request (not retriable)
    Validation,
    /// Staging table creation or bulk load
    Staging,
    /// Merge statement execution
    Merge,
    /// Transaction control (begin/commit/rollback)
    Transaction,
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Configuration error
    Configuration,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable.
    ///
    /// The engine never retries on its own; this is a hint for callers.
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for rivven-bulksync
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Request failed validation; nothing was sent to the database
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Creating or loading the staging table failed
    #[error("staging error on {staging_table}: {message}")]
    Staging {
        message: String,
        staging_table: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The merge statement failed
    #[error("merge error: {message}")]
    Merge {
        message: String,
        sql: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Value could not be converted to the column type
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Staging { .. } => ErrorCategory::Staging,
            Self::Merge { .. } => ErrorCategory::Merge,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Unsupported { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// The wrapped engine error, if this error wraps one.
    ///
    /// Stage errors (`Staging`, `Merge`, `Transaction`) carry the driver-level
    /// error that caused them; this returns it when it is an [`Error`].
    pub fn cause(&self) -> Option<&Error> {
        let source = match self {
            Self::Staging { source, .. }
            | Self::Merge { source, .. }
            | Self::Transaction { source, .. }
            | Self::Connection { source, .. }
            | Self::Query { source, .. } => source.as_deref()?,
            _ => return None,
        };
        source.downcast_ref::<Error>()
    }

    /// SQL text attached to this error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Merge { sql, .. } => Some(sql),
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wrap a failure that happened while creating or loading a staging table
    pub fn staging(staging_table: impl Into<String>, source: Error) -> Self {
        Self::Staging {
            message: source.to_string(),
            staging_table: staging_table.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap a failure of the merge statement
    pub fn merge(sql: impl Into<String>, source: Error) -> Self {
        Self::Merge {
            message: source.to_string(),
            sql: sql.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transaction error with source
    pub fn transaction_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a query error with SQL and the driver error
    pub fn query_with_source(
        sql: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            message: source.to_string(),
            sql: Some(sql.into()),
            source: Some(Box::new(source)),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Rollback failed after `original` aborted the operation.
    ///
    /// The rollback failure is fatal and wins; the original failure is kept
    /// in the message.
    pub fn rollback_failed(original: &Error, rollback: Error) -> Self {
        Self::Transaction {
            message: format!("rollback failed after error ({}): {}", original, rollback),
            source: Some(Box::new(rollback)),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Staging => write!(f, "staging"),
            Self::Merge => write!(f, "merge"),
            Self::Transaction => write!(f, "transaction"),
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}
