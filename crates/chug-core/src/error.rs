//! Error types for chug-core
//!
//! Every failure the engine can produce is a tagged variant here, so callers
//! can route on the kind instead of parsing messages:
//! - Per-table fatal errors (identifier, type mapping, DDL, insert)
//! - Pool construction failures
//! - Cancellation, which the scheduler treats as a normal terminal state
//! - Warning-grade failures (index creation) that callers log and ignore

use thiserror::Error;

/// Result type for chug-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chug-core
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier rejected by the guard; never retried
    #[error("invalid identifier: {name:?}")]
    InvalidIdentifier {
        /// The offending identifier, verbatim
        name: String,
    },

    /// Source column type with no destination mapping
    #[error("unsupported column type {source_type:?} for column {column:?}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// Source type name as reported by information_schema
        source_type: String,
    },

    /// Schema probe returned no columns, so no DDL can be synthesized
    #[error("no columns discovered for table {table:?}")]
    EmptyColumnList {
        /// Table name
        table: String,
    },

    /// Connection or pool construction failed
    #[error("connect failed: {message}")]
    ConnectFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Source-side query or row iteration failed
    #[error("extract failed: {message}")]
    ExtractFailed { message: String },

    /// Destination CREATE TABLE failed
    #[error("create table {table:?} failed: {message}")]
    CreateTableFailed { table: String, message: String },

    /// Destination insert exhausted its retries
    #[error("insert into {table:?} failed: {message}")]
    InsertFailed { table: String, message: String },

    /// Delta-column index creation failed; polling continues without it
    #[error("index creation on {table:?}.{column:?} failed: {message}")]
    IndexCreateFailed {
        table: String,
        column: String,
        message: String,
    },

    /// A retried operation failed on every attempt
    #[error("max retry attempts reached: {source}")]
    RetryExhausted {
        /// Attempts performed before giving up
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The governing cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// Caller supplied an unusable parameter (bad URL, zero batch size, ...)
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Create an `InvalidIdentifier` error
    pub fn invalid_identifier(name: impl Into<String>) -> Self {
        Self::InvalidIdentifier { name: name.into() }
    }

    /// Create an `UnsupportedType` error
    pub fn unsupported_type(column: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self::UnsupportedType {
            column: column.into(),
            source_type: source_type.into(),
        }
    }

    /// Create an `EmptyColumnList` error
    pub fn empty_columns(table: impl Into<String>) -> Self {
        Self::EmptyColumnList {
            table: table.into(),
        }
    }

    /// Create a `ConnectFailed` error
    pub fn connect(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a `ConnectFailed` error with an underlying driver error
    pub fn connect_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an `ExtractFailed` error
    pub fn extract(message: impl Into<String>) -> Self {
        Self::ExtractFailed {
            message: message.into(),
        }
    }

    /// Create a `CreateTableFailed` error
    pub fn create_table(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CreateTableFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an `InsertFailed` error
    pub fn insert(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InsertFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an `IndexCreateFailed` error
    pub fn index_create(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::IndexCreateFailed {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a `Config` error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error is (or wraps) a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RetryExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Whether this error is warning-grade (the caller may log and continue)
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::IndexCreateFailed { .. })
    }
}
