//! Error types for tinysql.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Execution failures are wrapped in a [`QueryError`] that carries the full
//! completion record of the call, so callers can see which query failed, with
//! which parameters, and how long each phase took.

use crate::models::QueryCompleteContext;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Failed to read SQL source {path}: {message}")]
    Io { path: String, message: String },

    #[error(
        "Conflicting sql source paths found ({}). All source files under root dirs must have different relative paths.",
        .conflicts.join(", ")
    )]
    DuplicateName { conflicts: Vec<String> },

    #[error("Missing expected key [{key}] on input parameters.")]
    MissingParameter { key: String },

    #[error("Sql query with name [{name}] not found!")]
    QueryNotFound { name: String },

    #[error("Expected a future to be returned from transaction function.")]
    NotAwaitable,

    /// A handle derived for a transaction was used after the transaction ended.
    #[error("Transaction has already ended; run the call on the handle that started it.")]
    TransactionClosed,

    #[error("{hook} hook failed: {message}")]
    HookCallback { hook: &'static str, message: String },

    #[error("{0}")]
    Query(Box<QueryError>),

    /// Produced by error transformers that re-type execution errors.
    #[error("{0}")]
    Custom(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// A failed named or raw call, with the context observers saw.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    /// Query name, query text and the underlying failure, followed by the
    /// captured call site when stack capture is enabled.
    pub diagnostic: String,
    pub context: QueryCompleteContext,
    #[source]
    pub cause: DbError,
}

impl QueryError {
    /// Name of the query that failed.
    pub fn query_name(&self) -> &str {
        &self.context.begin.name
    }
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an I/O error for a SQL source path.
    pub fn io(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a missing parameter error.
    pub fn missing_parameter(key: impl Into<String>) -> Self {
        Self::MissingParameter { key: key.into() }
    }

    /// Create a query not found error.
    pub fn query_not_found(name: impl Into<String>) -> Self {
        Self::QueryNotFound { name: name.into() }
    }

    /// Create a hook callback error.
    pub fn hook_callback(hook: &'static str, message: impl Into<String>) -> Self {
        Self::HookCallback {
            hook,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap any error, typically from an error transformer.
    pub fn custom(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Box::new(err))
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Query(err) => err.cause.suggestion(),
            _ => None,
        }
    }

    /// Whether running the same call again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Database { sql_state, .. } => {
                matches!(sql_state.as_deref(), Some("40001") | Some("40P01"))
            }
            Self::Query(err) => err.cause.is_retryable(),
            _ => false,
        }
    }

    /// The execution context, when this is a contextualized query error.
    pub fn query_context(&self) -> Option<&QueryCompleteContext> {
        match self {
            Self::Query(err) => Some(&err.context),
            _ => None,
        }
    }

    /// Unwrap nested query errors down to the failure that started it.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::Query(err) => err.cause.root_cause(),
            other => other,
        }
    }
}

/// Hint for a database error, keyed on its SQLSTATE code when there is one.
fn database_suggestion(code: Option<&str>) -> &'static str {
    match code {
        Some("42P01") => "The referenced table does not exist; check the schema and search_path",
        Some("42703") => "A referenced column does not exist; check the column names",
        Some("42601") => "Check the SQL syntax near the reported position",
        Some("23505") => "A unique constraint was violated; the row already exists",
        Some("23503") => "A foreign key constraint was violated",
        Some("23502") => "A NOT NULL column received a null parameter",
        Some("57014") => "The statement was cancelled, possibly by statement_timeout_ms",
        Some("40001") | Some("40P01") => "Serialization failure or deadlock; retry the transaction",
        _ => "Check the SQL text and the objects it references",
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let suggestion = database_suggestion(code.as_deref());
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a connection from the pool",
                "Raise pool max or connection_timeout_ms, or shorten transactions holding connections",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Create a new TinySql handle")
            }
            sqlx::Error::Configuration(msg) => {
                DbError::connection(msg.to_string(), "Check the connection string")
            }
            sqlx::Error::Io(e) => DbError::connection(
                format!("I/O error: {}", e),
                "Check that the database is reachable",
            ),
            sqlx::Error::Tls(e) => DbError::connection(
                format!("TLS error: {}", e),
                "Check the sslmode and certificates in the connection string",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "The server sent an unexpected message; check the server version",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            other => DbError::internal(other.to_string()),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Maps a contextualized execution error before it is returned to the caller.
///
/// Only [`DbError::Query`] values are passed through the transformer.
pub type ErrorTransformer = Arc<dyn Fn(DbError) -> DbError + Send + Sync>;

/// The default transformer: returns the error unchanged.
pub fn identity_transformer() -> ErrorTransformer {
    Arc::new(|err| err)
}
