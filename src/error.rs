//! Error types for omnidb.
//!
//! Every backend failure is mapped into one `DbError` taxonomy using `thiserror`.
//! Driver errors keep their original cause as `source` and carry a short
//! suggestion where one helps the caller recover.

use crate::config::DatabaseType;
use crate::model::ValidationErrors;
use thiserror::Error;

/// Boxed driver error kept as the `source` of a `DbError`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Read path failure (malformed statement, unknown column, driver error).
    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Write path failure (constraint violation, malformed statement, driver error).
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// The backend reported a unique index violation.
    #[error("Unique constraint violated: {message}")]
    UniqueConstraint {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        transaction_id: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Savepoints are not supported by the {backend} backend")]
    SavepointUnsupported { backend: DatabaseType },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Connection not found: {name}")]
    ConnectionNotFound { name: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: None,
        }
    }

    /// Create a connection error that keeps the driver error as its cause.
    pub fn connection_caused_by(
        message: impl Into<String>,
        suggestion: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: Some(source.into()),
        }
    }

    /// The error every operation on a closed adapter returns.
    pub fn not_connected() -> Self {
        Self::connection("not connected", "Call connect() before issuing operations")
    }

    /// The error a timed-out pool acquisition returns.
    pub fn pool_exhausted() -> Self {
        Self::connection(
            "pool exhausted",
            "Increase max_connections or acquire_timeout, or release connections sooner",
        )
    }

    /// Create a query (read path) error.
    pub fn query(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            code,
            source: None,
        }
    }

    /// Create an execution (write path) error.
    pub fn execution(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Execution {
            message: message.into(),
            code,
            source: None,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: Option<&str>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.map(String::from),
            source: None,
        }
    }

    /// Wrap a commit/rollback failure, keeping the driver error as its cause.
    pub fn transaction_caused_by(
        message: impl Into<String>,
        transaction_id: Option<&str>,
        source: DbError,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.map(String::from),
            source: Some(Box::new(source)),
        }
    }

    /// Create a savepoint-unsupported error.
    pub fn savepoint_unsupported(backend: DatabaseType) -> Self {
        Self::SavepointUnsupported { backend }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(name: impl Into<String>) -> Self {
        Self::ConnectionNotFound { name: name.into() }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::UniqueConstraint { .. } => {
                Some("A record with the same unique value already exists")
            }
            Self::SavepointUnsupported { .. } => {
                Some("Use a single-level transaction on this backend")
            }
            _ => None,
        }
    }

    /// Backend error code (SQLSTATE or server code), if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. }
            | Self::Execution { code, .. }
            | Self::UniqueConstraint { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transient transport failures qualify. A closed adapter or pool is
    /// not transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { message, .. } => {
                message != "not connected" && message != "Connection pool is closed"
            }
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueConstraint { .. })
    }

    /// Validation details, if this is a validation error.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }

    /// Re-tag a write-path error as a read-path error.
    ///
    /// Driver conversions produce `Execution`; read operations call this so
    /// callers see `Query` for failed fetches.
    pub fn into_query_error(self) -> Self {
        match self {
            Self::Execution {
                message,
                code,
                source,
            } => Self::Query {
                message,
                code,
                source,
            },
            other => other,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code().map(|c| c.to_string());
            let message = db_err.message().to_string();
            let unique = db_err.is_unique_violation();
            return if unique {
                DbError::UniqueConstraint {
                    message,
                    code,
                    source: Some(Box::new(err)),
                }
            } else {
                DbError::Execution {
                    message,
                    code,
                    source: Some(Box::new(err)),
                }
            };
        }

        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::PoolTimedOut => DbError::pool_exhausted(),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection_caused_by(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
                io_err,
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::query(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            other => DbError::Execution {
                message: other.to_string(),
                code: None,
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Convert MongoDB driver errors to DbError.
impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        let message = err.to_string();
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
                DbError::connection_caused_by(
                    message,
                    "Check that the MongoDB server is running and reachable",
                    err,
                )
            }
            ErrorKind::Authentication { .. } => DbError::connection_caused_by(
                message,
                "Verify the username and password in the connection string",
                err,
            ),
            ErrorKind::InvalidArgument { .. } => DbError::invalid_input(message),
            _ if message.contains("E11000") => DbError::UniqueConstraint {
                message,
                code: Some("11000".to_string()),
                source: Some(Box::new(err)),
            },
            _ => DbError::Execution {
                message,
                code: None,
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldError, Rule};

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check that the server is running");
        assert_eq!(err.suggestion(), Some("Check that the server is running"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::pool_exhausted().is_retryable());
        assert!(!DbError::not_connected().is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
        assert!(!DbError::execution("syntax", None).is_retryable());
    }

    #[test]
    fn test_into_query_error_retags_execution() {
        let err = DbError::execution("no such table", Some("1".to_string())).into_query_error();
        assert!(matches!(err, DbError::Query { .. }));
        assert_eq!(err.code(), Some("1"));

        let err = DbError::timeout("query", 5).into_query_error();
        assert!(matches!(err, DbError::Timeout { .. }));
    }

    #[test]
    fn test_savepoint_unsupported_names_backend() {
        let err = DbError::savepoint_unsupported(DatabaseType::MongoDB);
        assert!(err.to_string().contains("MongoDB"));
    }

    #[test]
    fn test_validation_error_exposes_fields() {
        let errors = ValidationErrors::from(vec![FieldError::new(
            "email",
            Rule::Format,
            "email must be a valid email",
        )]);
        let err = DbError::Validation(errors);
        let details = err.validation_errors().unwrap();
        assert_eq!(details.len(), 1);
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_transaction_error_keeps_cause() {
        use std::error::Error as _;
        let cause = DbError::execution("disk full", None);
        let err = DbError::transaction_caused_by("commit failed", Some("tx_1"), cause);
        assert!(err.source().is_some());
    }
}
