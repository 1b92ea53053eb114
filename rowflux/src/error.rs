//! Error types for row streaming

use std::fmt;
use thiserror::Error;

// ============================================================================
// Structured Scan Errors
// ============================================================================

/// Category of a row source failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanErrorKind {
    /// The connection or session went away mid-scan
    ConnectionClosed,
    /// The underlying resource (pool, socket, worker) failed
    ResourceFailure,
    /// The driver reported a failure it could not categorize
    Uncategorized,
    /// The statement itself failed (syntax, permissions, constraint)
    QueryFailed,
    /// A column could not be decoded into the requested type
    TypeConversion,
    /// The source was misconfigured
    Configuration,
    /// Other/unknown error
    Other,
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection_closed"),
            Self::ResourceFailure => write!(f, "resource_failure"),
            Self::Uncategorized => write!(f, "uncategorized"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured failure raised by a [`RowSource`](crate::source::RowSource) scan
///
/// The producer classifies scan failures with [`ScanError::is_transient`]:
/// transient failures close the stream quietly, everything else is handed
/// to the execution context.
///
/// # Example
///
/// ```rust
/// use rowflux::error::{ScanError, ScanErrorKind};
///
/// let err = ScanError::connection_closed("socket reset by peer")
///     .with_statement("SELECT * FROM orders");
/// assert_eq!(err.kind, ScanErrorKind::ConnectionClosed);
/// assert!(err.is_transient());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    /// The category of error
    pub kind: ScanErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Statement being scanned when the error occurred
    pub statement: Option<String>,
}

impl ScanError {
    /// Create a new scan error
    pub fn new(kind: ScanErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            statement: None,
        }
    }

    /// Create a connection closed error
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::ConnectionClosed, message)
    }

    /// Create a resource failure error
    pub fn resource_failure(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::ResourceFailure, message)
    }

    /// Create an uncategorized error
    pub fn uncategorized(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::Uncategorized, message)
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::QueryFailed, message)
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::TypeConversion, message)
    }

    /// Attach the statement that was being scanned
    #[must_use]
    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    /// Whether this failure means the source went away rather than the query being wrong
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ScanErrorKind::ConnectionClosed
                | ScanErrorKind::ResourceFailure
                | ScanErrorKind::Uncategorized
        )
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scan {} error: {}", self.kind, self.message)?;
        if let Some(ref statement) = self.statement {
            write!(f, " [statement: {}]", statement)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScanError {}

// ============================================================================
// Closure
// ============================================================================

/// Why a streaming invocation was closed before reaching its end marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureReason {
    /// The consumer cancelled or dropped the stream
    Cancelled,
    /// The producer could not enqueue a row within the buffer timeout
    ConsumerTimeout,
    /// The scan failed with a transient error (connection lost, resource failure)
    TransientSourceFailure,
    /// The scan failed with a non-transient error
    SourceFailure,
}

impl fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::ConsumerTimeout => write!(f, "consumer_timeout"),
            Self::TransientSourceFailure => write!(f, "transient_source_failure"),
            Self::SourceFailure => write!(f, "source_failure"),
        }
    }
}

// ============================================================================
// Crate Error
// ============================================================================

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// The stream was closed before its end marker
    #[error("Database connection is closed: {0}")]
    Closed(ClosureReason),

    /// Structured scan error
    #[error("{0}")]
    Scan(ScanError),

    /// Invalid argument or configuration value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Closure reason, if this error is a closure
    pub fn closure_reason(&self) -> Option<ClosureReason> {
        match self {
            Self::Closed(reason) => Some(*reason),
            _ => None,
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<ScanError> for Error {
    fn from(err: ScanError) -> Self {
        Error::Scan(err)
    }
}

// Conversion from sqlx::Error to ScanError
#[cfg(feature = "database")]
impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::PoolTimedOut => Self::resource_failure("Connection pool timed out"),
            E::PoolClosed => Self::connection_closed("Connection pool is closed"),
            E::WorkerCrashed => Self::connection_closed("Database worker crashed"),
            E::Io(e) => Self::connection_closed(e.to_string()),
            E::Tls(e) => Self::resource_failure(format!("TLS error: {}", e)),
            E::Protocol(msg) => Self::uncategorized(msg),
            E::Configuration(e) => Self::new(ScanErrorKind::Configuration, e.to_string()),
            E::TypeNotFound { type_name } => {
                Self::type_conversion(format!("Type not found: {}", type_name))
            }
            E::ColumnNotFound(col) => Self::query_failed(format!("Column not found: {}", col)),
            E::ColumnIndexOutOfBounds { index, len } => Self::query_failed(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            E::ColumnDecode { index, source } => Self::type_conversion(format!(
                "Failed to decode column {}: {}",
                index, source
            )),
            E::Decode(e) => Self::type_conversion(e.to_string()),
            E::Database(db_err) => Self::query_failed(db_err.to_string()),
            E::RowNotFound => Self::query_failed("Row not found"),
            _ => Self::new(ScanErrorKind::Other, err.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Scan(ScanError::from(err))
    }
}
