use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Central error type for noema operations.
#[derive(Error, Debug)]
pub enum NoemaError {
    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("edge not found: {0}")]
    EdgeNotFound(Uuid),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate id: {0}")]
    AlreadyExists(Uuid),

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("result exceeds maximum size of {limit} items")]
    ResultTooLarge { limit: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("concurrent modification detected: {0}")]
    Concurrent(String),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("operation disabled by configuration: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{op}: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<NoemaError>,
    },
}

/// Stable, programmatically matchable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidQuery,
    InvalidArgument,
    IntegrityViolation,
    DimensionMismatch,
    ResultTooLarge,
    Timeout,
    Cancelled,
    Concurrent,
    NotInitialized,
    Backend,
    Unsupported,
}

impl NoemaError {
    /// Attach the public operation name as context. Applied once at the
    /// facade boundary; the inner kind is preserved.
    pub fn in_op(self, op: &'static str) -> Self {
        match self {
            NoemaError::Op { .. } => self,
            other => NoemaError::Op {
                op,
                source: Box::new(other),
            },
        }
    }

    /// The stable kind tag for this error, looking through operation context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NoemaError::NodeNotFound(_)
            | NoemaError::EdgeNotFound(_)
            | NoemaError::IndexNotFound(_)
            | NoemaError::NotFound(_) => ErrorKind::NotFound,
            NoemaError::AlreadyExists(_) | NoemaError::IndexAlreadyExists(_) => {
                ErrorKind::AlreadyExists
            }
            NoemaError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            NoemaError::InvalidArgument(_) | NoemaError::Config(_) => ErrorKind::InvalidArgument,
            NoemaError::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            NoemaError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            NoemaError::ResultTooLarge { .. } => ErrorKind::ResultTooLarge,
            NoemaError::Timeout(_) => ErrorKind::Timeout,
            NoemaError::Cancelled => ErrorKind::Cancelled,
            NoemaError::Concurrent(_) => ErrorKind::Concurrent,
            NoemaError::NotInitialized => ErrorKind::NotInitialized,
            NoemaError::Backend(_) | NoemaError::Serialization(_) => ErrorKind::Backend,
            NoemaError::Unsupported(_) => ErrorKind::Unsupported,
            NoemaError::Op { source, .. } => source.kind(),
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrent)
    }
}

/// Convenience type alias for noema results.
pub type NoemaResult<T> = Result<T, NoemaError>;
