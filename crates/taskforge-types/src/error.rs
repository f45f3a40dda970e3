//! Error types shared across the engine.
//!
//! Two layers: `RepositoryError` for storage adapters, and the public
//! `EngineError` taxonomy callers match on. Every `EngineError` carries a
//! stable machine-readable code via [`EngineError::code`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Errors produced by storage adapters.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// A uniqueness or compare-and-set constraint rejected the write.
    /// The store is the arbiter for mutex and claim races; adapters map
    /// their native constraint violations to this variant.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// The engine's public error taxonomy.
///
/// Expected failures (validation, conflicts) are values the caller matches
/// on, not panics. `code()` is stable across releases and safe to persist.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed definition, unknown executor, bad input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An executor reported failure.
    #[error("execution failed: {message}")]
    Execution {
        message: String,
        /// Whether the retry policy may re-attempt this failure.
        retryable: bool,
    },

    /// A storage operation failed or rolled back.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Mutex-key or instance-claim contention.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A node or workflow exceeded its deadline.
    #[error("timed out after {elapsed_secs}s: {scope}")]
    Timeout { scope: String, elapsed_secs: u64 },

    /// The recovery pass could not take over an orphaned instance.
    #[error("recovery failed: {0}")]
    Recovery(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The run was cancelled by request.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl EngineError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::Execution { .. } => "EXECUTION",
            EngineError::Transaction(_) => "TRANSACTION",
            EngineError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            EngineError::Timeout { .. } => "TIMEOUT",
            EngineError::Recovery(_) => "RECOVERY",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Cancelled(_) => "CANCELLED",
        }
    }

    /// Whether the retry policy may re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Execution { retryable, .. } => *retryable,
            EngineError::Timeout { .. } => true,
            EngineError::Transaction(_) => true,
            _ => false,
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(msg) => EngineError::NotFound(msg),
            RepositoryError::Conflict(msg) => EngineError::ConcurrencyConflict(msg),
            other => EngineError::Transaction(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            EngineError::Timeout {
                scope: "node fetch".into(),
                elapsed_secs: 30
            }
            .code(),
            "TIMEOUT"
        );
        assert_eq!(
            EngineError::ConcurrencyConflict("mutex".into()).code(),
            "CONCURRENCY_CONFLICT"
        );
    }

    #[test]
    fn test_repository_error_mapping() {
        let e: EngineError = RepositoryError::NotFound("instance abc".into()).into();
        assert!(matches!(e, EngineError::NotFound(_)));

        let e: EngineError = RepositoryError::Conflict("mutex_key taken".into()).into();
        assert!(matches!(e, EngineError::ConcurrencyConflict(_)));

        let e: EngineError = RepositoryError::Query("syntax".into()).into();
        assert!(matches!(e, EngineError::Transaction(_)));
    }

    #[test]
    fn test_retryability() {
        assert!(
            EngineError::Execution {
                message: "503".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(
            !EngineError::Execution {
                message: "bad input".into(),
                retryable: false
            }
            .is_retryable()
        );
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(
            EngineError::Timeout {
                scope: "node".into(),
                elapsed_secs: 10
            }
            .is_retryable()
        );
    }
}
