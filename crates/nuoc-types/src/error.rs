use thiserror::Error;

/// Errors from repository operations (used by trait definitions in nuoc-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Infrastructure failures that may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepositoryError::Connection(_) | RepositoryError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        assert!(RepositoryError::Connection("refused".into()).is_retryable());
        assert!(RepositoryError::Unavailable("locked".into()).is_retryable());
        assert!(!RepositoryError::NotFound.is_retryable());
        assert!(!RepositoryError::Conflict("status changed".into()).is_retryable());
        assert!(!RepositoryError::Query("bad".into()).is_retryable());
    }
}
