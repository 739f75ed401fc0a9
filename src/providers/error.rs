/// Provider-specific error with retry classification.
///
/// Persistence providers return this type to indicate whether a failed
/// operation should be retried. The executor uses `is_retryable()` when
/// deciding between the retry path and surfacing the failure to the caller.
///
/// **Retryable (retryable = true)**:
/// - Store busy/locked
/// - Connection timeouts
/// - Temporary resource exhaustion
///
/// **Non-retryable (retryable = false)**:
/// - Missing or corrupt instance state
/// - Serialization failures
/// - Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceError {
    /// Operation that failed (e.g., "save_instance_state").
    pub operation: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether this error should be retried.
    pub retryable: bool,
}

impl PersistenceError {
    /// Create a retryable (transient) error.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for PersistenceError {}
