/// Provider-specific error with retry classification
///
/// Stores, schedulers, queues and emitters return this error type to tell the
/// engine whether the failed call may succeed if the unit of work is retried.
///
/// # Error Classification
///
/// **Retryable (is_retryable = true)**:
/// - Database busy/locked
/// - Connection timeouts
/// - Downstream emitter temporarily unavailable
///
/// **Non-retryable (is_retryable = false)**:
/// - Corrupt or undecodable records
/// - Constraint violations
/// - Invalid lock tokens
///
/// # Example Usage
///
/// ```rust,no_run
/// use opwatch::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("compare_and_set", "Database is busy"));
/// # }
///
/// # fn example2() -> Result<(), ProviderError> {
/// return Err(ProviderError::permanent("get", "Record is not valid JSON"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "get", "compare_and_set", "fetch_due")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// Whether this error should be retried
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Wrap a (de)serialization failure of a persisted value.
    pub fn codec(operation: impl Into<String>, e: serde_json::Error) -> Self {
        Self::permanent(operation, format!("Serialization error: {e}"))
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
