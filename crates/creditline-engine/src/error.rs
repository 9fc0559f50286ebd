//! Error types for the credit engine.

use creditline_store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors surfaced by the credit service and the components built on it.
///
/// Idempotent replays are not errors: they come back as successful results
/// flagged `replayed`.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// The request is malformed (bad amount, missing reference, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A debit exceeds the spendable balance.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientBalance {
        /// Balance at the time of the check.
        balance: i64,
        /// Credits the operation needed.
        required: i64,
    },

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Lookup key.
        id: String,
    },

    /// The request conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage failed. `retryable` is set when retries were exhausted on a
    /// transient error, so the caller may try again later.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying error.
        message: String,
        /// Whether the failure was transient.
        retryable: bool,
    },

    /// The billing provider failed or is unreachable.
    #[error("billing provider error: {0}")]
    Provider(String),
}

impl From<StoreError> for CreditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientBalance { balance, required } => {
                Self::InsufficientBalance { balance, required }
            }
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::DuplicateJob { process_id } => {
                Self::Conflict(format!("job already exists: {process_id}"))
            }
            StoreError::InvalidState(msg) => Self::Conflict(msg),
            e @ (StoreError::DuplicateIdempotencyKey { .. }
            | StoreError::DuplicateRefund { .. }
            | StoreError::DuplicateTransactionRef(_)) => Self::Conflict(e.to_string()),
            StoreError::Transient(message) => Self::Storage {
                message,
                retryable: true,
            },
            StoreError::Database(message) | StoreError::Serialization(message) => Self::Storage {
                message,
                retryable: false,
            },
        }
    }
}
