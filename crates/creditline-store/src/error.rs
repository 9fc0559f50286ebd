//! Error types for creditline storage.

use creditline_core::TransactionRef;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Lock contention or a busy backend; safe to retry.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Lookup key.
        id: String,
    },

    /// A debit would drive the balance below zero.
    #[error("insufficient balance: balance={balance}, required={required}")]
    InsufficientBalance {
        /// Balance at the time of the check.
        balance: i64,
        /// Credits the debit needed.
        required: i64,
    },

    /// The idempotency key was already used; nothing was written.
    #[error("idempotency key already applied: {key} -> {transaction_ref}")]
    DuplicateIdempotencyKey {
        /// The key.
        key: String,
        /// Entry written by the first use of the key.
        transaction_ref: TransactionRef,
    },

    /// A refund already exists for this related ref; nothing was written.
    #[error("refund already recorded for {related_transaction_ref}: {transaction_ref}")]
    DuplicateRefund {
        /// The compensated ref.
        related_transaction_ref: String,
        /// The existing refund.
        transaction_ref: TransactionRef,
    },

    /// A freshly generated transaction ref already exists.
    #[error("transaction ref collision: {0}")]
    DuplicateTransactionRef(TransactionRef),

    /// A job with this process id already exists.
    #[error("job already exists: {process_id}")]
    DuplicateJob {
        /// The process id.
        process_id: String,
    },

    /// The requested change is not valid for the record's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
