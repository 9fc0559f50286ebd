//! Key encoding for the `RocksDB` backend.

use creditline_core::{ProcessId, TransactionRef, UserId};

/// Balance key: the 16 user id bytes.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Ledger key: the 16 ULID bytes.
#[must_use]
pub fn entry_key(transaction_ref: &TransactionRef) -> Vec<u8> {
    transaction_ref.to_bytes().to_vec()
}

/// Per-user ledger index key.
///
/// Format: `user_id (16 bytes) || transaction_ref (16 bytes)`. ULIDs sort
/// by creation time, so a prefix scan yields the user's ledger oldest first.
#[must_use]
pub fn user_entry_key(user_id: &UserId, transaction_ref: &TransactionRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_ref.to_bytes());
    key
}

/// Prefix for scanning one user's ledger index.
#[must_use]
pub fn user_entries_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ref from a per-user index key.
///
/// Returns `None` for keys shorter than 32 bytes.
#[must_use]
pub fn transaction_ref_from_user_key(key: &[u8]) -> Option<TransactionRef> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(TransactionRef::from_bytes(bytes))
}

/// Decode an index value holding a transaction ref.
#[must_use]
pub fn transaction_ref_from_value(value: &[u8]) -> Option<TransactionRef> {
    let bytes: [u8; 16] = value.try_into().ok()?;
    Some(TransactionRef::from_bytes(bytes))
}

/// Idempotency index key. Namespaced so it cannot collide with refund keys
/// if both indexes are ever merged.
#[must_use]
pub fn idempotency_key(key: &str) -> Vec<u8> {
    format!("idem:{key}").into_bytes()
}

/// Refund index key.
#[must_use]
pub fn refund_key(related_transaction_ref: &str) -> Vec<u8> {
    format!("refund:{related_transaction_ref}").into_bytes()
}

/// Customer index key.
#[must_use]
pub fn customer_key(customer_id: &str) -> Vec<u8> {
    customer_id.as_bytes().to_vec()
}

/// Job key.
#[must_use]
pub fn job_key(process_id: &ProcessId) -> Vec<u8> {
    process_id.as_str().as_bytes().to_vec()
}
