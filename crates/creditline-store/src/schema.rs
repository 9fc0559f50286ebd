//! Column families used by the `RocksDB` backend.

/// Column family names.
pub mod cf {
    /// Cached balances, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger entries, keyed by `transaction_ref` (ULID).
    pub const LEDGER: &str = "ledger";

    /// Index: ledger entries by user, keyed by `user_id || transaction_ref`.
    /// Value is empty (index only).
    pub const LEDGER_BY_USER: &str = "ledger_by_user";

    /// Unique index: idempotency key -> `transaction_ref`.
    pub const IDEMPOTENCY_KEYS: &str = "idempotency_keys";

    /// Unique index: refunded ref -> refund `transaction_ref`.
    pub const REFUNDS_BY_RELATED: &str = "refunds_by_related";

    /// Index: billing customer id -> `user_id`.
    pub const CUSTOMERS: &str = "customers";

    /// Generation jobs, keyed by `process_id`.
    pub const JOBS: &str = "jobs";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::LEDGER,
        cf::LEDGER_BY_USER,
        cf::IDEMPOTENCY_KEYS,
        cf::REFUNDS_BY_RELATED,
        cf::CUSTOMERS,
        cf::JOBS,
    ]
}
