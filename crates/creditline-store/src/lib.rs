//! Storage layer for creditline.
//!
//! This crate is the Ledger Store: it persists the append-only ledger, the
//! denormalized per-user balance and generation jobs, and it owns the atomic
//! units every balance mutation runs in. Two backends implement [`Store`]:
//!
//! - [`RocksStore`]: `RocksDB` `TransactionDB` with pessimistic row locks, so
//!   linearizability per user holds across every handle that opens the same
//!   database.
//! - [`MemoryStore`]: a single mutex over plain maps, for tests and local
//!   development.
//!
//! # Atomic units
//!
//! [`Store::append_entry`], [`Store::reverse_entry`] and
//! [`Store::rebuild_balance`] each read the balance, write the ledger and
//! write the balance as one unit. Either everything lands or nothing does.
//!
//! # Example
//!
//! ```no_run
//! use creditline_store::{RocksStore, Store};
//! use creditline_core::{EntrySource, EntryType, NewEntry, UserId};
//!
//! let store = RocksStore::open("/tmp/creditline-db").unwrap();
//!
//! let user_id = UserId::generate();
//! let entry = NewEntry::credit(user_id, EntryType::Bonus, 500, EntrySource::Admin, "Welcome");
//! let written = store.append_entry(entry).unwrap();
//! assert_eq!(written.balance_after, 500);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
mod ops;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use ops::reversal_key;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use creditline_core::{
    EntrySource, GenerationJob, JobProgress, LedgerEntry, NewEntry, ProcessId,
    SubscriptionSnapshot, TransactionRef, Transition, UserBalance, UserId,
};

/// Outcome of recomputing a cached balance from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceRebuild {
    /// The user.
    pub user_id: UserId,
    /// Cached balance before the rebuild.
    pub previous: i64,
    /// Balance derived from the ledger, now cached.
    pub rebuilt: i64,
}

impl BalanceRebuild {
    /// Whether the cache was wrong.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.previous != self.rebuilt
    }
}

/// Outcome of applying a progress event to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    /// The job after the update.
    pub job: GenerationJob,
    /// What the update did.
    pub transition: Transition,
}

/// The storage trait defining all database operations.
///
/// Balance-mutating operations are only called by the credit service; every
/// other component reads through it.
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Get the cached balance record for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>>;

    /// Get the balance record, creating a zero balance if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn ensure_balance(&self, user_id: &UserId) -> Result<UserBalance>;

    /// Link a billing customer id to a user and index it for reverse lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn set_customer_id(&self, user_id: &UserId, customer_id: &str) -> Result<UserBalance>;

    /// Find the user linked to a billing customer id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<UserId>>;

    /// Replace the cached subscription snapshot. Leaves `credits` untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn set_subscription(
        &self,
        user_id: &UserId,
        subscription: Option<SubscriptionSnapshot>,
    ) -> Result<UserBalance>;

    /// Move the next monthly grant date forward.
    ///
    /// Only applies when the cached snapshot still belongs to
    /// `subscription_id` and its current date is earlier than `next`.
    /// Returns whether the date moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn advance_next_credit_date(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        next: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stamp `balance_verified_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn mark_verified(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Append a ledger entry and apply it to the cached balance atomically.
    ///
    /// Inside one unit: claims the idempotency key, claims the refund slot for
    /// refunds, locks the balance, rejects debits that would go negative,
    /// writes the entry and its indexes, and writes the new balance.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicateIdempotencyKey` if the key was already used.
    /// - `StoreError::DuplicateRefund` if `related_transaction_ref` was already refunded.
    /// - `StoreError::InsufficientBalance` if a debit exceeds the balance.
    /// - `StoreError::DuplicateTransactionRef` on a ref collision.
    /// - `StoreError::InvalidState` for rollbacks, which must go through
    ///   [`Store::reverse_entry`].
    /// - `StoreError::Transient` on lock contention.
    fn append_entry(&self, entry: NewEntry) -> Result<LedgerEntry>;

    /// Reverse a completed entry.
    ///
    /// Flips the original to `reversed` and appends a `rollback` entry with
    /// the negated amount, keyed by [`reversal_key`], in one unit.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the entry does not exist.
    /// - `StoreError::DuplicateIdempotencyKey` if it was already reversed.
    /// - `StoreError::InvalidState` if the entry is not a completed, non-rollback entry.
    /// - `StoreError::InsufficientBalance` if reversing a credit would go negative.
    fn reverse_entry(
        &self,
        transaction_ref: &TransactionRef,
        description: &str,
        source: EntrySource,
    ) -> Result<LedgerEntry>;

    /// Get an entry by ref.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_entry(&self, transaction_ref: &TransactionRef) -> Result<Option<LedgerEntry>>;

    /// Find the entry written with an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>>;

    /// Find the refund recorded against a related ref.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_refund(&self, related_transaction_ref: &str) -> Result<Option<LedgerEntry>>;

    /// List a user's entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>>;

    /// Recompute the cached balance from the ledger while holding the
    /// balance lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn rebuild_balance(&self, user_id: &UserId) -> Result<BalanceRebuild>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Insert a new job.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateJob` if the process id is taken.
    fn create_job(&self, job: &GenerationJob) -> Result<()>;

    /// Get a job by process id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job(&self, process_id: &ProcessId) -> Result<Option<GenerationJob>>;

    /// Apply a progress event under the job's row lock.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job does not exist.
    fn update_job(&self, process_id: &ProcessId, progress: &JobProgress) -> Result<JobUpdate>;

    /// Record the refund issued for a failed job.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job does not exist.
    fn attach_refund(
        &self,
        process_id: &ProcessId,
        refund_transaction_ref: TransactionRef,
    ) -> Result<GenerationJob>;
}
