//! In-memory storage implementation.
//!
//! One mutex guards every map, so each operation is trivially atomic and
//! linearizable within the process. Nothing survives a restart; use
//! [`crate::RocksStore`] for anything that must.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use creditline_core::{
    ledger_sum, EntrySource, EntryStatus, EntryType, GenerationJob, JobProgress, LedgerEntry,
    NewEntry, ProcessId, SubscriptionSnapshot, TransactionRef, UserBalance, UserId,
};

use crate::error::{Result, StoreError};
use crate::ops;
use crate::{BalanceRebuild, JobUpdate, Store};

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, UserBalance>,
    ledger: HashMap<TransactionRef, LedgerEntry>,
    by_user: HashMap<UserId, BTreeSet<TransactionRef>>,
    idempotency_keys: HashMap<String, TransactionRef>,
    refunds: HashMap<String, TransactionRef>,
    customers: HashMap<String, UserId>,
    jobs: HashMap<ProcessId, GenerationJob>,
}

impl Inner {
    fn balance_mut(&mut self, user_id: &UserId) -> &mut UserBalance {
        self.balances
            .entry(*user_id)
            .or_insert_with(|| UserBalance::new(*user_id))
    }

    fn current_credits(&self, user_id: &UserId) -> i64 {
        self.balances.get(user_id).map_or(0, |b| b.credits)
    }

    fn claim_slots(&self, entry: &NewEntry) -> Result<()> {
        if let Some(key) = entry.idempotency_key.as_deref() {
            if let Some(existing) = self.idempotency_keys.get(key) {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    transaction_ref: *existing,
                });
            }
        }
        if let Some(related) = ops::refund_slot(entry) {
            if let Some(existing) = self.refunds.get(related) {
                return Err(StoreError::DuplicateRefund {
                    related_transaction_ref: related.to_string(),
                    transaction_ref: *existing,
                });
            }
        }
        Ok(())
    }

    /// Insert a materialized entry with its indexes and apply it. Callers
    /// have already run every check.
    fn insert(&mut self, entry: &LedgerEntry) -> Result<()> {
        if self.ledger.contains_key(&entry.transaction_ref) {
            return Err(StoreError::DuplicateTransactionRef(entry.transaction_ref));
        }
        self.ledger.insert(entry.transaction_ref, entry.clone());
        self.by_user
            .entry(entry.user_id)
            .or_default()
            .insert(entry.transaction_ref);
        if let Some(key) = &entry.idempotency_key {
            self.idempotency_keys
                .insert(key.clone(), entry.transaction_ref);
        }
        let refund_slot = (entry.entry_type == EntryType::Refund)
            .then_some(entry.related_transaction_ref.as_ref())
            .flatten();
        if let Some(related) = refund_slot {
            self.refunds.insert(related.clone(), entry.transaction_ref);
        }
        ops::apply_entry(self.balance_mut(&entry.user_id), entry);
        Ok(())
    }

    fn entries_oldest_first(&self, user_id: &UserId) -> Vec<LedgerEntry> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|r| self.ledger.get(r).cloned())
            .collect()
    }

    fn job_mut(&mut self, process_id: &ProcessId) -> Result<&mut GenerationJob> {
        self.jobs.get_mut(process_id).ok_or_else(|| StoreError::NotFound {
            entity: "job",
            id: process_id.to_string(),
        })
    }
}

/// In-memory storage implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    /// Overwrite a cached balance without touching the ledger.
    ///
    /// Only for tests that need to simulate a drifted cache.
    #[doc(hidden)]
    pub fn corrupt_balance(&self, user_id: &UserId, credits: i64) -> Result<()> {
        self.lock()?.balance_mut(user_id).credits = credits;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>> {
        Ok(self.lock()?.balances.get(user_id).cloned())
    }

    fn ensure_balance(&self, user_id: &UserId) -> Result<UserBalance> {
        Ok(self.lock()?.balance_mut(user_id).clone())
    }

    fn set_customer_id(&self, user_id: &UserId, customer_id: &str) -> Result<UserBalance> {
        let mut inner = self.lock()?;
        inner.customers.insert(customer_id.to_string(), *user_id);
        let balance = inner.balance_mut(user_id);
        balance.customer_id = Some(customer_id.to_string());
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<UserId>> {
        Ok(self.lock()?.customers.get(customer_id).copied())
    }

    fn set_subscription(
        &self,
        user_id: &UserId,
        subscription: Option<SubscriptionSnapshot>,
    ) -> Result<UserBalance> {
        let mut inner = self.lock()?;
        let balance = inner.balance_mut(user_id);
        balance.subscription = subscription;
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    fn advance_next_credit_date(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(ops::advance_credit_date(
            inner.balance_mut(user_id),
            subscription_id,
            next,
        ))
    }

    fn mark_verified(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.lock()?.balance_mut(user_id).balance_verified_at = Some(at);
        Ok(())
    }

    fn append_entry(&self, entry: NewEntry) -> Result<LedgerEntry> {
        ops::check_appendable(&entry)?;
        let mut inner = self.lock()?;
        inner.claim_slots(&entry)?;

        let credits = inner.current_credits(&entry.user_id);
        ops::check_debit(credits, entry.amount)?;

        let written = LedgerEntry::from_new(entry, credits);
        inner.insert(&written)?;

        debug!(
            user_id = %written.user_id,
            transaction_ref = %written.transaction_ref,
            amount = written.amount,
            balance = written.balance_after,
            "Ledger entry appended"
        );
        Ok(written)
    }

    fn reverse_entry(
        &self,
        transaction_ref: &TransactionRef,
        description: &str,
        source: EntrySource,
    ) -> Result<LedgerEntry> {
        let mut inner = self.lock()?;

        let key = ops::reversal_key(transaction_ref);
        if let Some(existing) = inner.idempotency_keys.get(&key) {
            return Err(StoreError::DuplicateIdempotencyKey {
                key,
                transaction_ref: *existing,
            });
        }

        let original = inner
            .ledger
            .get(transaction_ref)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ledger entry",
                id: transaction_ref.to_string(),
            })?;
        let rollback = ops::rollback_for(original, description, source)?;

        let credits = inner.current_credits(&rollback.user_id);
        ops::check_debit(credits, rollback.amount)?;

        let written = LedgerEntry::from_new(rollback, credits);
        inner.insert(&written)?;
        if let Some(original) = inner.ledger.get_mut(transaction_ref) {
            original.status = EntryStatus::Reversed;
        }

        Ok(written)
    }

    fn get_entry(&self, transaction_ref: &TransactionRef) -> Result<Option<LedgerEntry>> {
        Ok(self.lock()?.ledger.get(transaction_ref).cloned())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .idempotency_keys
            .get(key)
            .and_then(|r| inner.ledger.get(r))
            .cloned())
    }

    fn find_refund(&self, related_transaction_ref: &str) -> Result<Option<LedgerEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .refunds
            .get(related_transaction_ref)
            .and_then(|r| inner.ledger.get(r))
            .cloned())
    }

    fn list_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.lock()?.entries_oldest_first(user_id);
        entries.reverse();
        Ok(entries)
    }

    fn rebuild_balance(&self, user_id: &UserId) -> Result<BalanceRebuild> {
        let mut inner = self.lock()?;
        let rebuilt = ledger_sum(&inner.entries_oldest_first(user_id));
        let balance = inner.balance_mut(user_id);
        let previous = balance.credits;
        balance.credits = rebuilt;
        balance.updated_at = Utc::now();
        Ok(BalanceRebuild {
            user_id: *user_id,
            previous,
            rebuilt,
        })
    }

    fn create_job(&self, job: &GenerationJob) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.process_id) {
            return Err(StoreError::DuplicateJob {
                process_id: job.process_id.to_string(),
            });
        }
        inner.jobs.insert(job.process_id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, process_id: &ProcessId) -> Result<Option<GenerationJob>> {
        Ok(self.lock()?.jobs.get(process_id).cloned())
    }

    fn update_job(&self, process_id: &ProcessId, progress: &JobProgress) -> Result<JobUpdate> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(process_id)?;
        let transition = job.apply_progress(progress);
        Ok(JobUpdate {
            job: job.clone(),
            transition,
        })
    }

    fn attach_refund(
        &self,
        process_id: &ProcessId,
        refund_transaction_ref: TransactionRef,
    ) -> Result<GenerationJob> {
        let mut inner = self.lock()?;
        let job = inner.job_mut(process_id)?;
        if job.refund_transaction_ref.is_none() {
            job.refund_transaction_ref = Some(refund_transaction_ref);
            job.updated_at = Utc::now();
        }
        Ok(job.clone())
    }
}
