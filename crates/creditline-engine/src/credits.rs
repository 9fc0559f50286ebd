//! The credit service: the only writer of user balances.
//!
//! Every mutation is one atomic store unit (claim unique slots, lock the
//! balance, check, append, write balance, commit). Replays of an already
//! applied request are reported as successes with `replayed = true` and the
//! original entry's ref, never as errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use creditline_core::{
    ledger_sum, BillingCycle, EntrySource, EntryType, LedgerEntry, LedgerPage, LedgerQuery,
    NewEntry, SubscriptionSnapshot, TransactionRef, UsageDetails, UserBalance, UserId,
};
use creditline_store::{BalanceRebuild, Store, StoreError};

use crate::error::{CreditError, Result};
use crate::retry::RetryPolicy;

/// Most monthly grants a single call will catch up on.
pub const MAX_MONTHLY_CATCH_UP: usize = 12;

/// Request to grant credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGrant {
    /// Recipient.
    pub user_id: UserId,
    /// Credits to add; must be positive.
    pub amount: i64,
    /// Grant type (see [`EntryType::is_grant`]).
    pub entry_type: EntryType,
    /// Ledger description.
    pub description: String,
    /// Originating path.
    pub source: EntrySource,
    /// Dedup token; required for exactly-once under retrying callers.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Provider transaction id for sync adjustments.
    #[serde(default)]
    pub related_transaction_ref: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Request to spend credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    /// Payer.
    pub user_id: UserId,
    /// Credits to spend; must be positive.
    pub amount: i64,
    /// Ledger description.
    pub description: String,
    /// Informational usage details.
    #[serde(default)]
    pub usage_details: Option<UsageDetails>,
    /// Dedup token.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Request to compensate an earlier debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Recipient.
    pub user_id: UserId,
    /// Credits to return; must be positive.
    pub amount: i64,
    /// Ledger description.
    pub description: String,
    /// The debit being compensated. At most one refund exists per value.
    pub related_transaction_ref: String,
    /// Originating path.
    pub source: EntrySource,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Uniform result of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditResult {
    /// The entry that carries the effect (the original one on replay).
    pub transaction_ref: TransactionRef,
    /// Balance after the call.
    pub balance: i64,
    /// Signed amount of the entry.
    pub amount: i64,
    /// Whether this call found the effect already applied.
    pub replayed: bool,
}

impl CreditResult {
    fn applied(entry: &LedgerEntry) -> Self {
        Self {
            transaction_ref: entry.transaction_ref,
            balance: entry.balance_after,
            amount: entry.amount,
            replayed: false,
        }
    }
}

/// Ledger vs cache comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    /// The user.
    pub user_id: UserId,
    /// Whether the cache matches the ledger.
    pub is_valid: bool,
    /// Cached balance.
    pub stored_balance: i64,
    /// Sum over the ledger.
    pub calculated_balance: i64,
    /// `stored_balance - calculated_balance`.
    pub discrepancy: i64,
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(CreditError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn validate_key(key: Option<&str>) -> Result<()> {
    if key.is_some_and(|k| k.trim().is_empty()) {
        return Err(CreditError::Validation(
            "idempotency key must not be blank".into(),
        ));
    }
    Ok(())
}

/// The credit service.
#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl CreditService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// The underlying store, for read-only collaborators.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The retry policy mutations run under.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Append `entry`, retrying transient failures only when `retryable`.
    async fn append(
        &self,
        operation: &'static str,
        entry: NewEntry,
        retryable: bool,
    ) -> std::result::Result<LedgerEntry, StoreError> {
        if retryable {
            self.retry
                .run(operation, || self.store.append_entry(entry.clone()))
                .await
        } else {
            self.store.append_entry(entry)
        }
    }

    /// Build the replay result for an entry written by an earlier call.
    fn replay(&self, user_id: &UserId, transaction_ref: TransactionRef) -> Result<CreditResult> {
        let prior = self
            .store
            .get_entry(&transaction_ref)?
            .ok_or_else(|| CreditError::NotFound {
                entity: "ledger entry",
                id: transaction_ref.to_string(),
            })?;
        if prior.user_id != *user_id {
            return Err(CreditError::Conflict(format!(
                "{transaction_ref} belongs to a different user"
            )));
        }
        let balance = self
            .store
            .get_balance(user_id)?
            .map_or(0, |b| b.credits);
        Ok(CreditResult {
            transaction_ref,
            balance,
            amount: prior.amount,
            replayed: true,
        })
    }

    /// Grant credits.
    ///
    /// With an idempotency key the call is exactly-once: a repeat returns the
    /// first call's ref without mutating anything.
    ///
    /// # Errors
    ///
    /// `Validation` for non-positive amounts or non-grant types, `Storage` on
    /// storage failure.
    pub async fn add_credits(&self, grant: CreditGrant) -> Result<CreditResult> {
        validate_amount(grant.amount)?;
        validate_key(grant.idempotency_key.as_deref())?;
        if !grant.entry_type.is_grant() {
            return Err(CreditError::Validation(format!(
                "{} is not a credit grant type",
                grant.entry_type.as_str()
            )));
        }

        let user_id = grant.user_id;
        let retryable = grant.idempotency_key.is_some();
        let mut entry = NewEntry::credit(
            user_id,
            grant.entry_type,
            grant.amount,
            grant.source,
            grant.description,
        )
        .with_idempotency_key(grant.idempotency_key)
        .with_metadata(grant.metadata);
        if let Some(related) = grant.related_transaction_ref {
            entry = entry.with_related(related);
        }

        match self.append("add_credits", entry, retryable).await {
            Ok(written) => {
                info!(
                    user_id = %user_id,
                    transaction_ref = %written.transaction_ref,
                    entry_type = written.entry_type.as_str(),
                    amount = written.amount,
                    balance = written.balance_after,
                    "Credits added"
                );
                Ok(CreditResult::applied(&written))
            }
            Err(StoreError::DuplicateIdempotencyKey {
                key,
                transaction_ref,
            }) => {
                let result = self.replay(&user_id, transaction_ref)?;
                if result.amount != grant.amount {
                    warn!(
                        user_id = %user_id,
                        idempotency_key = %key,
                        requested = grant.amount,
                        recorded = result.amount,
                        "Idempotency key reused with a different amount"
                    );
                }
                info!(user_id = %user_id, idempotency_key = %key, transaction_ref = %transaction_ref, "Credit grant already applied");
                Ok(result)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Spend credits. The balance check and the write share one atomic unit.
    ///
    /// # Errors
    ///
    /// `InsufficientBalance` if the balance cannot cover `amount`,
    /// `Validation` for non-positive amounts.
    pub async fn deduct_credits(&self, deduction: Deduction) -> Result<CreditResult> {
        validate_amount(deduction.amount)?;
        validate_key(deduction.idempotency_key.as_deref())?;

        let user_id = deduction.user_id;
        let retryable = deduction.idempotency_key.is_some();
        let entry = NewEntry::deduction(user_id, deduction.amount, deduction.description)
            .with_usage(deduction.usage_details)
            .with_idempotency_key(deduction.idempotency_key);

        match self.append("deduct_credits", entry, retryable).await {
            Ok(written) => {
                info!(
                    user_id = %user_id,
                    transaction_ref = %written.transaction_ref,
                    amount = written.amount,
                    balance = written.balance_after,
                    "Credits deducted"
                );
                Ok(CreditResult::applied(&written))
            }
            Err(StoreError::DuplicateIdempotencyKey {
                transaction_ref, ..
            }) => self.replay(&user_id, transaction_ref),
            Err(e) => Err(e.into()),
        }
    }

    /// Return credits for an earlier debit. At most one refund is ever
    /// recorded per `related_transaction_ref`; repeats replay it.
    ///
    /// When `related_transaction_ref` names a ledger entry, that entry must be
    /// a debit of the same user at least as large as the refund.
    ///
    /// # Errors
    ///
    /// `Validation` for bad amounts or a mismatched related entry.
    pub async fn refund_credits(&self, refund: RefundRequest) -> Result<CreditResult> {
        validate_amount(refund.amount)?;
        if refund.related_transaction_ref.trim().is_empty() {
            return Err(CreditError::Validation(
                "refund requires a related transaction ref".into(),
            ));
        }

        if let Ok(related_ref) = refund.related_transaction_ref.parse::<TransactionRef>() {
            if let Some(debit) = self.store.get_entry(&related_ref)? {
                if debit.user_id != refund.user_id || !debit.is_debit() {
                    return Err(CreditError::Validation(format!(
                        "{related_ref} is not a debit of this user"
                    )));
                }
                if refund.amount > -debit.amount {
                    return Err(CreditError::Validation(format!(
                        "refund of {} exceeds debit of {}",
                        refund.amount, -debit.amount
                    )));
                }
            }
        }

        let user_id = refund.user_id;
        let entry = NewEntry::refund(
            user_id,
            refund.amount,
            refund.related_transaction_ref,
            refund.source,
            refund.description,
        )
        .with_metadata(refund.metadata);

        match self.append("refund_credits", entry, true).await {
            Ok(written) => {
                info!(
                    user_id = %user_id,
                    transaction_ref = %written.transaction_ref,
                    related = ?written.related_transaction_ref,
                    amount = written.amount,
                    balance = written.balance_after,
                    "Credits refunded"
                );
                Ok(CreditResult::applied(&written))
            }
            Err(StoreError::DuplicateRefund {
                related_transaction_ref,
                transaction_ref,
            }) => {
                info!(user_id = %user_id, related = %related_transaction_ref, "Refund already recorded");
                self.replay(&user_id, transaction_ref)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reverse a completed entry with a rollback entry. Repeats replay the
    /// first rollback.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown refs, `Conflict` for entries that cannot be
    /// reversed, `InsufficientBalance` if reversing a credit that was spent.
    pub async fn reverse_transaction(
        &self,
        transaction_ref: &TransactionRef,
        description: &str,
    ) -> Result<CreditResult> {
        let result = self
            .retry
            .run("reverse_transaction", || {
                self.store
                    .reverse_entry(transaction_ref, description, EntrySource::Admin)
            })
            .await;

        match result {
            Ok(written) => {
                info!(
                    user_id = %written.user_id,
                    transaction_ref = %written.transaction_ref,
                    reversed = %transaction_ref,
                    amount = written.amount,
                    balance = written.balance_after,
                    "Transaction reversed"
                );
                Ok(CreditResult::applied(&written))
            }
            Err(StoreError::DuplicateIdempotencyKey {
                transaction_ref: rollback_ref,
                ..
            }) => {
                let user_id = self
                    .store
                    .get_entry(&rollback_ref)?
                    .map(|e| e.user_id)
                    .ok_or_else(|| CreditError::NotFound {
                        entity: "ledger entry",
                        id: rollback_ref.to_string(),
                    })?;
                self.replay(&user_id, rollback_ref)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compare the cached balance with the ledger. Read-only.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn verify_balance(&self, user_id: &UserId) -> Result<BalanceCheck> {
        let stored_balance = self
            .store
            .get_balance(user_id)?
            .map_or(0, |b| b.credits);
        let calculated_balance = ledger_sum(&self.store.list_entries(user_id)?);
        let discrepancy = stored_balance - calculated_balance;

        Ok(BalanceCheck {
            user_id: *user_id,
            is_valid: discrepancy == 0,
            stored_balance,
            calculated_balance,
            discrepancy,
        })
    }

    /// Reset the cached balance to the ledger sum.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub async fn rebuild_balance(&self, user_id: &UserId) -> Result<BalanceRebuild> {
        let rebuild = self
            .retry
            .run("rebuild_balance", || self.store.rebuild_balance(user_id))
            .await?;
        if rebuild.changed() {
            warn!(
                user_id = %user_id,
                previous = rebuild.previous,
                rebuilt = rebuild.rebuilt,
                "Cached balance corrected from ledger"
            );
        }
        Ok(rebuild)
    }

    /// Grant any monthly credits an annual subscription is owed at `now`.
    ///
    /// Each month's grant is keyed by subscription and credit date, so calling
    /// this redundantly (or concurrently) grants each month once. Returns the
    /// grants made or replayed by this call.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub async fn process_monthly_credits(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditResult>> {
        let Some(mut sub) = self
            .store
            .get_balance(user_id)?
            .and_then(|b| b.subscription)
        else {
            return Ok(Vec::new());
        };

        let credits = sub.plan.monthly_credits();
        let mut granted = Vec::new();
        while granted.len() < MAX_MONTHLY_CATCH_UP && credits > 0 && sub.monthly_credit_due(now) {
            let Some(due) = sub.next_credit_date else {
                break;
            };
            let period = due.format("%Y-%m-%d").to_string();

            let result = self
                .add_credits(CreditGrant {
                    user_id: *user_id,
                    amount: credits,
                    entry_type: EntryType::SubscriptionCredit,
                    description: format!("{} plan monthly credits ({period})", sub.plan.as_str()),
                    source: EntrySource::System,
                    idempotency_key: Some(monthly_credit_key(&sub, due)),
                    related_transaction_ref: None,
                    metadata: serde_json::json!({
                        "subscription_id": sub.subscription_id,
                        "period": period,
                    }),
                })
                .await?;
            granted.push(result);

            let next = BillingCycle::next_credit_after(due);
            self.retry
                .run("advance_next_credit_date", || {
                    self.store
                        .advance_next_credit_date(user_id, &sub.subscription_id, next)
                })
                .await?;
            sub.next_credit_date = Some(next);
        }

        Ok(granted)
    }

    /// Cached balance record (a zero balance if the user has none yet).
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn balance(&self, user_id: &UserId) -> Result<UserBalance> {
        Ok(self
            .store
            .get_balance(user_id)?
            .unwrap_or_else(|| UserBalance::new(*user_id)))
    }

    /// Filtered, paginated ledger view.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn history(&self, user_id: &UserId, query: &LedgerQuery) -> Result<LedgerPage> {
        Ok(query.apply(self.store.list_entries(user_id)?))
    }

    /// Whether the user has any ledger entries.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn has_history(&self, user_id: &UserId) -> Result<bool> {
        Ok(!self.store.list_entries(user_id)?.is_empty())
    }

    /// Look up an entry.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn entry(&self, transaction_ref: &TransactionRef) -> Result<Option<LedgerEntry>> {
        Ok(self.store.get_entry(transaction_ref)?)
    }

    /// The entry written under an idempotency key, if any.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.store.find_by_idempotency_key(key)?)
    }

    /// Link a provider customer to a user.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub async fn link_customer(&self, user_id: &UserId, customer_id: &str) -> Result<UserBalance> {
        Ok(self
            .retry
            .run("set_customer_id", || {
                self.store.set_customer_id(user_id, customer_id)
            })
            .await?)
    }

    /// Resolve a provider customer to a user.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<UserId>> {
        Ok(self.store.find_user_by_customer(customer_id)?)
    }

    /// Replace the cached subscription snapshot.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub async fn update_subscription(
        &self,
        user_id: &UserId,
        subscription: Option<SubscriptionSnapshot>,
    ) -> Result<UserBalance> {
        Ok(self
            .retry
            .run("set_subscription", || {
                self.store.set_subscription(user_id, subscription.clone())
            })
            .await?)
    }

    /// Stamp the last successful reconciliation.
    ///
    /// # Errors
    ///
    /// `Storage` on storage failure.
    pub async fn mark_verified(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        Ok(self
            .retry
            .run("mark_verified", || self.store.mark_verified(user_id, at))
            .await?)
    }
}

/// Idempotency key of an annual plan's monthly grant.
#[must_use]
pub fn monthly_credit_key(sub: &SubscriptionSnapshot, due: DateTime<Utc>) -> String {
    format!("monthly:{}:{}", sub.subscription_id, due.format("%Y-%m-%d"))
}
