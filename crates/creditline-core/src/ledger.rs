//! Ledger entry types.
//!
//! The ledger is the source of truth for every balance change. Entries are
//! written once and never edited, with a single exception: a completed entry
//! may be flipped to [`EntryStatus::Reversed`] when an explicit reversal is
//! appended for it.
//!
//! For a fixed user, folding [`EntryStatus::affects_balance`] entries in
//! creation order reproduces the cached balance, and every entry satisfies
//! `balance_after == balance_before + amount`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TransactionRef, UserId};

/// An immutable record of one balance-affecting event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Globally unique reference, time-ordered.
    pub transaction_ref: TransactionRef,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Caller-supplied dedup token. Unique across the ledger.
    pub idempotency_key: Option<String>,

    /// What kind of event this was.
    pub entry_type: EntryType,

    /// Signed credit amount. Positive = credit, negative = debit.
    pub amount: i64,

    /// Cached balance immediately before this entry was applied.
    pub balance_before: i64,

    /// Cached balance immediately after this entry was applied.
    pub balance_after: i64,

    /// Lifecycle status.
    pub status: EntryStatus,

    /// Which path produced the entry.
    pub source: EntrySource,

    /// Human-readable description.
    pub description: String,

    /// For refunds and rollbacks, the entry being compensated. For sync
    /// adjustments, the provider transaction id.
    pub related_transaction_ref: Option<String>,

    /// Informational usage details for deductions.
    pub usage_details: Option<UsageDetails>,

    /// Free-form metadata.
    pub metadata: serde_json::Value,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Materialize a requested entry against the balance it is applied to.
    ///
    /// A fresh `transaction_ref` is generated here, inside the store's atomic
    /// unit, so retries of the same request never reuse a ref.
    #[must_use]
    pub fn from_new(entry: NewEntry, balance_before: i64) -> Self {
        Self {
            transaction_ref: TransactionRef::generate(),
            user_id: entry.user_id,
            idempotency_key: entry.idempotency_key,
            entry_type: entry.entry_type,
            amount: entry.amount,
            balance_before,
            balance_after: balance_before + entry.amount,
            status: EntryStatus::Completed,
            source: entry.source,
            description: entry.description,
            related_transaction_ref: entry.related_transaction_ref,
            usage_details: entry.usage_details,
            metadata: entry.metadata,
            created_at: Utc::now(),
        }
    }

    /// Whether this entry added credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        self.amount > 0
    }

    /// Whether this entry removed credits.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        self.amount < 0
    }
}

/// A balance change requested by the credit service, before the store has
/// snapshotted balances or minted a ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    /// The user whose balance changes.
    pub user_id: UserId,
    /// Entry type.
    pub entry_type: EntryType,
    /// Signed amount.
    pub amount: i64,
    /// Originating path.
    pub source: EntrySource,
    /// Description.
    pub description: String,
    /// Optional dedup token.
    pub idempotency_key: Option<String>,
    /// Optional link to a compensated entry or provider transaction.
    pub related_transaction_ref: Option<String>,
    /// Optional usage details.
    pub usage_details: Option<UsageDetails>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
}

impl NewEntry {
    /// A positive balance change.
    #[must_use]
    pub fn credit(
        user_id: UserId,
        entry_type: EntryType,
        amount: i64,
        source: EntrySource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            entry_type,
            amount: amount.abs(),
            source,
            description: description.into(),
            idempotency_key: None,
            related_transaction_ref: None,
            usage_details: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A usage deduction; the amount is always stored negative.
    #[must_use]
    pub fn deduction(user_id: UserId, amount: i64, description: impl Into<String>) -> Self {
        Self {
            user_id,
            entry_type: EntryType::UsageDeduction,
            amount: -amount.abs(),
            source: EntrySource::Api,
            description: description.into(),
            idempotency_key: None,
            related_transaction_ref: None,
            usage_details: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A compensating refund for `related`.
    #[must_use]
    pub fn refund(
        user_id: UserId,
        amount: i64,
        related: impl Into<String>,
        source: EntrySource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            related_transaction_ref: Some(related.into()),
            ..Self::credit(user_id, EntryType::Refund, amount, source, description)
        }
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Attach a related ref.
    #[must_use]
    pub fn with_related(mut self, related: impl Into<String>) -> Self {
        self.related_transaction_ref = Some(related.into());
        self
    }

    /// Attach usage details.
    #[must_use]
    pub fn with_usage(mut self, usage: Option<UsageDetails>) -> Self {
        self.usage_details = usage;
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// First credit grant of a subscription (or a monthly grant of an annual plan).
    SubscriptionCredit,
    /// Credit grant from a subscription renewal charge.
    SubscriptionRenewal,
    /// One-off credit pack purchase.
    AddonPurchase,
    /// Credits spent on a generation job.
    UsageDeduction,
    /// Compensation for a failed job.
    Refund,
    /// Operator adjustment.
    ManualAdjustment,
    /// Promotional credits.
    Bonus,
    /// Credits removed because they expired.
    Expiry,
    /// Reversal of an earlier entry.
    Rollback,
    /// Credits replayed by reconciliation from the billing provider.
    SyncAdjustment,
}

impl EntryType {
    /// All entry types, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::SubscriptionCredit,
        Self::SubscriptionRenewal,
        Self::AddonPurchase,
        Self::UsageDeduction,
        Self::Refund,
        Self::ManualAdjustment,
        Self::Bonus,
        Self::Expiry,
        Self::Rollback,
        Self::SyncAdjustment,
    ];

    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCredit => "subscription_credit",
            Self::SubscriptionRenewal => "subscription_renewal",
            Self::AddonPurchase => "addon_purchase",
            Self::UsageDeduction => "usage_deduction",
            Self::Refund => "refund",
            Self::ManualAdjustment => "manual_adjustment",
            Self::Bonus => "bonus",
            Self::Expiry => "expiry",
            Self::Rollback => "rollback",
            Self::SyncAdjustment => "sync_adjustment",
        }
    }

    /// Types that `add_credits` accepts. Debits, refunds and rollbacks have
    /// dedicated operations.
    #[must_use]
    pub const fn is_grant(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionCredit
                | Self::SubscriptionRenewal
                | Self::AddonPurchase
                | Self::ManualAdjustment
                | Self::Bonus
                | Self::SyncAdjustment
        )
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown entry type: {s}"))
    }
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Applied to the balance.
    Completed,
    /// Recorded but not yet applied.
    Pending,
    /// Recorded as failed; never applied.
    Failed,
    /// Applied, then compensated by a later rollback entry.
    Reversed,
}

impl EntryStatus {
    /// Whether the entry's amount is part of the running balance.
    ///
    /// A reversed entry moved the balance when it was written; its rollback
    /// moves it back, so both stay in the sum.
    #[must_use]
    pub const fn affects_balance(&self) -> bool {
        matches!(self, Self::Completed | Self::Reversed)
    }
}

/// Which path wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Billing provider webhook.
    Webhook,
    /// Application API (job start, etc).
    Api,
    /// Internal automation (refunds, monthly grants).
    System,
    /// Operator action.
    Admin,
    /// Reconciliation sweep.
    Sync,
}

/// Informational details for a usage deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDetails {
    /// Operation performed (e.g. `image_generation`).
    pub operation_type: String,
    /// Model the job ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Correlation id of the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

/// Fold the balance-affecting amounts of `entries`.
#[must_use]
pub fn ledger_sum<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i64 {
    entries
        .into_iter()
        .filter(|e| e.status.affects_balance())
        .map(|e| e.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_new_snapshots_balances() {
        let user_id = UserId::generate();
        let entry = LedgerEntry::from_new(NewEntry::deduction(user_id, 40, "job"), 100);

        assert_eq!(entry.amount, -40);
        assert_eq!(entry.balance_before, 100);
        assert_eq!(entry.balance_after, 60);
        assert_eq!(entry.status, EntryStatus::Completed);
        assert!(entry.is_debit());
    }

    #[test]
    fn refund_carries_related_ref() {
        let user_id = UserId::generate();
        let entry = NewEntry::refund(user_id, -25, "01HREF", EntrySource::System, "failed job");
        assert_eq!(entry.amount, 25);
        assert_eq!(entry.entry_type, EntryType::Refund);
        assert_eq!(entry.related_transaction_ref.as_deref(), Some("01HREF"));
    }

    #[test]
    fn entry_type_wire_names_match_serde() {
        for t in EntryType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, serde_json::json!(t.as_str()));
            assert_eq!(t.as_str().parse::<EntryType>().unwrap(), t);
        }
    }

    #[test]
    fn only_grant_types_are_grants() {
        assert!(EntryType::Bonus.is_grant());
        assert!(EntryType::SyncAdjustment.is_grant());
        assert!(!EntryType::UsageDeduction.is_grant());
        assert!(!EntryType::Refund.is_grant());
        assert!(!EntryType::Rollback.is_grant());
    }

    #[test]
    fn ledger_sum_skips_pending_and_failed() {
        let user_id = UserId::generate();
        let mut entries = vec![
            LedgerEntry::from_new(
                NewEntry::credit(user_id, EntryType::Bonus, 100, EntrySource::Admin, "a"),
                0,
            ),
            LedgerEntry::from_new(NewEntry::deduction(user_id, 30, "b"), 100),
            LedgerEntry::from_new(
                NewEntry::credit(user_id, EntryType::Bonus, 999, EntrySource::Admin, "c"),
                70,
            ),
        ];
        entries[2].status = EntryStatus::Pending;
        assert_eq!(ledger_sum(&entries), 70);

        entries[0].status = EntryStatus::Reversed;
        assert_eq!(ledger_sum(&entries), 70);
    }

    #[test]
    fn reversed_entry_is_offset_by_its_rollback() {
        let user_id = UserId::generate();
        let mut grant = LedgerEntry::from_new(
            NewEntry::credit(user_id, EntryType::Bonus, 100, EntrySource::Admin, "grant"),
            20,
        );
        let rollback = LedgerEntry::from_new(
            NewEntry {
                entry_type: EntryType::Rollback,
                amount: -100,
                related_transaction_ref: Some(grant.transaction_ref.to_string()),
                ..NewEntry::credit(user_id, EntryType::Rollback, 0, EntrySource::Admin, "undo")
            },
            grant.balance_after,
        );
        grant.status = EntryStatus::Reversed;

        // Both stay in the sum, landing back on the opening balance
        assert_eq!(20 + ledger_sum([&grant, &rollback]), rollback.balance_after);
        assert_eq!(rollback.balance_after, 20);
    }
}
