//! Denormalized user balance and cached subscription snapshot.
//!
//! `UserBalance.credits` is a cache of the ledger's running total. Only the
//! store's ledger-applying operations write it; profile updates (customer id,
//! subscription snapshot, verification stamp) go through dedicated
//! operations that leave `credits` untouched.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

// ============================================================================
// Constants
// ============================================================================

/// Starter plan monthly credit allowance.
pub const STARTER_PLAN_CREDITS: i64 = 1_000;

/// Pro plan monthly credit allowance.
pub const PRO_PLAN_CREDITS: i64 = 5_000;

/// Business plan monthly credit allowance.
pub const BUSINESS_PLAN_CREDITS: i64 = 20_000;

/// Cached balance record for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBalance {
    /// The user.
    pub user_id: UserId,

    /// Current spendable balance.
    pub credits: i64,

    /// External billing identity, once resolved.
    pub customer_id: Option<String>,

    /// Last known subscription state from the billing provider.
    pub subscription: Option<SubscriptionSnapshot>,

    /// When the balance was last reconciled against the provider.
    pub balance_verified_at: Option<DateTime<Utc>>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// A fresh zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            credits: 0,
            customer_id: None,
            subscription: None,
            balance_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the user can afford `amount`.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.credits >= amount
    }

    /// The plan the user is on (Free without a live subscription).
    #[must_use]
    pub fn current_plan(&self) -> Plan {
        self.subscription
            .as_ref()
            .filter(|s| s.status.is_live())
            .map_or(Plan::Free, |s| s.plan)
    }

    /// Whether the cached snapshot shows a live subscription.
    #[must_use]
    pub fn has_active_subscription(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.status.is_live())
    }
}

/// Cached copy of the provider's subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Provider subscription id.
    pub subscription_id: String,

    /// Subscription status.
    pub status: SubscriptionStatus,

    /// Plan tier.
    pub plan: Plan,

    /// Billing cycle.
    pub billing_cycle: BillingCycle,

    /// Start of the current billing period.
    pub current_period_start: Option<DateTime<Utc>>,

    /// End of the current billing period.
    pub current_period_end: Option<DateTime<Utc>>,

    /// Whether the subscription cancels at period end.
    pub cancel_at_period_end: bool,

    /// Next monthly credit grant (annual plans only).
    pub next_credit_date: Option<DateTime<Utc>>,

    /// Next scheduled charge.
    pub next_payment_date: Option<DateTime<Utc>>,
}

impl SubscriptionSnapshot {
    /// Whether two snapshots describe the same provider state.
    ///
    /// `next_credit_date` is locally owned (advanced by the monthly credit
    /// job) and is ignored.
    #[must_use]
    pub fn same_provider_state(&self, other: &Self) -> bool {
        Self {
            next_credit_date: None,
            ..self.clone()
        } == Self {
            next_credit_date: None,
            ..other.clone()
        }
    }

    /// Whether this annual subscription has a monthly grant due at `now`.
    #[must_use]
    pub fn monthly_credit_due(&self, now: DateTime<Utc>) -> bool {
        self.billing_cycle == BillingCycle::Annual
            && self.status.is_live()
            && self.next_credit_date.is_some_and(|d| d <= now)
            && self.current_period_end.map_or(true, |end| {
                self.next_credit_date.is_some_and(|d| d < end)
            })
    }
}

/// Plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// No subscription.
    Free,
    /// Entry tier.
    Starter,
    /// Mid tier.
    Pro,
    /// Top tier.
    Business,
}

impl Plan {
    /// Credits granted per month of subscription.
    #[must_use]
    pub const fn monthly_credits(&self) -> i64 {
        match self {
            Self::Free => 0,
            Self::Starter => STARTER_PLAN_CREDITS,
            Self::Pro => PRO_PLAN_CREDITS,
            Self::Business => BUSINESS_PLAN_CREDITS,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }
}

/// Billing cycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    /// Charged and credited monthly.
    Monthly,
    /// Charged yearly, credited monthly.
    Annual,
}

impl BillingCycle {
    /// Advance `from` by one credit interval (always one month).
    #[must_use]
    pub fn next_credit_after(from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(Months::new(1)).unwrap_or(from)
    }
}

/// Subscription status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and active.
    Active,
    /// In a trial period.
    Trialing,
    /// Last charge failed; provider is retrying.
    PastDue,
    /// Paused by the customer.
    Paused,
    /// Canceled.
    Canceled,
}

impl SubscriptionStatus {
    /// Whether the subscription currently entitles the user to credits.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}
