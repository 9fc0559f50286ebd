//! Billing provider abstraction.
//!
//! The engine only needs three read operations from the provider for
//! reconciliation. Webhook payloads are decoded by the HTTP layer into the
//! same [`ProviderSubscription`] and [`ProviderTransaction`] shapes, so the
//! webhook path and the sweep compute credits with the same rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditline_core::{
    BillingCycle, EntryType, PlanCatalog, PriceLine, SubscriptionSnapshot, SubscriptionStatus,
    UserId,
};

/// Errors talking to the billing provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The request never got a response.
    #[error("http error: {0}")]
    Http(String),

    /// The provider answered with an error status.
    #[error("provider returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Not enough information to find or create the customer.
    #[error("cannot resolve customer: {0}")]
    UnresolvableCustomer(String),
}

/// A subscription as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    /// Provider subscription id.
    pub id: String,
    /// Provider customer id.
    pub customer_id: String,
    /// Status.
    pub status: SubscriptionStatus,
    /// Purchased prices.
    pub items: Vec<PriceLine>,
    /// Start of the current billing period.
    pub current_period_start: Option<DateTime<Utc>>,
    /// End of the current billing period.
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether a cancellation is scheduled for period end.
    pub cancel_at_period_end: bool,
    /// Next scheduled charge.
    pub next_billed_at: Option<DateTime<Utc>>,
    /// Our user id, if the checkout carried it.
    pub user_id: Option<UserId>,
}

impl ProviderSubscription {
    /// Convert into the cached snapshot.
    ///
    /// Returns `None` when no item is a known subscription price. For annual
    /// plans the locally owned `next_credit_date` is carried over from
    /// `previous` when it describes the same subscription and still lies
    /// inside the current period. Otherwise the schedule starts one month
    /// after the period start, because each charge (first or renewal) grants
    /// the period's first month itself.
    #[must_use]
    pub fn to_snapshot(
        &self,
        catalog: &PlanCatalog,
        previous: Option<&SubscriptionSnapshot>,
    ) -> Option<SubscriptionSnapshot> {
        let (plan, billing_cycle) = catalog.subscription_plan(&self.items)?;

        let next_credit_date = match billing_cycle {
            BillingCycle::Monthly => None,
            BillingCycle::Annual => previous
                .filter(|p| p.subscription_id == self.id)
                .and_then(|p| p.next_credit_date)
                .filter(|date| self.current_period_start.map_or(true, |start| *date > start))
                .or_else(|| self.current_period_start.map(BillingCycle::next_credit_after)),
        };

        Some(SubscriptionSnapshot {
            subscription_id: self.id.clone(),
            status: self.status,
            plan,
            billing_cycle,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            next_credit_date,
            next_payment_date: self.next_billed_at,
        })
    }
}

/// Provider transaction status, reduced to what matters for crediting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTransactionStatus {
    /// Paid and settled.
    Completed,
    /// Paid, settlement pending.
    Paid,
    /// Charge failed.
    PastDue,
    /// Anything else (draft, ready, billed, canceled).
    #[serde(other)]
    Other,
}

impl ProviderTransactionStatus {
    /// Whether money was collected.
    #[must_use]
    pub const fn is_paid(&self) -> bool {
        matches!(self, Self::Completed | Self::Paid)
    }
}

/// A charge as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    /// Provider transaction id; doubles as the ledger idempotency key.
    pub id: String,
    /// Provider customer id.
    pub customer_id: Option<String>,
    /// Subscription the charge belongs to, if any.
    pub subscription_id: Option<String>,
    /// Status.
    pub status: ProviderTransactionStatus,
    /// Whether this is a recurring renewal charge.
    pub renewal: bool,
    /// Purchased prices.
    pub items: Vec<PriceLine>,
    /// When the charge was billed.
    pub billed_at: Option<DateTime<Utc>>,
    /// Our user id, if the checkout carried it.
    pub user_id: Option<UserId>,
}

/// Credits a provider transaction should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCredit {
    /// Ledger entry type for the webhook path.
    pub entry_type: EntryType,
    /// Credits to grant.
    pub amount: i64,
    /// Ledger description.
    pub description: String,
}

/// Work out the credits `transaction` grants under `catalog`.
///
/// Returns `None` for unpaid transactions and for ones whose prices grant
/// nothing.
#[must_use]
pub fn credit_for_transaction(
    catalog: &PlanCatalog,
    transaction: &ProviderTransaction,
) -> Option<TransactionCredit> {
    if !transaction.status.is_paid() {
        return None;
    }
    let amount = catalog.credits_for(&transaction.items);
    if amount <= 0 {
        return None;
    }

    let (entry_type, description) = match catalog.subscription_plan(&transaction.items) {
        Some((plan, _)) if transaction.renewal => (
            EntryType::SubscriptionRenewal,
            format!("{} plan renewal credits", plan.as_str()),
        ),
        Some((plan, _)) => (
            EntryType::SubscriptionCredit,
            format!("{} plan credits", plan.as_str()),
        ),
        None => (EntryType::AddonPurchase, "Credit pack purchase".to_string()),
    };

    Some(TransactionCredit {
        entry_type,
        amount,
        description,
    })
}

/// Read access to the billing provider's system of record.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Resolve the provider customer for a user, creating it if needed.
    async fn find_or_create_customer(
        &self,
        user_id: &UserId,
        email: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// List the customer's active (or trialing) subscriptions.
    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError>;

    /// The most recent transaction of a subscription.
    async fn latest_transaction(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderTransaction>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use creditline_core::Plan;

    fn line(price_id: &str) -> PriceLine {
        PriceLine {
            price_id: price_id.into(),
            quantity: 1,
        }
    }

    fn transaction(items: Vec<PriceLine>, renewal: bool) -> ProviderTransaction {
        ProviderTransaction {
            id: "txn_1".into(),
            customer_id: Some("ctm_1".into()),
            subscription_id: Some("sub_1".into()),
            status: ProviderTransactionStatus::Completed,
            renewal,
            items,
            billed_at: None,
            user_id: None,
        }
    }

    #[test]
    fn first_charge_and_renewal_types() {
        let catalog = PlanCatalog::default();
        let first = credit_for_transaction(&catalog, &transaction(vec![line("pri_pro_monthly")], false))
            .unwrap();
        assert_eq!(first.entry_type, EntryType::SubscriptionCredit);
        assert_eq!(first.amount, 5_000);

        let renewal =
            credit_for_transaction(&catalog, &transaction(vec![line("pri_pro_monthly")], true))
                .unwrap();
        assert_eq!(renewal.entry_type, EntryType::SubscriptionRenewal);
    }

    #[test]
    fn packs_are_addon_purchases_and_unpaid_grants_nothing() {
        let catalog = PlanCatalog::default();
        let mut txn = transaction(vec![line("pri_pack_2500")], false);
        let credit = credit_for_transaction(&catalog, &txn).unwrap();
        assert_eq!(credit.entry_type, EntryType::AddonPurchase);
        assert_eq!(credit.amount, 2_500);

        txn.status = ProviderTransactionStatus::PastDue;
        assert!(credit_for_transaction(&catalog, &txn).is_none());
    }

    #[test]
    fn annual_snapshot_keeps_local_credit_schedule() {
        let catalog = PlanCatalog::default();
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let sub = ProviderSubscription {
            id: "sub_1".into(),
            customer_id: "ctm_1".into(),
            status: SubscriptionStatus::Active,
            items: vec![line("pri_business_annual")],
            current_period_start: Some(start),
            current_period_end: Some(Utc.with_ymd_and_hms(2027, 1, 10, 0, 0, 0).unwrap()),
            cancel_at_period_end: false,
            next_billed_at: None,
            user_id: None,
        };

        let fresh = sub.to_snapshot(&catalog, None).unwrap();
        assert_eq!(fresh.plan, Plan::Business);
        assert_eq!(
            fresh.next_credit_date,
            Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap())
        );

        let mut advanced = fresh.clone();
        advanced.next_credit_date = Some(Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap());
        let merged = sub.to_snapshot(&catalog, Some(&advanced)).unwrap();
        assert_eq!(merged.next_credit_date, advanced.next_credit_date);
    }

    #[test]
    fn annual_renewal_restarts_credit_schedule() {
        let catalog = PlanCatalog::default();
        let year_two = Utc.with_ymd_and_hms(2027, 1, 10, 0, 0, 0).unwrap();
        let renewed = ProviderSubscription {
            id: "sub_1".into(),
            customer_id: "ctm_1".into(),
            status: SubscriptionStatus::Active,
            items: vec![line("pri_business_annual")],
            current_period_start: Some(year_two),
            current_period_end: Some(Utc.with_ymd_and_hms(2028, 1, 10, 0, 0, 0).unwrap()),
            cancel_at_period_end: false,
            next_billed_at: None,
            user_id: None,
        };

        // Year one's schedule ran out exactly at the renewal date
        let mut previous = renewed.to_snapshot(&catalog, None).unwrap();
        previous.current_period_start = Some(Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap());
        previous.current_period_end = Some(year_two);
        previous.next_credit_date = Some(year_two);

        let merged = renewed.to_snapshot(&catalog, Some(&previous)).unwrap();
        assert_eq!(
            merged.next_credit_date,
            Some(Utc.with_ymd_and_hms(2027, 2, 10, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn unknown_prices_produce_no_snapshot() {
        let catalog = PlanCatalog::default();
        let sub = ProviderSubscription {
            id: "sub_x".into(),
            customer_id: "ctm_1".into(),
            status: SubscriptionStatus::Active,
            items: vec![line("pri_mystery")],
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            next_billed_at: None,
            user_id: None,
        };
        assert!(sub.to_snapshot(&catalog, None).is_none());
    }
}
