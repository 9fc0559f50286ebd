//! Opportunistic reconciliation against the billing provider.
//!
//! Runs on user-facing reads rather than on a schedule. A cheap gate decides
//! whether the local state looks stale; only then does the sweep talk to the
//! provider. Missing provider transactions are replayed through
//! [`CreditService::add_credits`] keyed by the provider transaction id, the
//! same key the webhook path uses, so a sweep racing a webhook credits once.
//!
//! Provider failures degrade to cached data: the sweep logs, returns
//! [`SweepOutcome::Degraded`] and still stamps `balance_verified_at`, so an
//! outage costs one provider call per user per staleness window rather than
//! one per read.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use creditline_core::{EntrySource, EntryType, PlanCatalog, UserBalance, UserId};
use creditline_store::BalanceRebuild;

use crate::credits::{CreditGrant, CreditResult, CreditService};
use crate::error::Result;
use crate::provider::{credit_for_transaction, BillingProvider, ProviderError};

/// What a sweep did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// No provider configured, or the gate saw nothing stale.
    Skipped,
    /// The sweep ran to completion and stamped the balance.
    Synced(SyncReport),
    /// The provider could not be reached; cached data stands.
    Degraded(String),
}

/// Details of a completed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Provider customer id used.
    pub customer_id: String,
    /// Whether the cached subscription snapshot was overwritten.
    pub snapshot_updated: bool,
    /// Provider transactions already present in the ledger.
    pub already_recorded: usize,
    /// Provider transactions replayed into the ledger.
    pub replayed: Vec<CreditResult>,
    /// Cache correction applied after the replay, if the ledger disagreed.
    pub rebuilt: Option<BalanceRebuild>,
}

/// The reconciliation sweep.
#[derive(Clone)]
pub struct Reconciler {
    credits: Arc<CreditService>,
    provider: Option<Arc<dyn BillingProvider>>,
    catalog: Arc<PlanCatalog>,
    stale_after: Duration,
}

impl Reconciler {
    /// Create a sweep. Without a provider every sweep is skipped.
    #[must_use]
    pub fn new(
        credits: Arc<CreditService>,
        provider: Option<Arc<dyn BillingProvider>>,
        catalog: Arc<PlanCatalog>,
        stale_after: Duration,
    ) -> Self {
        Self {
            credits,
            provider,
            catalog,
            stale_after,
        }
    }

    /// Whether the local state looks stale enough to consult the provider.
    ///
    /// True when the balance is zero under a live subscription with no ledger
    /// history (the crediting webhook was likely lost), or when the user has a
    /// provider identity. Either way only if the last sweep is older than the
    /// threshold.
    #[must_use]
    pub fn should_sync(&self, balance: &UserBalance, has_history: bool, now: DateTime<Utc>) -> bool {
        let stale = balance
            .balance_verified_at
            .map_or(true, |at| now - at > self.stale_after);
        let lost_initial_credit =
            balance.credits == 0 && balance.has_active_subscription() && !has_history;
        stale && (lost_initial_credit || balance.customer_id.is_some())
    }

    /// Run the gate and, if it passes, the sweep.
    ///
    /// # Errors
    ///
    /// Storage errors only. Provider errors produce [`SweepOutcome::Degraded`].
    pub async fn sweep(
        &self,
        user_id: &UserId,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let Some(provider) = self.provider.as_deref() else {
            return Ok(SweepOutcome::Skipped);
        };

        let balance = self.credits.balance(user_id)?;
        let has_history = self.credits.has_history(user_id)?;
        if !self.should_sync(&balance, has_history, now) {
            debug!(user_id = %user_id, "Balance fresh, skipping sweep");
            return Ok(SweepOutcome::Skipped);
        }

        match self.sync(provider, &balance, email, now).await {
            Ok(report) => Ok(SweepOutcome::Synced(report)),
            Err(SyncError::Provider(e)) => {
                warn!(user_id = %user_id, error = %e, "Billing provider unavailable, using cached balance");
                self.credits.mark_verified(user_id, now).await?;
                Ok(SweepOutcome::Degraded(e.to_string()))
            }
            Err(SyncError::Credit(e)) => Err(e),
        }
    }

    async fn sync(
        &self,
        provider: &dyn BillingProvider,
        balance: &UserBalance,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<SyncReport, SyncError> {
        let user_id = balance.user_id;

        let customer_id = match &balance.customer_id {
            Some(id) => id.clone(),
            None => {
                let id = provider.find_or_create_customer(&user_id, email).await?;
                self.credits.link_customer(&user_id, &id).await?;
                id
            }
        };

        let subscriptions = provider.list_active_subscriptions(&customer_id).await?;
        let mut report = SyncReport {
            customer_id,
            ..SyncReport::default()
        };

        // The cache holds one snapshot: the first subscription whose price
        // the catalog knows.
        let fresh = subscriptions
            .iter()
            .find_map(|s| s.to_snapshot(&self.catalog, balance.subscription.as_ref()));
        if let Some(fresh) = fresh {
            let unchanged = balance
                .subscription
                .as_ref()
                .is_some_and(|cached| cached.same_provider_state(&fresh));
            if !unchanged {
                info!(
                    user_id = %user_id,
                    subscription_id = %fresh.subscription_id,
                    status = ?fresh.status,
                    "Subscription snapshot refreshed from provider"
                );
                self.credits
                    .update_subscription(&user_id, Some(fresh))
                    .await?;
                report.snapshot_updated = true;
            }
        }

        for subscription in &subscriptions {
            let Some(transaction) = provider.latest_transaction(&subscription.id).await? else {
                continue;
            };
            if self
                .credits
                .find_by_idempotency_key(&transaction.id)?
                .is_some()
            {
                report.already_recorded += 1;
                continue;
            }
            let Some(credit) = credit_for_transaction(&self.catalog, &transaction) else {
                continue;
            };

            let result = self
                .credits
                .add_credits(CreditGrant {
                    user_id,
                    amount: credit.amount,
                    entry_type: EntryType::SyncAdjustment,
                    description: format!("{} (reconciled)", credit.description),
                    source: EntrySource::Sync,
                    idempotency_key: Some(transaction.id.clone()),
                    related_transaction_ref: Some(transaction.id.clone()),
                    metadata: serde_json::json!({
                        "subscription_id": subscription.id,
                        "credit_type": credit.entry_type.as_str(),
                    }),
                })
                .await?;
            if result.replayed {
                report.already_recorded += 1;
            } else {
                info!(
                    user_id = %user_id,
                    provider_transaction = %transaction.id,
                    amount = result.amount,
                    "Replayed missing provider transaction"
                );
                report.replayed.push(result);
            }
        }

        let check = self.credits.verify_balance(&user_id)?;
        if !check.is_valid {
            report.rebuilt = Some(self.credits.rebuild_balance(&user_id).await?);
        }

        self.credits.mark_verified(&user_id, now).await?;
        Ok(report)
    }
}

enum SyncError {
    Provider(ProviderError),
    Credit(crate::CreditError),
}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<crate::CreditError> for SyncError {
    fn from(e: crate::CreditError) -> Self {
        Self::Credit(e)
    }
}
