//! Billing provider events.
//!
//! The HTTP layer verifies and decodes webhook deliveries into
//! [`BillingEvent`]s; this module applies them. Deliveries are at-least-once,
//! so every handler is safe to repeat: credits are keyed by the provider
//! transaction id and snapshot updates are plain overwrites.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use creditline_core::{EntrySource, PlanCatalog, SubscriptionStatus, UserId};

use crate::credits::{CreditGrant, CreditResult, CreditService};
use crate::error::Result;
use crate::provider::{credit_for_transaction, ProviderSubscription, ProviderTransaction};

/// Subscription lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventKind {
    /// `subscription.created`
    Created,
    /// `subscription.updated`
    Updated,
    /// `subscription.canceled`
    Canceled,
    /// `subscription.paused`
    Paused,
    /// `subscription.resumed`
    Resumed,
}

/// A decoded billing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    /// A subscription changed state.
    Subscription {
        /// What happened.
        kind: SubscriptionEventKind,
        /// The subscription after the change.
        subscription: ProviderSubscription,
    },
    /// A charge was collected.
    TransactionCompleted(ProviderTransaction),
    /// A charge failed.
    TransactionPaymentFailed(ProviderTransaction),
}

impl BillingEvent {
    /// Event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Subscription { kind, .. } => match kind {
                SubscriptionEventKind::Created => "subscription.created",
                SubscriptionEventKind::Updated => "subscription.updated",
                SubscriptionEventKind::Canceled => "subscription.canceled",
                SubscriptionEventKind::Paused => "subscription.paused",
                SubscriptionEventKind::Resumed => "subscription.resumed",
            },
            Self::TransactionCompleted(_) => "transaction.completed",
            Self::TransactionPaymentFailed(_) => "transaction.payment_failed",
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Credits were granted (or the grant was replayed).
    Credited(CreditResult),
    /// The cached subscription snapshot was written.
    SubscriptionUpdated,
    /// Nothing to do; the reason is logged and returned.
    Ignored(String),
}

/// Applies billing events to the credit service.
#[derive(Clone)]
pub struct BillingEventProcessor {
    credits: Arc<CreditService>,
    catalog: Arc<PlanCatalog>,
}

impl BillingEventProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(credits: Arc<CreditService>, catalog: Arc<PlanCatalog>) -> Self {
        Self { credits, catalog }
    }

    /// Apply one event.
    ///
    /// Events for customers that cannot be tied to a user are ignored, not
    /// failed, so the provider stops redelivering them.
    ///
    /// # Errors
    ///
    /// Storage errors, which the webhook surfaces so the provider retries.
    pub async fn process(&self, event: BillingEvent) -> Result<EventOutcome> {
        let name = event.name();
        let outcome = match event {
            BillingEvent::Subscription { kind, subscription } => {
                self.subscription_changed(kind, subscription).await?
            }
            BillingEvent::TransactionCompleted(transaction) => {
                self.transaction_completed(transaction).await?
            }
            BillingEvent::TransactionPaymentFailed(transaction) => {
                self.payment_failed(&transaction).await?
            }
        };
        if let EventOutcome::Ignored(reason) = &outcome {
            debug!(event = name, reason = %reason, "Billing event ignored");
        }
        Ok(outcome)
    }

    /// Find the user an event belongs to and record the customer link.
    async fn resolve_user(
        &self,
        user_id: Option<UserId>,
        customer_id: Option<&str>,
    ) -> Result<Option<UserId>> {
        if let Some(user_id) = user_id {
            if let Some(customer_id) = customer_id {
                let linked = self.credits.balance(&user_id)?.customer_id;
                if linked.as_deref() != Some(customer_id) {
                    self.credits.link_customer(&user_id, customer_id).await?;
                }
            }
            return Ok(Some(user_id));
        }
        match customer_id {
            Some(customer_id) => self.credits.find_user_by_customer(customer_id),
            None => Ok(None),
        }
    }

    async fn subscription_changed(
        &self,
        kind: SubscriptionEventKind,
        subscription: ProviderSubscription,
    ) -> Result<EventOutcome> {
        let Some(user_id) = self
            .resolve_user(subscription.user_id, Some(&subscription.customer_id))
            .await?
        else {
            warn!(
                customer_id = %subscription.customer_id,
                subscription_id = %subscription.id,
                "Subscription event for unknown customer"
            );
            return Ok(EventOutcome::Ignored(format!(
                "unknown customer {}",
                subscription.customer_id
            )));
        };

        let previous = self.credits.balance(&user_id)?.subscription;
        let Some(mut snapshot) = subscription.to_snapshot(&self.catalog, previous.as_ref()) else {
            return Ok(EventOutcome::Ignored(format!(
                "subscription {} has no known plan price",
                subscription.id
            )));
        };
        match kind {
            SubscriptionEventKind::Canceled => snapshot.status = SubscriptionStatus::Canceled,
            SubscriptionEventKind::Paused => snapshot.status = SubscriptionStatus::Paused,
            SubscriptionEventKind::Created
            | SubscriptionEventKind::Updated
            | SubscriptionEventKind::Resumed => {}
        }

        info!(
            user_id = %user_id,
            subscription_id = %snapshot.subscription_id,
            kind = ?kind,
            plan = snapshot.plan.as_str(),
            status = ?snapshot.status,
            "Subscription snapshot updated"
        );
        self.credits
            .update_subscription(&user_id, Some(snapshot))
            .await?;
        Ok(EventOutcome::SubscriptionUpdated)
    }

    async fn transaction_completed(&self, transaction: ProviderTransaction) -> Result<EventOutcome> {
        let Some(user_id) = self
            .resolve_user(transaction.user_id, transaction.customer_id.as_deref())
            .await?
        else {
            warn!(transaction_id = %transaction.id, "Paid transaction for unknown customer");
            return Ok(EventOutcome::Ignored(format!(
                "transaction {} has no known user",
                transaction.id
            )));
        };

        let Some(credit) = credit_for_transaction(&self.catalog, &transaction) else {
            return Ok(EventOutcome::Ignored(format!(
                "transaction {} grants no credits",
                transaction.id
            )));
        };

        let result = self
            .credits
            .add_credits(CreditGrant {
                user_id,
                amount: credit.amount,
                entry_type: credit.entry_type,
                description: credit.description,
                source: EntrySource::Webhook,
                idempotency_key: Some(transaction.id.clone()),
                related_transaction_ref: None,
                metadata: serde_json::json!({
                    "provider_transaction_id": transaction.id,
                    "subscription_id": transaction.subscription_id,
                }),
            })
            .await?;
        Ok(EventOutcome::Credited(result))
    }

    async fn payment_failed(&self, transaction: &ProviderTransaction) -> Result<EventOutcome> {
        let Some(user_id) = self
            .resolve_user(transaction.user_id, transaction.customer_id.as_deref())
            .await?
        else {
            return Ok(EventOutcome::Ignored(format!(
                "transaction {} has no known user",
                transaction.id
            )));
        };

        warn!(
            user_id = %user_id,
            transaction_id = %transaction.id,
            subscription_id = ?transaction.subscription_id,
            "Payment failed"
        );

        let cached = self.credits.balance(&user_id)?.subscription;
        let Some(mut snapshot) = cached.filter(|s| {
            transaction.subscription_id.as_deref() == Some(s.subscription_id.as_str())
        }) else {
            return Ok(EventOutcome::Ignored(
                "failed charge is not for the cached subscription".into(),
            ));
        };
        if snapshot.status == SubscriptionStatus::PastDue {
            return Ok(EventOutcome::Ignored("already past due".into()));
        }

        snapshot.status = SubscriptionStatus::PastDue;
        self.credits
            .update_subscription(&user_id, Some(snapshot))
            .await?;
        Ok(EventOutcome::SubscriptionUpdated)
    }
}
