//! Paddle API and webhook payload types.
//!
//! Only the fields the credit engine reads are modelled; everything else in
//! Paddle's payloads is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditline_core::{PriceLine, SubscriptionStatus, UserId};
use creditline_engine::{
    BillingEvent, ProviderSubscription, ProviderTransaction, ProviderTransactionStatus,
    SubscriptionEventKind,
};

/// List response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddleList<T> {
    /// Items on this page.
    pub data: Vec<T>,
}

/// Single entity response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddleEntity<T> {
    /// The entity.
    pub data: T,
}

/// Paddle error response.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddleErrorResponse {
    /// Error details.
    pub error: PaddleErrorBody,
}

/// Paddle error details.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddleErrorBody {
    /// Error category (`request_error`, `api_error`).
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable code.
    pub code: String,
    /// Human-readable detail.
    pub detail: String,
}

/// Free-form custom data attached at checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomData {
    /// Our user id, as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn user_id_of(custom_data: Option<&CustomData>) -> Option<UserId> {
    let raw = custom_data?.user_id.as_deref()?;
    match raw.parse() {
        Ok(user_id) => Some(user_id),
        Err(_) => {
            tracing::warn!(user_id = %raw, "Ignoring malformed user_id in Paddle custom_data");
            None
        }
    }
}

/// A Paddle customer.
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    /// Customer id (`ctm_...`).
    pub id: String,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Custom data.
    #[serde(default)]
    pub custom_data: Option<CustomData>,
}

/// Body of a create-customer request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCustomer<'a> {
    /// Email address (required by Paddle).
    pub email: &'a str,
    /// Custom data.
    pub custom_data: CustomData,
}

/// Price reference inside an item.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    /// Price id (`pri_...`).
    pub id: String,
}

/// A subscription or transaction line.
#[derive(Debug, Clone, Deserialize)]
pub struct Item {
    /// The price.
    pub price: PriceRef,
    /// Units.
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

fn price_lines(items: Vec<Item>) -> Vec<PriceLine> {
    items
        .into_iter()
        .map(|item| PriceLine {
            price_id: item.price.id,
            quantity: item.quantity,
        })
        .collect()
}

/// Current billing period of a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingPeriod {
    /// Period start.
    pub starts_at: DateTime<Utc>,
    /// Period end.
    pub ends_at: DateTime<Utc>,
}

/// A change Paddle will apply at period end.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledChange {
    /// `cancel`, `pause` or `resume`.
    pub action: String,
}

/// A Paddle subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    /// Subscription id (`sub_...`).
    pub id: String,
    /// Status.
    pub status: SubscriptionStatus,
    /// Customer id.
    pub customer_id: String,
    /// Purchased items.
    #[serde(default)]
    pub items: Vec<Item>,
    /// Current billing period.
    #[serde(default)]
    pub current_billing_period: Option<BillingPeriod>,
    /// Pending change.
    #[serde(default)]
    pub scheduled_change: Option<ScheduledChange>,
    /// Next charge.
    #[serde(default)]
    pub next_billed_at: Option<DateTime<Utc>>,
    /// Custom data.
    #[serde(default)]
    pub custom_data: Option<CustomData>,
}

impl From<Subscription> for ProviderSubscription {
    fn from(sub: Subscription) -> Self {
        let user_id = user_id_of(sub.custom_data.as_ref());
        Self {
            id: sub.id,
            customer_id: sub.customer_id,
            status: sub.status,
            items: price_lines(sub.items),
            current_period_start: sub.current_billing_period.as_ref().map(|p| p.starts_at),
            current_period_end: sub.current_billing_period.as_ref().map(|p| p.ends_at),
            cancel_at_period_end: sub
                .scheduled_change
                .as_ref()
                .is_some_and(|c| c.action == "cancel"),
            next_billed_at: sub.next_billed_at,
            user_id,
        }
    }
}

/// A Paddle transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    /// Transaction id (`txn_...`).
    pub id: String,
    /// Status.
    pub status: ProviderTransactionStatus,
    /// Customer id.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Subscription id, for subscription charges.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// What created the transaction (`web`, `subscription_recurring`, ...).
    #[serde(default)]
    pub origin: Option<String>,
    /// Purchased items.
    #[serde(default)]
    pub items: Vec<Item>,
    /// When it was billed.
    #[serde(default)]
    pub billed_at: Option<DateTime<Utc>>,
    /// Custom data.
    #[serde(default)]
    pub custom_data: Option<CustomData>,
}

impl From<Transaction> for ProviderTransaction {
    fn from(txn: Transaction) -> Self {
        let user_id = user_id_of(txn.custom_data.as_ref());
        Self {
            id: txn.id,
            customer_id: txn.customer_id,
            subscription_id: txn.subscription_id,
            status: txn.status,
            renewal: txn.origin.as_deref() == Some("subscription_recurring"),
            items: price_lines(txn.items),
            billed_at: txn.billed_at,
            user_id,
        }
    }
}

/// A webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Notification event id (`evt_...`).
    pub event_id: String,
    /// Event type, e.g. `transaction.completed`.
    pub event_type: String,
    /// When the event happened.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Entity payload.
    pub data: serde_json::Value,
}

impl WebhookEnvelope {
    /// Decode into a billing event. Returns `None` for event types the
    /// engine does not act on.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the event type.
    pub fn into_event(self) -> Result<Option<BillingEvent>, serde_json::Error> {
        let kind = match self.event_type.as_str() {
            "subscription.created" => Some(SubscriptionEventKind::Created),
            "subscription.updated"
            | "subscription.activated"
            | "subscription.trialing"
            | "subscription.past_due" => Some(SubscriptionEventKind::Updated),
            "subscription.canceled" => Some(SubscriptionEventKind::Canceled),
            "subscription.paused" => Some(SubscriptionEventKind::Paused),
            "subscription.resumed" => Some(SubscriptionEventKind::Resumed),
            _ => None,
        };
        if let Some(kind) = kind {
            let subscription: Subscription = serde_json::from_value(self.data)?;
            return Ok(Some(BillingEvent::Subscription {
                kind,
                subscription: subscription.into(),
            }));
        }

        match self.event_type.as_str() {
            "transaction.completed" => {
                let txn: Transaction = serde_json::from_value(self.data)?;
                Ok(Some(BillingEvent::TransactionCompleted(txn.into())))
            }
            "transaction.payment_failed" => {
                let txn: Transaction = serde_json::from_value(self.data)?;
                Ok(Some(BillingEvent::TransactionPaymentFailed(txn.into())))
            }
            _ => Ok(None),
        }
    }
}
