//! Credit balance, subscription and transaction handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditline_core::{
    Direction, EntryType, LedgerEntry, LedgerQuery, LedgerSummary, SubscriptionSnapshot,
    UserBalance, UserId, DEFAULT_PAGE_SIZE,
};
use creditline_engine::SweepOutcome;

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// How the balance read was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No sweep was needed (or no provider is configured).
    Skipped,
    /// The sweep ran and the balance is verified.
    Synced,
    /// The provider was unreachable; the balance is the cached one.
    Degraded,
    /// The sweep failed on storage; the balance is the cached one.
    Failed,
}

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable credits.
    pub credits: i64,
    /// Current plan.
    pub plan: String,
    /// Whether the subscription is active or trialing.
    pub has_active_subscription: bool,
    /// Last successful reconciliation.
    pub balance_verified_at: Option<DateTime<Utc>>,
    /// What reconciliation did on this read.
    pub sync: SyncStatus,
}

impl BalanceResponse {
    fn new(balance: &UserBalance, sync: SyncStatus) -> Self {
        Self {
            user_id: balance.user_id.to_string(),
            credits: balance.credits,
            plan: balance.current_plan().as_str().to_string(),
            has_active_subscription: balance.has_active_subscription(),
            balance_verified_at: balance.balance_verified_at,
            sync,
        }
    }
}

/// Get current credit balance.
///
/// Reconciles against the billing provider and grants any monthly credits
/// that are due before reading. Both steps are best-effort: a failure is
/// logged and the cached balance is returned.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let now = Utc::now();

    let sync = match state
        .reconciler
        .sweep(&auth.user_id, auth.email.as_deref(), now)
        .await
    {
        Ok(SweepOutcome::Skipped) => SyncStatus::Skipped,
        Ok(SweepOutcome::Synced(report)) => {
            tracing::info!(
                user_id = %auth.user_id,
                customer_id = %report.customer_id,
                replayed = report.replayed.len(),
                already_recorded = report.already_recorded,
                rebuilt = report.rebuilt.is_some(),
                "Balance reconciled"
            );
            SyncStatus::Synced
        }
        Ok(SweepOutcome::Degraded(_)) => SyncStatus::Degraded,
        Err(e) => {
            tracing::warn!(user_id = %auth.user_id, error = %e, "Reconciliation failed");
            SyncStatus::Failed
        }
    };

    match state.credits.process_monthly_credits(&auth.user_id, now).await {
        Ok(granted) if !granted.is_empty() => {
            tracing::info!(user_id = %auth.user_id, months = granted.len(), "Monthly credits granted");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(user_id = %auth.user_id, error = %e, "Monthly credit check failed");
        }
    }

    let balance = state.credits.balance(&auth.user_id)?;
    Ok(Json(BalanceResponse::new(&balance, sync)))
}

/// Get a user's cached balance (job executors pre-checking a job).
pub async fn get_user_balance(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id: UserId = user_id.parse()?;
    let balance = state.credits.balance(&user_id)?;
    Ok(Json(BalanceResponse::new(&balance, SyncStatus::Skipped)))
}

/// Subscription response.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Current plan (`free` without a subscription).
    pub plan: String,
    /// Whether the subscription is active or trialing.
    pub has_active_subscription: bool,
    /// Cached subscription snapshot.
    pub subscription: Option<SubscriptionSnapshot>,
}

/// Get the cached subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let balance = state.credits.balance(&auth.user_id)?;
    Ok(Json(SubscriptionResponse {
        plan: balance.current_plan().as_str().to_string(),
        has_active_subscription: balance.has_active_subscription(),
        subscription: balance.subscription,
    }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Entry type filter.
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    /// Entries created at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Entries created before this instant.
    pub to: Option<DateTime<Utc>>,
    /// `credit` or `debit`.
    pub direction: Option<Direction>,
    /// Description substring.
    pub search: Option<String>,
    /// Maximum number of transactions to return (default: 50, max: 200).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl TryFrom<ListTransactionsQuery> for LedgerQuery {
    type Error = ApiError;

    fn try_from(query: ListTransactionsQuery) -> Result<Self, Self::Error> {
        let entry_type = query
            .entry_type
            .as_deref()
            .map(str::parse::<EntryType>)
            .transpose()
            .map_err(ApiError::BadRequest)?;

        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(ApiError::BadRequest("`from` must not be after `to`".into()));
            }
        }

        Ok(Self {
            entry_type,
            from: query.from,
            to: query.to,
            direction: query.direction,
            search: query.search,
            limit: query.limit,
            offset: query.offset,
        })
    }
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction reference.
    pub id: String,
    /// Signed amount (positive = credit, negative = debit).
    pub amount: i64,
    /// Entry type.
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Entry status.
    pub status: creditline_core::EntryStatus,
    /// Description.
    pub description: String,
    /// Compensated entry or provider transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_transaction_ref: Option<String>,
    /// Timestamp.
    pub created_at: String,
}

impl From<&LedgerEntry> for TransactionResponse {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.transaction_ref.to_string(),
            amount: entry.amount,
            entry_type: entry.entry_type,
            balance_after: entry.balance_after,
            status: entry.status,
            description: entry.description.clone(),
            related_transaction_ref: entry.related_transaction_ref.clone(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Matching transactions across all pages.
    pub total: usize,
    /// Whether there are more transactions.
    pub has_more: bool,
    /// Totals over every matching transaction.
    pub summary: LedgerSummary,
}

/// List transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let query = LedgerQuery::try_from(query)?;
    let page = state.credits.history(&auth.user_id, &query)?;

    Ok(Json(ListTransactionsResponse {
        transactions: page.entries.iter().map(TransactionResponse::from).collect(),
        total: page.total,
        has_more: page.has_more,
        summary: page.summary,
    }))
}
