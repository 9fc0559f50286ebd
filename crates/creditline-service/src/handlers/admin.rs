//! Admin handlers.
//!
//! Every call is logged with the admin id from `X-Admin-Id`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{EntrySource, EntryType, TransactionRef, UserId};
use creditline_engine::{BalanceCheck, CreditGrant, CreditResult};

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Manual credit grant.
#[derive(Debug, Deserialize)]
pub struct AddCreditsRequest {
    /// Recipient.
    pub user_id: String,
    /// Credits to add.
    pub amount: i64,
    /// Grant type (default `manual_adjustment`).
    #[serde(default)]
    pub entry_type: Option<EntryType>,
    /// Ledger description.
    pub description: String,
    /// Dedup token, so a retried admin call grants once.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Grant credits manually.
pub async fn add_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<AddCreditsRequest>,
) -> Result<Json<CreditResult>, ApiError> {
    let user_id: UserId = body.user_id.parse()?;

    tracing::info!(
        admin_id = %admin.admin_id,
        user_id = %user_id,
        amount = body.amount,
        "Admin adding credits"
    );

    let result = state
        .credits
        .add_credits(CreditGrant {
            user_id,
            amount: body.amount,
            entry_type: body.entry_type.unwrap_or(EntryType::ManualAdjustment),
            description: body.description,
            source: EntrySource::Admin,
            idempotency_key: body.idempotency_key,
            related_transaction_ref: None,
            metadata: serde_json::json!({ "admin_id": admin.admin_id }),
        })
        .await?;

    Ok(Json(result))
}

/// Reversal request.
#[derive(Debug, Deserialize)]
pub struct ReverseRequest {
    /// Entry to reverse.
    pub transaction_ref: String,
    /// Why; recorded in the rollback description.
    pub reason: String,
}

/// Reverse a ledger entry.
pub async fn reverse_transaction(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<ReverseRequest>,
) -> Result<Json<CreditResult>, ApiError> {
    let transaction_ref: TransactionRef = body.transaction_ref.parse()?;
    if body.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".into()));
    }

    tracing::info!(
        admin_id = %admin.admin_id,
        transaction_ref = %transaction_ref,
        reason = %body.reason,
        "Admin reversing transaction"
    );

    let description = format!("Reversal by {}: {}", admin.admin_id, body.reason.trim());
    let result = state
        .credits
        .reverse_transaction(&transaction_ref, &description)
        .await?;

    Ok(Json(result))
}

/// Compare a user's cached balance with the ledger.
pub async fn verify_balance(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceCheck>, ApiError> {
    let user_id: UserId = user_id.parse()?;
    let check = state.credits.verify_balance(&user_id)?;

    if !check.is_valid {
        tracing::warn!(
            admin_id = %admin.admin_id,
            user_id = %user_id,
            discrepancy = check.discrepancy,
            "Balance discrepancy found"
        );
    }

    Ok(Json(check))
}

/// Rebuild response.
#[derive(Debug, Serialize)]
pub struct RebuildResponse {
    /// User ID.
    pub user_id: String,
    /// Cached balance before the rebuild.
    pub previous: i64,
    /// Balance derived from the ledger.
    pub rebuilt: i64,
    /// Whether the cache was corrected.
    pub changed: bool,
}

/// Reset a user's cached balance to the ledger sum.
pub async fn rebuild_balance(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let user_id: UserId = user_id.parse()?;

    tracing::info!(admin_id = %admin.admin_id, user_id = %user_id, "Admin rebuilding balance");
    let rebuild = state.credits.rebuild_balance(&user_id).await?;

    Ok(Json(RebuildResponse {
        user_id: rebuild.user_id.to_string(),
        previous: rebuild.previous,
        rebuilt: rebuild.rebuilt,
        changed: rebuild.changed(),
    }))
}
