//! Paddle webhook handler.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use creditline_engine::EventOutcome;

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::paddle::WebhookEnvelope;
use crate::state::AppState;

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// `credited`, `subscription_updated`, `ignored` or `unhandled`.
    pub outcome: &'static str,
    /// Why the event was ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Handle Paddle webhooks.
///
/// Errors from storage surface as 5xx so Paddle redelivers; everything the
/// engine decides to skip is acknowledged with 200.
pub async fn paddle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.paddle_webhook_secret {
        let signature = headers
            .get("paddle-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("Missing Paddle signature".into()))?;

        verify_signature(
            signature,
            &body,
            secret,
            state.config.webhook_tolerance_seconds,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            tracing::warn!(error = %e, "Invalid Paddle webhook signature");
            ApiError::BadRequest("Invalid webhook signature".into())
        })?;
    } else {
        // No webhook secret configured - skip verification (development mode)
        tracing::warn!("Paddle webhook secret not configured - skipping signature verification");
    }

    let envelope: WebhookEnvelope =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let event_id = envelope.event_id.clone();
    let event_type = envelope.event_type.clone();
    tracing::info!(event_type = %event_type, event_id = %event_id, "Received Paddle webhook");

    let event = match envelope.into_event() {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::debug!(event_type = %event_type, "Unhandled Paddle event");
            return Ok(Json(WebhookResponse {
                received: true,
                outcome: "unhandled",
                reason: None,
            }));
        }
        Err(e) => {
            tracing::warn!(event_id = %event_id, error = %e, "Malformed Paddle event payload");
            return Err(ApiError::BadRequest(format!("malformed {event_type} payload: {e}")));
        }
    };

    let response = match state.events.process(event).await? {
        EventOutcome::Credited(result) => {
            tracing::info!(
                event_id = %event_id,
                transaction_ref = %result.transaction_ref,
                amount = result.amount,
                replayed = result.replayed,
                "Webhook credits applied"
            );
            WebhookResponse {
                received: true,
                outcome: "credited",
                reason: None,
            }
        }
        EventOutcome::SubscriptionUpdated => WebhookResponse {
            received: true,
            outcome: "subscription_updated",
            reason: None,
        },
        EventOutcome::Ignored(reason) => WebhookResponse {
            received: true,
            outcome: "ignored",
            reason: Some(reason),
        },
    };

    Ok(Json(response))
}
