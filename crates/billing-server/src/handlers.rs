//! HTTP Handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use billing_core::{BillingError, PendingCharge, RunResponse};
use billing_payments::{PaymentError, PostcardProjector, WebhookHandler, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
    pub store: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Pending charge written by recipient import
#[derive(Debug, Deserialize)]
pub struct EnqueueChargeRequest {
    pub campaign_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub new_mover_count: i64,
    #[serde(default)]
    pub scheduled_for: Option<NaiveDate>,
    #[serde(default)]
    pub is_test_mode: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueChargeResponse {
    pub id: Uuid,
    pub scheduled_for: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: serde_json::Value,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.stripe.is_some(),
        store: state.store.name().to_string(),
    })
}

/// Run the batch now
pub async fn run_billing(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    authorize(&state, &headers)?;

    let result = state.engine.run().await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(BillingError::RunInProgress) => StatusCode::CONFLICT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    Ok((status, Json(RunResponse::from(&result))))
}

/// Append a pending charge to the ledger
pub async fn enqueue_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EnqueueChargeRequest>,
) -> Result<(StatusCode, Json<EnqueueChargeResponse>), ApiError> {
    authorize(&state, &headers)?;

    if payload.amount_cents < 0 {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "INVALID_AMOUNT",
            "amount_cents must not be negative",
        ));
    }

    let scheduled_for = payload.scheduled_for.unwrap_or_else(|| Utc::now().date_naive());
    let mut charge = PendingCharge::new(
        payload.campaign_id,
        payload.user_id,
        payload.amount_cents,
        payload.new_mover_count,
        scheduled_for,
    )
    .with_test_mode(payload.is_test_mode);
    if let Some(metadata) = payload.metadata {
        charge.metadata = metadata;
    }

    state.store.enqueue_charge(&charge).await.map_err(|e| {
        tracing::error!(error = %e, campaign_id = %charge.campaign_id, "Failed to enqueue charge");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.user_message())
    })?;

    tracing::debug!(
        charge_id = %charge.id,
        campaign_id = %charge.campaign_id,
        amount_cents = charge.amount_cents,
        "Pending charge enqueued"
    );

    Ok((
        StatusCode::CREATED,
        Json(EnqueueChargeResponse {
            id: charge.id,
            scheduled_for,
        }),
    ))
}

/// Stripe webhook endpoint
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let stripe = state.stripe.as_ref().ok_or_else(|| {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "PAYMENTS_DISABLED", "Payments not configured")
    })?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "MISSING_SIGNATURE", "Missing Stripe signature"))?;

    let handler = WebhookHandler::new(state.store.clone());

    let event = handler
        .parse_event(&body, signature, stripe.webhook_secret())
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook signature failed");
            api_error(StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", "Invalid signature")
        })?;

    let outcome = handler.handle(event).await.map_err(webhook_failure)?;

    Ok(Json(WebhookAck {
        received: true,
        outcome: serde_json::to_value(&outcome).unwrap_or_default(),
    }))
}

/// Print-mail provider webhook endpoint
pub async fn postcard_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let verifier = state.postcards.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "POSTCARD_WEBHOOKS_DISABLED",
            "Print-mail webhooks not configured",
        )
    })?;

    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(signature), Some(timestamp)) = (header_value(SIGNATURE_HEADER), header_value(TIMESTAMP_HEADER))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "MISSING_SIGNATURE",
            "Missing print-mail signature",
        ));
    };

    let now = Utc::now();
    verifier.verify(&body, timestamp, signature, now).map_err(|e| {
        tracing::warn!(error = %e, "Print-mail webhook signature failed");
        api_error(StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", "Invalid signature")
    })?;

    let Some(event) = verifier.parse_event(&body, now).map_err(webhook_failure)? else {
        return Ok(Json(WebhookAck {
            received: true,
            outcome: serde_json::json!({ "result": "ignored" }),
        }));
    };

    let projection = PostcardProjector::new(state.store.clone())
        .project(&event)
        .await
        .map_err(webhook_failure)?;

    Ok(Json(WebhookAck {
        received: true,
        outcome: serde_json::to_value(&projection).unwrap_or_default(),
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = state.cron_secret.as_deref() else {
        return Ok(());
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if token == Some(secret) {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Missing or invalid bearer token"))
    }
}

fn webhook_failure(err: PaymentError) -> ApiError {
    if err.is_rejection() {
        tracing::warn!(error = %err, "Webhook payload rejected");
        api_error(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", err.user_message())
    } else {
        tracing::error!(error = %err, "Webhook processing error");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "WEBHOOK_ERROR", "Webhook processing failed")
    }
}
