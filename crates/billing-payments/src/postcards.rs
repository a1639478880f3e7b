//! Print-Mail Provider Webhooks
//!
//! Signature: hex HMAC-SHA256 of `"{timestamp}.{body}"` with the shared
//! webhook secret, sent in [`SIGNATURE_HEADER`] next to the unix
//! [`TIMESTAMP_HEADER`].

use std::collections::HashMap;
use std::sync::Arc;

use billing_core::{BillingStore, PostcardEvent, PostcardLifecycle, PostcardProjection};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-print-mail-signature";
pub const TIMESTAMP_HEADER: &str = "x-print-mail-timestamp";

/// Maximum clock skew accepted between the provider and us
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Provider webhook body
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    id: String,
    event_type: EventTypeRef,
    #[serde(default)]
    date_created: Option<DateTime<Utc>>,
    body: PostcardBody,
}

#[derive(Debug, Deserialize)]
struct EventTypeRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PostcardBody {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Verifies and decodes print-mail webhooks
#[derive(Clone)]
pub struct PostcardWebhookVerifier {
    secret: String,
}

impl PostcardWebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Create from `PRINT_MAIL_WEBHOOK_SECRET`
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("PRINT_MAIL_WEBHOOK_SECRET")
            .map_err(|_| PaymentError::Config("PRINT_MAIL_WEBHOOK_SECRET not set".into()))?;
        Ok(Self::new(secret))
    }

    /// Check the signature and timestamp of a raw body
    pub fn verify(&self, payload: &[u8], timestamp: &str, signature: &str, now: DateTime<Utc>) -> Result<()> {
        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| PaymentError::WebhookSignature("invalid timestamp".into()))?;

        if (now.timestamp() - sent_at).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(PaymentError::WebhookSignature("timestamp outside tolerance".into()));
        }

        let expected = hex::decode(signature.trim())
            .map_err(|_| PaymentError::WebhookSignature("signature is not hex".into()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| PaymentError::Config(e.to_string()))?;
        mac.update(timestamp.trim().as_bytes());
        mac.update(b".");
        mac.update(payload);

        mac.verify_slice(&expected)
            .map_err(|_| PaymentError::WebhookSignature("signature mismatch".into()))
    }

    /// Decode a verified body; `None` for event types that carry no lifecycle
    pub fn parse_event(&self, payload: &[u8], received_at: DateTime<Utc>) -> Result<Option<PostcardEvent>> {
        let payload: WebhookPayload =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookParse(e.to_string()))?;

        let Some(lifecycle) = PostcardLifecycle::parse(&payload.event_type.id) else {
            tracing::debug!(event_type = %payload.event_type.id, "Unhandled print-mail event");
            return Ok(None);
        };

        let campaign_id = payload
            .body
            .metadata
            .get("campaign_id")
            .and_then(|raw| Uuid::parse_str(raw).ok());

        Ok(Some(PostcardEvent {
            event_id: payload.id,
            postcard_id: payload.body.id,
            campaign_id,
            lifecycle,
            occurred_at: payload.date_created.unwrap_or(received_at),
        }))
    }
}

/// Folds postcard lifecycle events into the store
pub struct PostcardProjector<S: BillingStore + ?Sized> {
    store: Arc<S>,
}

impl<S: BillingStore + ?Sized> PostcardProjector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn project(&self, event: &PostcardEvent) -> Result<PostcardProjection> {
        let projection = self.store.apply_postcard_event(event).await?;

        match &projection {
            PostcardProjection::Applied {
                status: PostcardLifecycle::Returned,
            } => tracing::warn!(
                postcard_id = %event.postcard_id,
                campaign_id = ?event.campaign_id,
                "Postcard returned to sender; refund candidate"
            ),
            PostcardProjection::Applied { status } => tracing::info!(
                postcard_id = %event.postcard_id,
                status = status.as_str(),
                "Postcard status updated"
            ),
            PostcardProjection::Ignored { status } => tracing::debug!(
                postcard_id = %event.postcard_id,
                current = status.as_str(),
                incoming = event.lifecycle.as_str(),
                "Stale postcard event ignored"
            ),
            PostcardProjection::Duplicate => tracing::debug!(
                event_id = %event.event_id,
                "Duplicate postcard event"
            ),
        }

        Ok(projection)
    }
}
