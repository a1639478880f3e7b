//! Stripe Payment Intents
//!
//! "Create and confirm" against a saved card, off-session.

use async_trait::async_trait;
use billing_core::settlement::synthetic_intent_id;
use billing_core::{IntentStatus, PaymentIntentResult, PaymentProcessor, PaymentRequest};
use chrono::{DateTime, Utc};
use stripe::{
    Client, CreatePaymentIntent, Currency, CustomerId, Expandable, PaymentIntent,
    PaymentIntentOffSession, PaymentMethodId, RequestStrategy, StripeError,
};

use crate::error::{PaymentError, Result};

/// HTTP status Stripe uses for card errors
const CARD_ERROR_STATUS: u16 = 402;

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    webhook_secret: String,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| PaymentError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| PaymentError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self::new(&secret_key, &webhook_secret))
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    /// Get the underlying Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn create_intent(&self, request: &PaymentRequest) -> Result<PaymentIntentResult> {
        let customer = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| PaymentError::Stripe(format!("invalid customer id: {e}")))?;
        let payment_method = request
            .payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| PaymentError::Stripe(format!("invalid payment method id: {e}")))?;

        let mut params = CreatePaymentIntent::new(request.amount_cents, currency(&request.currency)?);
        params.customer = Some(customer);
        params.payment_method = Some(payment_method);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.error_on_requires_action = Some(true);
        params.metadata = Some(
            request
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        params.expand = &["latest_charge"];

        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key.clone()));

        match PaymentIntent::create(&client, params).await {
            Ok(intent) => Ok(intent_result(&intent)),
            Err(StripeError::Stripe(err)) if err.http_status == CARD_ERROR_STATUS => {
                tracing::info!(
                    customer_id = %request.customer_id,
                    decline_code = ?err.decline_code,
                    "Card declined"
                );
                Ok(declined_result(
                    err.decline_code.clone(),
                    err.code.map(|c| c.to_string()),
                    err.message.clone(),
                    Utc::now(),
                ))
            }
            Err(e) => Err(PaymentError::Stripe(e.to_string())),
        }
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_and_confirm(&self, request: &PaymentRequest) -> billing_core::Result<PaymentIntentResult> {
        tracing::debug!(
            customer_id = %request.customer_id,
            amount_cents = request.amount_cents,
            idempotency_key = %request.idempotency_key,
            "Creating payment intent"
        );
        Ok(self.create_intent(request).await?)
    }

    fn name(&self) -> &str {
        "stripe"
    }
}

fn currency(code: &str) -> Result<Currency> {
    match code.to_ascii_lowercase().as_str() {
        "usd" => Ok(Currency::USD),
        other => Err(PaymentError::Config(format!("unsupported currency: {other}"))),
    }
}

/// Map a Stripe intent status string onto the processor-neutral status
fn intent_status(raw: &str) -> IntentStatus {
    match raw {
        "succeeded" => IntentStatus::Succeeded,
        "processing" => IntentStatus::Processing,
        "requires_action" => IntentStatus::RequiresAction,
        "requires_payment_method" => IntentStatus::RequiresPaymentMethod,
        "requires_confirmation" => IntentStatus::RequiresConfirmation,
        "requires_capture" => IntentStatus::RequiresCapture,
        "canceled" => IntentStatus::Canceled,
        other => IntentStatus::Other(other.to_string()),
    }
}

fn intent_result(intent: &PaymentIntent) -> PaymentIntentResult {
    let mut result = PaymentIntentResult::new(intent.id.to_string(), intent_status(intent.status.as_str()));

    match &intent.latest_charge {
        Some(Expandable::Id(id)) => result.charge_id = Some(id.to_string()),
        Some(Expandable::Object(charge)) => {
            result.charge_id = Some(charge.id.to_string());
            result.receipt_url = charge.receipt_url.clone();
        }
        None => {}
    }

    if let Some(error) = &intent.last_payment_error {
        let code = error
            .decline_code
            .clone()
            .or_else(|| error.code.map(|c| c.to_string()));
        result = result.with_error(code, error.message.clone());
    }

    result.metadata = serde_json::to_value(&intent.metadata).unwrap_or_default();
    result
}

/// A card error raised before Stripe returned an intent
fn declined_result(
    decline_code: Option<String>,
    code: Option<String>,
    message: Option<String>,
    now: DateTime<Utc>,
) -> PaymentIntentResult {
    let code = decline_code.or(code).unwrap_or_else(|| "card_declined".into());
    PaymentIntentResult::new(synthetic_intent_id(now), IntentStatus::RequiresPaymentMethod)
        .with_error(Some(code), message)
}
