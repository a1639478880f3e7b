//! Payment Processor Integration
//!
//! The single outbound call of a batch run: create and confirm one payment
//! intent for a campaign group.

mod mock;

pub use mock::{MockPaymentProcessor, MockResponse};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregator::CampaignChargeGroup;
use crate::error::Result;
use crate::model::{BillingReason, Customer, PaymentMethod, CURRENCY};

/// "Create and confirm" request for one campaign group
///
/// Always off-session and confirmed immediately; the processor is told to
/// fail rather than ask for customer action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentRequest {
    pub fn for_group(
        group: &CampaignChargeGroup,
        customer: &Customer,
        method: &PaymentMethod,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".into(), group.user_id.to_string());
        metadata.insert("campaign_id".into(), group.campaign_id.to_string());
        metadata.insert("billing_reason".into(), BillingReason::NewMoverAddition.as_str().into());
        metadata.insert("new_mover_count".into(), group.total_new_movers().to_string());
        metadata.insert("is_test_mode".into(), group.is_test_mode().to_string());
        metadata.insert("charge_count".into(), group.charges.len().to_string());

        Self {
            amount_cents: group.total_amount_cents(),
            currency: CURRENCY.into(),
            customer_id: customer.stripe_customer_id.clone(),
            payment_method_id: method.stripe_payment_method_id.clone(),
            idempotency_key: group.idempotency_key(),
            metadata,
        }
    }
}

/// Processor-reported payment intent status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresCapture,
    Canceled,
    Other(String),
}

impl IntentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Processing => "processing",
            Self::RequiresAction => "requires_action",
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Other(s) => s,
        }
    }
}

/// Synchronous result of a confirmed payment intent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentResult {
    pub id: String,
    pub status: IntentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,

    /// Response metadata echoed into the transaction
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PaymentIntentResult {
    pub fn new(id: impl Into<String>, status: IntentStatus) -> Self {
        Self {
            id: id.into(),
            status,
            charge_id: None,
            receipt_url: None,
            error_code: None,
            error_message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_error(mut self, code: Option<String>, message: Option<String>) -> Self {
        self.error_code = code;
        self.error_message = message;
        self
    }
}

/// Payment processor trait (Strategy pattern)
///
/// Implemented by the Stripe adapter and by the scripted mock.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create and confirm a payment intent
    ///
    /// `Err` means no intent outcome is known (network, auth, unexpected).
    async fn create_and_confirm(&self, request: &PaymentRequest) -> Result<PaymentIntentResult>;

    /// Processor name
    fn name(&self) -> &str;
}
