//! Mock Payment Processor
//!
//! Scripted responses per customer, for tests and local runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IntentStatus, PaymentIntentResult, PaymentProcessor, PaymentRequest};
use crate::error::{BillingError, Result};

/// Scripted outcome for a customer
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return an intent in this status
    Status(IntentStatus),

    /// Return a failed intent carrying the processor's error
    Decline { code: String, message: String },

    /// Fail the call itself
    Error(String),

    /// Answer after a delay
    Delay(Duration, IntentStatus),
}

/// Mock processor; succeeds unless told otherwise
#[derive(Default)]
pub struct MockPaymentProcessor {
    responses: RwLock<HashMap<String, MockResponse>>,
    requests: RwLock<Vec<PaymentRequest>>,
}

impl MockPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for a processor customer id
    pub async fn respond_for(&self, customer_id: impl Into<String>, response: MockResponse) {
        self.responses.write().await.insert(customer_id.into(), response);
    }

    /// Every request received so far
    pub async fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.read().await.clone()
    }

    fn intent(request: &PaymentRequest, status: IntentStatus) -> PaymentIntentResult {
        let suffix = &request.idempotency_key[request.idempotency_key.len().saturating_sub(12)..];
        let mut result = PaymentIntentResult::new(format!("pi_mock_{suffix}"), status.clone());
        if status == IntentStatus::Succeeded {
            result.charge_id = Some(format!("ch_mock_{suffix}"));
            result.receipt_url = Some(format!("https://pay.example.test/receipts/{suffix}"));
        }
        result.metadata = serde_json::to_value(&request.metadata).unwrap_or_default();
        result
    }
}

#[async_trait]
impl PaymentProcessor for MockPaymentProcessor {
    async fn create_and_confirm(&self, request: &PaymentRequest) -> Result<PaymentIntentResult> {
        self.requests.write().await.push(request.clone());

        let response = self
            .responses
            .read()
            .await
            .get(&request.customer_id)
            .cloned()
            .unwrap_or(MockResponse::Status(IntentStatus::Succeeded));

        match response {
            MockResponse::Status(status) => Ok(Self::intent(request, status)),
            MockResponse::Decline { code, message } => Ok(
                Self::intent(request, IntentStatus::RequiresPaymentMethod)
                    .with_error(Some(code), Some(message)),
            ),
            MockResponse::Error(message) => Err(BillingError::Processor(message)),
            MockResponse::Delay(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(Self::intent(request, status))
            }
        }
    }

    fn name(&self) -> &str {
        "MockProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(customer: &str) -> PaymentRequest {
        PaymentRequest {
            amount_cents: 800,
            currency: "usd".into(),
            customer_id: customer.into(),
            payment_method_id: "pm_1".into(),
            idempotency_key: "batch-abc-0123456789abcdef".into(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_defaults_to_success() {
        let processor = MockPaymentProcessor::new();
        let result = processor.create_and_confirm(&request("cus_1")).await.unwrap();
        assert_eq!(result.status, IntentStatus::Succeeded);
        assert!(result.charge_id.is_some());
        assert_eq!(processor.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let processor = MockPaymentProcessor::new();
        processor
            .respond_for("cus_down", MockResponse::Error("connection reset".into()))
            .await;

        let result = processor.create_and_confirm(&request("cus_down")).await;
        assert!(matches!(result, Err(BillingError::Processor(_))));
    }
}
