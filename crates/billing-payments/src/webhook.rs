//! Stripe Webhook Handling
//!
//! Projects late payment outcomes onto recorded transactions as
//! append-only events.

use std::sync::Arc;

use billing_core::{BillingStore, TransactionEvent, TransactionEventKind};
use serde::Serialize;
use stripe::{Event, EventObject, EventType, Expandable, Webhook};
use uuid::Uuid;

use crate::error::{PaymentError, Result};

/// Payment fact extracted from a Stripe event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentNotification {
    IntentSucceeded {
        event_id: String,
        payment_intent_id: String,
        amount_cents: i64,
    },

    IntentFailed {
        event_id: String,
        payment_intent_id: String,
        amount_cents: i64,
        failure_code: Option<String>,
        failure_message: Option<String>,
    },

    /// Refund against a charge; the intent is missing for charges created
    /// outside payment intents
    ChargeRefunded {
        event_id: String,
        payment_intent_id: Option<String>,
        amount_refunded: i64,
    },

    /// Unhandled event type
    Other { event_type: String },
}

impl PaymentNotification {
    fn into_event(self) -> Option<TransactionEvent> {
        match self {
            Self::IntentSucceeded {
                event_id,
                payment_intent_id,
                amount_cents,
            } => {
                let mut event =
                    TransactionEvent::new(event_id, payment_intent_id, TransactionEventKind::IntentSucceeded);
                event.amount_cents = Some(amount_cents);
                Some(event)
            }
            Self::IntentFailed {
                event_id,
                payment_intent_id,
                amount_cents,
                failure_code,
                failure_message,
            } => {
                let mut event =
                    TransactionEvent::new(event_id, payment_intent_id, TransactionEventKind::IntentFailed);
                event.amount_cents = Some(amount_cents);
                event.failure_code = failure_code;
                event.failure_message = failure_message;
                Some(event)
            }
            Self::ChargeRefunded {
                event_id,
                payment_intent_id: Some(payment_intent_id),
                amount_refunded,
            } => {
                let mut event =
                    TransactionEvent::new(event_id, payment_intent_id, TransactionEventKind::ChargeRefunded);
                event.amount_cents = Some(amount_refunded);
                Some(event)
            }
            Self::ChargeRefunded { payment_intent_id: None, .. } | Self::Other { .. } => None,
        }
    }
}

/// What the handler did with an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Recorded {
        kind: TransactionEventKind,
        transaction_id: Option<Uuid>,
    },
    Duplicate,
    Ignored { reason: String },
}

/// Webhook handler
pub struct WebhookHandler<S: BillingStore + ?Sized> {
    store: Arc<S>,
}

impl<S: BillingStore + ?Sized> WebhookHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Verify webhook signature and parse event
    pub fn parse_event(&self, payload: &str, signature: &str, secret: &str) -> Result<Event> {
        Webhook::construct_event(payload, signature, secret)
            .map_err(|e| PaymentError::WebhookSignature(e.to_string()))
    }

    /// Process a verified Stripe event
    pub async fn handle(&self, event: Event) -> Result<WebhookOutcome> {
        tracing::info!(event_id = %event.id, event_type = ?event.type_, "Processing Stripe webhook");

        let notification = parse_notification(&event)?;
        self.apply(notification).await
    }

    /// Append the payment event and link it to its transaction
    pub async fn apply(&self, notification: PaymentNotification) -> Result<WebhookOutcome> {
        if let PaymentNotification::Other { event_type } = &notification {
            tracing::debug!(event_type = %event_type, "Unhandled webhook event");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("unhandled event type {event_type}"),
            });
        }

        let Some(mut event) = notification.into_event() else {
            tracing::debug!("Refund without payment intent; not a batch charge");
            return Ok(WebhookOutcome::Ignored {
                reason: "no payment intent".into(),
            });
        };

        let transaction = self.store.find_transaction_by_intent(&event.payment_intent_id).await?;
        event.transaction_id = transaction.as_ref().map(|t| t.id);

        if transaction.is_none() {
            tracing::warn!(
                payment_intent_id = %event.payment_intent_id,
                kind = event.kind.as_str(),
                "Payment event for unknown intent"
            );
        }

        if !self.store.record_transaction_event(&event).await? {
            tracing::debug!(provider_event_id = %event.provider_event_id, "Duplicate webhook event");
            return Ok(WebhookOutcome::Duplicate);
        }

        match event.kind {
            TransactionEventKind::IntentFailed => tracing::warn!(
                payment_intent_id = %event.payment_intent_id,
                transaction_id = ?event.transaction_id,
                failure_code = ?event.failure_code,
                "Payment intent failed after batch run"
            ),
            TransactionEventKind::ChargeRefunded => tracing::info!(
                payment_intent_id = %event.payment_intent_id,
                transaction_id = ?event.transaction_id,
                amount_cents = ?event.amount_cents,
                "Charge refunded"
            ),
            TransactionEventKind::IntentSucceeded => tracing::info!(
                payment_intent_id = %event.payment_intent_id,
                transaction_id = ?event.transaction_id,
                "Payment intent succeeded"
            ),
        }

        Ok(WebhookOutcome::Recorded {
            kind: event.kind,
            transaction_id: event.transaction_id,
        })
    }
}

/// Parse Stripe event into our notification type
fn parse_notification(event: &Event) -> Result<PaymentNotification> {
    let event_id = event.id.to_string();

    match event.type_ {
        EventType::PaymentIntentSucceeded => {
            if let EventObject::PaymentIntent(intent) = &event.data.object {
                Ok(PaymentNotification::IntentSucceeded {
                    event_id,
                    payment_intent_id: intent.id.to_string(),
                    amount_cents: intent.amount,
                })
            } else {
                Err(PaymentError::WebhookParse("Invalid payment intent data".into()))
            }
        }

        EventType::PaymentIntentPaymentFailed => {
            if let EventObject::PaymentIntent(intent) = &event.data.object {
                let error = intent.last_payment_error.as_ref();
                Ok(PaymentNotification::IntentFailed {
                    event_id,
                    payment_intent_id: intent.id.to_string(),
                    amount_cents: intent.amount,
                    failure_code: error.and_then(|e| {
                        e.decline_code.clone().or_else(|| e.code.map(|c| c.to_string()))
                    }),
                    failure_message: error.and_then(|e| e.message.clone()),
                })
            } else {
                Err(PaymentError::WebhookParse("Invalid payment intent data".into()))
            }
        }

        EventType::ChargeRefunded => {
            if let EventObject::Charge(charge) = &event.data.object {
                let payment_intent_id = match &charge.payment_intent {
                    Some(Expandable::Id(id)) => Some(id.to_string()),
                    Some(Expandable::Object(intent)) => Some(intent.id.to_string()),
                    None => None,
                };
                Ok(PaymentNotification::ChargeRefunded {
                    event_id,
                    payment_intent_id,
                    amount_refunded: charge.amount_refunded,
                })
            } else {
                Err(PaymentError::WebhookParse("Invalid charge data".into()))
            }
        }

        _ => Ok(PaymentNotification::Other {
            event_type: format!("{:?}", event.type_),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::{
        BillingConfig, BillingEngine, Campaign, Customer, MemoryBillingStore, MockPaymentProcessor,
        PaymentMethod, PendingCharge,
    };
    use chrono::Utc;

    /// Store holding one succeeded batch transaction; returns its intent id
    async fn billed_store() -> (Arc<MemoryBillingStore>, String) {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let campaign = Campaign::new(user_id, "Movers");
        let campaign_id = campaign.id;
        store.insert_campaign(campaign).await;
        store
            .insert_customer(Customer {
                user_id,
                stripe_customer_id: "cus_1".into(),
            })
            .await;
        store
            .insert_payment_method(PaymentMethod {
                stripe_payment_method_id: "pm_1".into(),
                stripe_customer_id: "cus_1".into(),
                is_default: true,
                last4: Some("4242".into()),
                brand: Some("visa".into()),
            })
            .await;
        let today = Utc::now().date_naive();
        store
            .enqueue_charge(&PendingCharge::new(campaign_id, user_id, 500, 2, today))
            .await
            .unwrap();

        let engine = BillingEngine::new(
            store.clone(),
            Arc::new(MockPaymentProcessor::new()),
            BillingConfig::default(),
        );
        engine.run().await.unwrap();

        let intent_id = store.transactions().await[0].payment_intent_id.clone();
        (store, intent_id)
    }

    #[test]
    fn test_webhook_handler_creation() {
        let store = Arc::new(MemoryBillingStore::new());
        let _handler = WebhookHandler::new(store);
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let handler = WebhookHandler::new(Arc::new(MemoryBillingStore::new()));
        let result = handler.parse_event(r#"{"id":"evt_1"}"#, "t=1,v1=deadbeef", "whsec_test");
        assert!(matches!(result, Err(PaymentError::WebhookSignature(_))));
    }

    #[tokio::test]
    async fn test_refund_links_to_transaction() {
        let (store, intent_id) = billed_store().await;
        let handler = WebhookHandler::new(store.clone());

        let outcome = handler
            .apply(PaymentNotification::ChargeRefunded {
                event_id: "evt_refund".into(),
                payment_intent_id: Some(intent_id.clone()),
                amount_refunded: 500,
            })
            .await
            .unwrap();

        let tx = store.transactions().await[0].clone();
        assert_eq!(
            outcome,
            WebhookOutcome::Recorded {
                kind: TransactionEventKind::ChargeRefunded,
                transaction_id: Some(tx.id),
            }
        );

        let events = store.transaction_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount_cents, Some(500));

        // Transaction itself is untouched
        assert_eq!(tx.status, billing_core::TransactionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_ignored() {
        let (store, intent_id) = billed_store().await;
        let handler = WebhookHandler::new(store.clone());
        let notification = PaymentNotification::IntentFailed {
            event_id: "evt_dup".into(),
            payment_intent_id: intent_id,
            amount_cents: 500,
            failure_code: Some("card_declined".into()),
            failure_message: None,
        };

        handler.apply(notification.clone()).await.unwrap();
        let second = handler.apply(notification).await.unwrap();

        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(store.transaction_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_intent_is_recorded_unlinked() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = WebhookHandler::new(store.clone());

        let outcome = handler
            .apply(PaymentNotification::IntentSucceeded {
                event_id: "evt_1".into(),
                payment_intent_id: "pi_elsewhere".into(),
                amount_cents: 100,
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Recorded {
                kind: TransactionEventKind::IntentSucceeded,
                transaction_id: None,
            }
        );
    }

    #[tokio::test]
    async fn test_other_events_are_acknowledged() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = WebhookHandler::new(store.clone());

        let outcome = handler
            .apply(PaymentNotification::Other {
                event_type: "CustomerCreated".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        let outcome = handler
            .apply(PaymentNotification::ChargeRefunded {
                event_id: "evt_2".into(),
                payment_intent_id: None,
                amount_refunded: 100,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert!(store.transaction_events().await.is_empty());
    }
}
