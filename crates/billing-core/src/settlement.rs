//! Settlement Planning
//!
//! Pure state machine from a resolved campaign group to the writes that
//! settle it. No I/O happens here; the engine hands the plan to the store.
//!
//! ```text
//!   customer? ──no──▶ CustomerNotFound ──▶ release (or settle when exhausted)
//!      │yes
//!   default method? ──no──▶ NoPaymentMethod ──▶ failed tx, charges settled
//!      │yes
//!   processor ──succeeded──▶ tx succeeded, charges settled, campaign += totals
//!             ──processing─▶ tx processing, charges settled
//!             ──other──────▶ tx failed (processor code/message), charges settled
//!             ──error──────▶ tx failed (failed_<ts>), charges settled
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::aggregator::CampaignChargeGroup;
use crate::model::{
    cents_to_dollars, BillingReason, CampaignDelta, ChargeUpdate, PaymentMethod, Transaction,
    TransactionStatus, CURRENCY,
};
use crate::processor::{IntentStatus, PaymentIntentResult};

/// Why a group was not billed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CustomerNotFound,
    NoPaymentMethod,
    ProcessorDeclined,
    ProcessorRequiresAction,
    ProcessorException,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerNotFound => "customer_not_found",
            Self::NoPaymentMethod => "no_payment_method",
            Self::ProcessorDeclined => "processor_declined",
            Self::ProcessorRequiresAction => "processor_requires_action",
            Self::ProcessorException => "processor_exception",
            Self::Internal => "internal",
        }
    }
}

/// Terminal state of one campaign group in a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Succeeded,
    /// Provisional success; a webhook settles the final state
    Processing,
    Failed { kind: FailureKind, message: String },
}

impl GroupStatus {
    /// Counts toward the batch's `succeeded` tally
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Processing)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub campaign_id: Uuid,
    pub status: GroupStatus,
}

impl GroupOutcome {
    pub fn failed(campaign_id: Uuid, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            campaign_id,
            status: GroupStatus::Failed {
                kind,
                message: message.into(),
            },
        }
    }
}

/// What the engine learned about a group before settling it
#[derive(Clone, Debug)]
pub enum Resolution<'a> {
    /// No billing customer; `exhausted` once the retry budget is spent
    CustomerNotFound { exhausted: bool },

    /// Customer exists but has no default instrument
    NoPaymentMethod,

    /// The processor answered with an intent
    Intent {
        method: &'a PaymentMethod,
        result: PaymentIntentResult,
    },

    /// The processor call itself failed
    ProcessorException {
        method: &'a PaymentMethod,
        message: String,
    },
}

/// Writes that settle one group
#[derive(Clone, Debug)]
pub struct SettlementPlan {
    pub transaction: Option<Transaction>,

    /// Empty when the charges are released for a later run
    pub charge_updates: Vec<ChargeUpdate>,

    /// Only present when money was collected
    pub campaign_delta: Option<CampaignDelta>,

    pub outcome: GroupOutcome,
}

impl SettlementPlan {
    /// Charges go back to the ledger untouched apart from their claim
    pub fn releases_charges(&self) -> bool {
        self.charge_updates.is_empty()
    }
}

/// Synthetic intent id for attempts that never reached an intent
pub fn synthetic_intent_id(now: DateTime<Utc>) -> String {
    format!("failed_{}", now.timestamp_millis())
}

/// Build the settlement plan for a resolved group
pub fn plan_settlement(
    group: &CampaignChargeGroup,
    resolution: Resolution<'_>,
    now: DateTime<Utc>,
) -> SettlementPlan {
    match resolution {
        Resolution::CustomerNotFound { exhausted } => {
            let message = format!("No billing customer for user {}", group.user_id);
            let charge_updates = if exhausted {
                settle_all(group, None, Some(error_note(FailureKind::CustomerNotFound, &message)), now)
            } else {
                Vec::new()
            };
            SettlementPlan {
                transaction: None,
                charge_updates,
                campaign_delta: None,
                outcome: GroupOutcome::failed(group.campaign_id, FailureKind::CustomerNotFound, message),
            }
        }

        Resolution::NoPaymentMethod => {
            let message = "Customer has no default payment method".to_string();
            let mut tx = base_transaction(group, synthetic_intent_id(now), TransactionStatus::Failed, now);
            tx.failure_code = Some(FailureKind::NoPaymentMethod.as_str().into());
            tx.failure_message = Some(message.clone());
            tx.metadata = json!({
                "charge_ids": group.charge_ids(),
                "error": message,
            });

            SettlementPlan {
                charge_updates: settle_all(
                    group,
                    None,
                    Some(error_note(FailureKind::NoPaymentMethod, &message)),
                    now,
                ),
                transaction: Some(tx),
                campaign_delta: None,
                outcome: GroupOutcome::failed(group.campaign_id, FailureKind::NoPaymentMethod, message),
            }
        }

        Resolution::Intent { method, result } => plan_intent(group, method, result, now),

        Resolution::ProcessorException { method, message } => {
            let mut tx = base_transaction(group, synthetic_intent_id(now), TransactionStatus::Failed, now);
            describe_method(&mut tx, method);
            tx.failure_code = Some(FailureKind::ProcessorException.as_str().into());
            tx.failure_message = Some(message.clone());
            tx.metadata = json!({
                "charge_ids": group.charge_ids(),
                "error": message,
            });

            SettlementPlan {
                charge_updates: settle_all(
                    group,
                    Some(tx.id),
                    Some(error_note(FailureKind::ProcessorException, &message)),
                    now,
                ),
                transaction: Some(tx),
                campaign_delta: None,
                outcome: GroupOutcome::failed(group.campaign_id, FailureKind::ProcessorException, message),
            }
        }
    }
}

fn plan_intent(
    group: &CampaignChargeGroup,
    method: &PaymentMethod,
    result: PaymentIntentResult,
    now: DateTime<Utc>,
) -> SettlementPlan {
    let status = match result.status {
        IntentStatus::Succeeded => TransactionStatus::Succeeded,
        IntentStatus::Processing => TransactionStatus::Processing,
        _ => TransactionStatus::Failed,
    };

    let mut tx = base_transaction(group, result.id.clone(), status, now);
    describe_method(&mut tx, method);
    tx.charge_id = result.charge_id.clone();
    tx.receipt_url = result.receipt_url.clone();

    match status {
        TransactionStatus::Succeeded | TransactionStatus::Processing => {
            tx.metadata = json!({
                "charge_ids": group.charge_ids(),
                "processor": result.metadata,
            });

            let (campaign_delta, group_status) = if status == TransactionStatus::Succeeded {
                let delta = CampaignDelta {
                    campaign_id: group.campaign_id,
                    cost: tx.amount_dollars,
                    postcards: tx.new_mover_count,
                };
                (Some(delta), GroupStatus::Succeeded)
            } else {
                (None, GroupStatus::Processing)
            };

            SettlementPlan {
                charge_updates: settle_all(group, Some(tx.id), None, now),
                transaction: Some(tx),
                campaign_delta,
                outcome: GroupOutcome {
                    campaign_id: group.campaign_id,
                    status: group_status,
                },
            }
        }
        TransactionStatus::Failed => {
            let kind = if result.status == IntentStatus::RequiresAction {
                FailureKind::ProcessorRequiresAction
            } else {
                FailureKind::ProcessorDeclined
            };
            let code = result
                .error_code
                .clone()
                .unwrap_or_else(|| result.status.as_str().to_string());
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Payment intent ended in status {}", result.status.as_str()));

            tx.failure_code = Some(code);
            tx.failure_message = Some(message.clone());
            tx.metadata = json!({
                "charge_ids": group.charge_ids(),
                "error": message,
                "intent_status": result.status.as_str(),
                "processor": result.metadata,
            });

            SettlementPlan {
                charge_updates: settle_all(group, Some(tx.id), Some(error_note(kind, &message)), now),
                transaction: Some(tx),
                campaign_delta: None,
                outcome: GroupOutcome::failed(group.campaign_id, kind, message),
            }
        }
    }
}

fn base_transaction(
    group: &CampaignChargeGroup,
    payment_intent_id: String,
    status: TransactionStatus,
    now: DateTime<Utc>,
) -> Transaction {
    let amount_cents = group.total_amount_cents();
    Transaction {
        id: Uuid::new_v4(),
        user_id: group.user_id,
        campaign_id: group.campaign_id,
        payment_intent_id,
        charge_id: None,
        amount_cents,
        amount_dollars: cents_to_dollars(amount_cents),
        currency: CURRENCY.into(),
        status,
        billing_reason: BillingReason::NewMoverAddition,
        new_mover_count: group.total_new_movers(),
        failure_code: None,
        failure_message: None,
        payment_method_last4: None,
        payment_method_brand: None,
        receipt_url: None,
        is_test_mode: group.is_test_mode(),
        metadata: serde_json::Value::Null,
        created_at: now,
    }
}

fn describe_method(tx: &mut Transaction, method: &PaymentMethod) {
    tx.payment_method_last4 = method.last4.clone();
    tx.payment_method_brand = method.brand.clone();
}

fn error_note(kind: FailureKind, message: &str) -> serde_json::Value {
    json!({
        "error": message,
        "error_code": kind.as_str(),
    })
}

fn settle_all(
    group: &CampaignChargeGroup,
    transaction_id: Option<Uuid>,
    note: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Vec<ChargeUpdate> {
    group
        .charges
        .iter()
        .map(|c| ChargeUpdate {
            charge_id: c.id,
            processed_at: now,
            transaction_id,
            note: note.clone(),
        })
        .collect()
}
