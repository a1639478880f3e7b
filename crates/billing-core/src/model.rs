//! Domain Models
//!
//! Ledger rows, billing identities and transaction records.
//! Charges are carried in integer cents; campaign totals use `rust_decimal`.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed currency for every charge
pub const CURRENCY: &str = "usd";

/// Convert integer cents into a dollar amount
pub fn cents_to_dollars(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// An un-billed unit of cost queued for batch billing
///
/// Written by the recipient-import process; mutated once by settlement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingCharge {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub user_id: Uuid,

    /// Cost in cents
    pub amount_cents: i64,

    /// Recipients added by this charge
    pub new_mover_count: i64,

    /// Earliest date this charge may be billed
    pub scheduled_for: NaiveDate,

    pub is_test_mode: bool,

    /// Set once, never reverted
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<Uuid>,

    /// Free-form error/context
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Runs that found no billing customer for this charge
    #[serde(default)]
    pub failed_attempts: i32,

    /// Run currently holding this charge
    pub claimed_by: Option<Uuid>,
    pub claimed_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl PendingCharge {
    pub fn new(
        campaign_id: Uuid,
        user_id: Uuid,
        amount_cents: i64,
        new_mover_count: i64,
        scheduled_for: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            user_id,
            amount_cents,
            new_mover_count,
            scheduled_for,
            is_test_mode: false,
            processed: false,
            processed_at: None,
            transaction_id: None,
            metadata: serde_json::Value::Null,
            failed_attempts: 0,
            claimed_by: None,
            claimed_until: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_test_mode(mut self, is_test_mode: bool) -> Self {
        self.is_test_mode = is_test_mode;
        self
    }

    /// Due and not yet settled
    pub fn is_due(&self, today: NaiveDate) -> bool {
        !self.processed && self.scheduled_for <= today
    }

    /// Not held by a live claim of another run
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.claimed_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

/// Billing customer, keyed by user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
}

/// Stored payment instrument
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub stripe_payment_method_id: String,
    pub stripe_customer_id: String,
    pub is_default: bool,
    pub last4: Option<String>,
    pub brand: Option<String>,
}

/// Recorded outcome of a payment attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Succeeded,
    Processing,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(Self::Succeeded),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transaction was raised
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    #[default]
    NewMoverAddition,
}

impl BillingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMoverAddition => "new_mover_addition",
        }
    }
}

/// One consolidated billing attempt for a campaign group
///
/// Immutable once inserted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub campaign_id: Uuid,

    /// Processor intent id, or `failed_<timestamp>` when none exists
    pub payment_intent_id: String,
    pub charge_id: Option<String>,

    pub amount_cents: i64,
    pub amount_dollars: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub billing_reason: BillingReason,
    pub new_mover_count: i64,

    pub failure_code: Option<String>,
    pub failure_message: Option<String>,

    pub payment_method_last4: Option<String>,
    pub payment_method_brand: Option<String>,
    pub receipt_url: Option<String>,

    pub is_test_mode: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A campaign's running billing totals
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,

    /// Dollars collected so far
    pub total_cost: Decimal,
    pub postcards_sent: i64,
}

impl Campaign {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            total_cost: Decimal::ZERO,
            postcards_sent: 0,
        }
    }

    /// Roll a successful group into the totals
    pub fn apply(&mut self, delta: &CampaignDelta) {
        self.total_cost += delta.cost;
        self.postcards_sent += delta.postcards;
    }
}

/// Increment applied to a campaign after a collected payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignDelta {
    pub campaign_id: Uuid,
    pub cost: Decimal,
    pub postcards: i64,
}

/// Settlement write for a single pending charge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChargeUpdate {
    pub charge_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub transaction_id: Option<Uuid>,

    /// Merged into the charge's metadata
    pub note: Option<serde_json::Value>,
}
