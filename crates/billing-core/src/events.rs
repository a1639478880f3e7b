//! Provider Events
//!
//! Late-arriving provider facts projected next to the ledger: payment
//! outcomes for recorded transactions and postcard lifecycle updates.
//! Transactions themselves are never rewritten; payment events are appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of payment fact reported after the batch run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionEventKind {
    IntentSucceeded,
    IntentFailed,
    ChargeRefunded,
}

impl TransactionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentSucceeded => "intent_succeeded",
            Self::IntentFailed => "intent_failed",
            Self::ChargeRefunded => "charge_refunded",
        }
    }
}

/// Append-only payment event, unique per provider event id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub payment_intent_id: String,

    /// Linked transaction, when one matches the intent
    pub transaction_id: Option<Uuid>,
    pub kind: TransactionEventKind,
    pub amount_cents: Option<i64>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(
        provider_event_id: impl Into<String>,
        payment_intent_id: impl Into<String>,
        kind: TransactionEventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_event_id: provider_event_id.into(),
            payment_intent_id: payment_intent_id.into(),
            transaction_id: None,
            kind,
            amount_cents: None,
            failure_code: None,
            failure_message: None,
            received_at: Utc::now(),
        }
    }
}

/// Postcard lifecycle as reported by the print-mail provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostcardLifecycle {
    Created,
    Printed,
    InTransit,
    Delivered,
    Returned,
    Cancelled,
}

impl PostcardLifecycle {
    /// Position in the forward lifecycle
    pub fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Printed => 1,
            Self::InTransit => 2,
            Self::Delivered => 3,
            Self::Returned | Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Returned | Self::Cancelled)
    }

    /// Whether `self` may replace `current`
    pub fn supersedes(&self, current: Self) -> bool {
        if current.is_terminal() {
            return false;
        }
        self.rank() > current.rank()
    }

    /// Parse a provider event name or status string
    ///
    /// Accepts `postcard.<status>` event names as well as bare statuses.
    pub fn parse(raw: &str) -> Option<Self> {
        let status = raw.strip_prefix("postcard.").unwrap_or(raw);
        match status.to_ascii_lowercase().replace('-', "_").as_str() {
            "created" | "ready" | "rendered_pdf" | "rendered_thumbnails" => Some(Self::Created),
            "printed" | "printing" | "mailed" => Some(Self::Printed),
            "in_transit" | "in_local_area" | "processed_for_delivery" | "re_routed" => {
                Some(Self::InTransit)
            }
            "delivered" | "completed" => Some(Self::Delivered),
            "returned" | "returned_to_sender" => Some(Self::Returned),
            "cancelled" | "canceled" | "deleted" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Printed => "printed",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single postcard lifecycle notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostcardEvent {
    pub event_id: String,
    pub postcard_id: String,
    pub campaign_id: Option<Uuid>,
    pub lifecycle: PostcardLifecycle,
    pub occurred_at: DateTime<Utc>,
}

/// Current projected status of one postcard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostcardStatus {
    pub postcard_id: String,
    pub campaign_id: Option<Uuid>,
    pub status: PostcardLifecycle,
    pub last_event_id: String,
    pub updated_at: DateTime<Utc>,
}

impl PostcardStatus {
    pub fn from_event(event: &PostcardEvent) -> Self {
        Self {
            postcard_id: event.postcard_id.clone(),
            campaign_id: event.campaign_id,
            status: event.lifecycle,
            last_event_id: event.event_id.clone(),
            updated_at: event.occurred_at,
        }
    }

    /// Apply an event; returns false when it would move the status backwards
    pub fn apply(&mut self, event: &PostcardEvent) -> bool {
        if !event.lifecycle.supersedes(self.status) {
            return false;
        }
        self.status = event.lifecycle;
        self.last_event_id = event.event_id.clone();
        self.updated_at = event.occurred_at;
        if self.campaign_id.is_none() {
            self.campaign_id = event.campaign_id;
        }
        true
    }
}

/// Result of projecting a postcard event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PostcardProjection {
    Applied { status: PostcardLifecycle },
    /// Stale or out-of-order event; status kept
    Ignored { status: PostcardLifecycle },
    Duplicate,
}
