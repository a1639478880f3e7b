//! Ledger Storage
//!
//! The charge ledger, billing identities, transactions and campaign totals
//! behind one trait. Every settlement is committed atomically.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryBillingStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBillingStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{PostcardEvent, PostcardProjection, TransactionEvent};
use crate::model::{Customer, PaymentMethod, PendingCharge, Transaction};
use crate::settlement::SettlementPlan;

/// Lease held by one batch run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunClaim {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

impl RunClaim {
    pub fn new(started_at: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            lease_until: started_at + lease,
        }
    }
}

/// What a recovery write managed to persist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub settled_charges: usize,

    /// Charges another run settled first
    pub skipped_charges: usize,

    pub campaign_updated: bool,
}

/// Billing ledger storage trait
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Take the single-run lock; false when another live run holds it
    async fn acquire_run_lock(&self, claim: &RunClaim) -> Result<bool>;

    /// Drop the run lock if this run holds it
    async fn release_run_lock(&self, run_id: Uuid) -> Result<()>;

    /// Append a pending charge (recipient-import write contract)
    async fn enqueue_charge(&self, charge: &PendingCharge) -> Result<()>;

    /// Read and lease every due, unprocessed, unclaimed charge in one step
    ///
    /// Charges come back in insertion order.
    async fn claim_due_charges(&self, today: NaiveDate, claim: &RunClaim) -> Result<Vec<PendingCharge>>;

    /// Billing customer for a user
    async fn find_customer(&self, user_id: Uuid) -> Result<Option<Customer>>;

    /// The customer's default payment instrument
    async fn default_payment_method(&self, customer: &Customer) -> Result<Option<PaymentMethod>>;

    /// Apply a settlement plan atomically
    ///
    /// Fails with `ClaimLost` and writes nothing when any charge is already
    /// processed or no longer claimed by `run_id`.
    async fn commit_settlement(&self, run_id: Uuid, plan: &SettlementPlan) -> Result<()>;

    /// Persist a settlement whose processor call already happened
    ///
    /// Fallback for when `commit_settlement` refuses the plan. Claims are
    /// ignored: the transaction is written once, every listed charge that is
    /// still unprocessed is settled, and the campaign delta is applied only
    /// when the campaign exists.
    async fn recover_settlement(&self, plan: &SettlementPlan) -> Result<RecoveryReport>;

    /// Extend the run lock and the run's open claims to `until`
    ///
    /// False once the lock belongs to another run.
    async fn renew_run(&self, run_id: Uuid, until: DateTime<Utc>) -> Result<bool>;

    /// Return charges to the ledger after a customer lookup miss
    ///
    /// Clears the claim, bumps `failed_attempts` and merges `note` into
    /// the charge metadata.
    async fn release_charges(&self, run_id: Uuid, charge_ids: &[Uuid], note: &serde_json::Value) -> Result<()>;

    /// Transaction recorded for a processor intent
    async fn find_transaction_by_intent(&self, payment_intent_id: &str) -> Result<Option<Transaction>>;

    /// Append a payment event; false when the provider event was seen before
    async fn record_transaction_event(&self, event: &TransactionEvent) -> Result<bool>;

    /// Project a postcard lifecycle event
    async fn apply_postcard_event(&self, event: &PostcardEvent) -> Result<PostcardProjection>;

    /// Backend name
    fn name(&self) -> &str;
}

/// Merge a settlement note into existing charge metadata
pub(crate) fn merge_metadata(existing: &mut serde_json::Value, note: &serde_json::Value) {
    match (existing.as_object_mut(), note.as_object()) {
        (Some(current), Some(extra)) => {
            for (k, v) in extra {
                current.insert(k.clone(), v.clone());
            }
        }
        _ => *existing = note.clone(),
    }
}
