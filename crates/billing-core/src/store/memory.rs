//! In-memory billing store (for development and tests)

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{merge_metadata, BillingStore, RecoveryReport, RunClaim};
use crate::error::{BillingError, Result};
use crate::events::{PostcardEvent, PostcardProjection, PostcardStatus, TransactionEvent};
use crate::model::{Campaign, ChargeUpdate, Customer, PaymentMethod, PendingCharge, Transaction};
use crate::settlement::SettlementPlan;

#[derive(Default)]
struct Ledger {
    /// Insertion order is billing order
    charges: Vec<PendingCharge>,
    campaigns: HashMap<Uuid, Campaign>,
    customers: HashMap<Uuid, Customer>,
    payment_methods: Vec<PaymentMethod>,
    transactions: Vec<Transaction>,
    transaction_events: Vec<TransactionEvent>,
    postcards: HashMap<String, PostcardStatus>,
    postcard_events: HashSet<String>,
    run_lock: Option<(Uuid, DateTime<Utc>)>,
}

impl Ledger {
    fn charge_mut(&mut self, id: Uuid) -> Option<&mut PendingCharge> {
        self.charges.iter_mut().find(|c| c.id == id)
    }

    /// Mark a charge settled; false when it was already processed
    fn settle(&mut self, update: &ChargeUpdate) -> bool {
        let Some(charge) = self.charge_mut(update.charge_id) else {
            return false;
        };
        if charge.processed {
            return false;
        }
        charge.processed = true;
        charge.processed_at = Some(update.processed_at);
        charge.transaction_id = update.transaction_id;
        charge.claimed_by = None;
        charge.claimed_until = None;
        if let Some(note) = &update.note {
            merge_metadata(&mut charge.metadata, note);
        }
        true
    }
}

/// In-memory ledger guarded by a single lock
#[derive(Default)]
pub struct MemoryBillingStore {
    ledger: RwLock<Ledger>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        self.ledger.write().await.campaigns.insert(campaign.id, campaign);
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.ledger.write().await.customers.insert(customer.user_id, customer);
    }

    pub async fn insert_payment_method(&self, method: PaymentMethod) {
        self.ledger.write().await.payment_methods.push(method);
    }

    pub async fn charges(&self) -> Vec<PendingCharge> {
        self.ledger.read().await.charges.clone()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.ledger.read().await.transactions.clone()
    }

    pub async fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.ledger.read().await.campaigns.get(&id).cloned()
    }

    pub async fn transaction_events(&self) -> Vec<TransactionEvent> {
        self.ledger.read().await.transaction_events.clone()
    }

    pub async fn postcard(&self, postcard_id: &str) -> Option<PostcardStatus> {
        self.ledger.read().await.postcards.get(postcard_id).cloned()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn acquire_run_lock(&self, claim: &RunClaim) -> Result<bool> {
        let mut ledger = self.ledger.write().await;
        match ledger.run_lock {
            Some((holder, expires)) if holder != claim.run_id && expires > claim.started_at => Ok(false),
            _ => {
                ledger.run_lock = Some((claim.run_id, claim.lease_until));
                Ok(true)
            }
        }
    }

    async fn release_run_lock(&self, run_id: Uuid) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        if ledger.run_lock.is_some_and(|(holder, _)| holder == run_id) {
            ledger.run_lock = None;
        }
        Ok(())
    }

    async fn enqueue_charge(&self, charge: &PendingCharge) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        if ledger.charges.iter().any(|c| c.id == charge.id) {
            return Err(BillingError::Storage(format!("Duplicate pending charge {}", charge.id)));
        }
        ledger.charges.push(charge.clone());
        Ok(())
    }

    async fn claim_due_charges(&self, today: NaiveDate, claim: &RunClaim) -> Result<Vec<PendingCharge>> {
        let mut ledger = self.ledger.write().await;
        let mut claimed = Vec::new();

        for charge in ledger
            .charges
            .iter_mut()
            .filter(|c| c.is_due(today) && c.is_claimable(claim.started_at))
        {
            charge.claimed_by = Some(claim.run_id);
            charge.claimed_until = Some(claim.lease_until);
            claimed.push(charge.clone());
        }

        Ok(claimed)
    }

    async fn find_customer(&self, user_id: Uuid) -> Result<Option<Customer>> {
        Ok(self.ledger.read().await.customers.get(&user_id).cloned())
    }

    async fn default_payment_method(&self, customer: &Customer) -> Result<Option<PaymentMethod>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .payment_methods
            .iter()
            .find(|m| m.stripe_customer_id == customer.stripe_customer_id && m.is_default)
            .cloned())
    }

    async fn commit_settlement(&self, run_id: Uuid, plan: &SettlementPlan) -> Result<()> {
        let mut ledger = self.ledger.write().await;

        // Validate everything before the first write
        for update in &plan.charge_updates {
            let charge = ledger
                .charges
                .iter()
                .find(|c| c.id == update.charge_id)
                .ok_or_else(|| BillingError::ClaimLost(format!("charge {} not found", update.charge_id)))?;
            if charge.processed || charge.claimed_by != Some(run_id) {
                return Err(BillingError::ClaimLost(format!(
                    "charge {} is no longer held by run {run_id}",
                    charge.id
                )));
            }
        }
        if let Some(delta) = &plan.campaign_delta {
            if !ledger.campaigns.contains_key(&delta.campaign_id) {
                return Err(BillingError::Storage(format!("Campaign {} not found", delta.campaign_id)));
            }
        }

        if let Some(tx) = &plan.transaction {
            ledger.transactions.push(tx.clone());
        }

        for update in &plan.charge_updates {
            ledger.settle(update);
        }

        if let Some(delta) = &plan.campaign_delta {
            if let Some(campaign) = ledger.campaigns.get_mut(&delta.campaign_id) {
                campaign.apply(delta);
            }
        }

        Ok(())
    }

    async fn recover_settlement(&self, plan: &SettlementPlan) -> Result<RecoveryReport> {
        let mut ledger = self.ledger.write().await;
        let mut report = RecoveryReport::default();

        if let Some(tx) = &plan.transaction {
            if !ledger.transactions.iter().any(|t| t.id == tx.id) {
                ledger.transactions.push(tx.clone());
            }
        }

        for update in &plan.charge_updates {
            if ledger.settle(update) {
                report.settled_charges += 1;
            } else {
                report.skipped_charges += 1;
            }
        }

        if let Some(delta) = &plan.campaign_delta {
            if let Some(campaign) = ledger.campaigns.get_mut(&delta.campaign_id) {
                campaign.apply(delta);
                report.campaign_updated = true;
            }
        }

        Ok(report)
    }

    async fn renew_run(&self, run_id: Uuid, until: DateTime<Utc>) -> Result<bool> {
        let mut ledger = self.ledger.write().await;
        if !ledger.run_lock.is_some_and(|(holder, _)| holder == run_id) {
            return Ok(false);
        }
        ledger.run_lock = Some((run_id, until));
        for charge in ledger
            .charges
            .iter_mut()
            .filter(|c| !c.processed && c.claimed_by == Some(run_id))
        {
            charge.claimed_until = Some(until);
        }
        Ok(true)
    }

    async fn release_charges(&self, run_id: Uuid, charge_ids: &[Uuid], note: &serde_json::Value) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        for id in charge_ids {
            if let Some(charge) = ledger.charge_mut(*id) {
                if charge.processed || charge.claimed_by != Some(run_id) {
                    continue;
                }
                charge.claimed_by = None;
                charge.claimed_until = None;
                charge.failed_attempts += 1;
                merge_metadata(&mut charge.metadata, note);
            }
        }
        Ok(())
    }

    async fn find_transaction_by_intent(&self, payment_intent_id: &str) -> Result<Option<Transaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .find(|t| t.payment_intent_id == payment_intent_id)
            .cloned())
    }

    async fn record_transaction_event(&self, event: &TransactionEvent) -> Result<bool> {
        let mut ledger = self.ledger.write().await;
        if ledger
            .transaction_events
            .iter()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return Ok(false);
        }
        ledger.transaction_events.push(event.clone());
        Ok(true)
    }

    async fn apply_postcard_event(&self, event: &PostcardEvent) -> Result<PostcardProjection> {
        let mut ledger = self.ledger.write().await;
        if !ledger.postcard_events.insert(event.event_id.clone()) {
            return Ok(PostcardProjection::Duplicate);
        }

        match ledger.postcards.get_mut(&event.postcard_id) {
            Some(status) => {
                if status.apply(event) {
                    Ok(PostcardProjection::Applied { status: status.status })
                } else {
                    Ok(PostcardProjection::Ignored { status: status.status })
                }
            }
            None => {
                let status = PostcardStatus::from_event(event);
                let projected = status.status;
                ledger.postcards.insert(event.postcard_id.clone(), status);
                Ok(PostcardProjection::Applied { status: projected })
            }
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
