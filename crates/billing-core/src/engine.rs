//! Batch Billing Engine
//!
//! Drives one batch run: lock, claim, aggregate, then for each campaign
//! group resolve the payer, call the processor, plan and commit the
//! settlement. Groups run one after another; a failing group never stops
//! the groups after it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::aggregator::{group_due_charges, CampaignChargeGroup};
use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::processor::{PaymentProcessor, PaymentRequest};
use crate::results::BatchResults;
use crate::settlement::{
    plan_settlement, FailureKind, GroupOutcome, GroupStatus, Resolution, SettlementPlan,
};
use crate::store::{BillingStore, RunClaim};

/// Attempts to persist a processor outcome the regular commit refused
const RECOVERY_ATTEMPTS: u32 = 3;
const RECOVERY_BACKOFF: Duration = Duration::from_millis(200);

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// No due charges; nothing was touched
    NothingDue,
    Completed,
}

/// Summary of one batch run
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub results: BatchResults,
}

/// JSON body returned to the scheduler or manual trigger
#[derive(Clone, Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    pub processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BatchResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Result<RunReport>> for RunResponse {
    fn from(result: &Result<RunReport>) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                processed: report.results.total,
                results: Some(report.results.clone()),
                error: None,
            },
            Err(e) => Self {
                success: false,
                processed: 0,
                results: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Batch billing engine
pub struct BillingEngine {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    config: BillingConfig,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    /// Run the batch for today
    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// Run the batch as of `now`
    ///
    /// Only lock, claim and grouping failures surface as `Err`; every
    /// group-level failure is folded into the report.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let claim = RunClaim::new(now, self.config.lease());

        if !self.store.acquire_run_lock(&claim).await? {
            tracing::warn!(run_id = %claim.run_id, "Batch run skipped: another run holds the lock");
            return Err(BillingError::RunInProgress);
        }

        tracing::info!(
            run_id = %claim.run_id,
            store = self.store.name(),
            processor = self.processor.name(),
            "Starting batch billing run"
        );

        let result = self.run_locked(&claim).await;

        if let Err(e) = self.store.release_run_lock(claim.run_id).await {
            tracing::warn!(run_id = %claim.run_id, error = %e, "Failed to release run lock; it will expire");
        }

        match &result {
            Ok(report) => tracing::info!(
                run_id = %report.run_id,
                outcome = ?report.outcome,
                total = report.results.total,
                succeeded = report.results.succeeded,
                failed = report.results.failed,
                "Batch billing run finished"
            ),
            Err(e) => tracing::error!(run_id = %claim.run_id, error = %e, "Batch billing run aborted"),
        }

        result
    }

    async fn run_locked(&self, claim: &RunClaim) -> Result<RunReport> {
        let today = claim.started_at.date_naive();
        let charges = self.store.claim_due_charges(today, claim).await?;
        let groups = group_due_charges(today, charges);

        if groups.is_empty() {
            return Ok(RunReport {
                run_id: claim.run_id,
                started_at: claim.started_at,
                finished_at: Utc::now(),
                outcome: RunOutcome::NothingDue,
                results: BatchResults::default(),
            });
        }

        let clock = Instant::now();
        let mut lease_held = true;
        let mut results = BatchResults::default();
        for group in &groups {
            if lease_held {
                let elapsed =
                    chrono::Duration::from_std(clock.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
                lease_held = self.renew_lease(claim.run_id, claim.started_at + elapsed).await;
            }
            let outcome = if lease_held {
                self.process_group(claim.run_id, group).await
            } else {
                GroupOutcome::failed(group.campaign_id, FailureKind::Internal, "Run lease lost before billing")
            };
            results = results.record(&outcome);
        }

        Ok(RunReport {
            run_id: claim.run_id,
            started_at: claim.started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Completed,
            results,
        })
    }

    /// Push the run lock and this run's claims a full lease past `now`
    ///
    /// Once this fails another run may own the remaining charges, so none of
    /// them are billed here.
    async fn renew_lease(&self, run_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.store.renew_run(run_id, now + self.config.lease()).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::error!(run_id = %run_id, "Run lock taken over; skipping remaining groups");
                false
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Run lease renewal failed; skipping remaining groups");
                false
            }
        }
    }

    /// Settle one campaign group; never fails
    async fn process_group(&self, run_id: Uuid, group: &CampaignChargeGroup) -> GroupOutcome {
        let outcome = match self.settle_group(run_id, group).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Nothing reached the processor, or its outcome could not be
                // written; the charges are retried once the claim lapses.
                tracing::error!(
                    campaign_id = %group.campaign_id,
                    error = %e,
                    "Campaign group settlement failed"
                );
                GroupOutcome::failed(group.campaign_id, FailureKind::Internal, e.to_string())
            }
        };

        match &outcome.status {
            GroupStatus::Failed { kind, message } => tracing::warn!(
                campaign_id = %group.campaign_id,
                kind = kind.as_str(),
                error = %message,
                charges = group.charges.len(),
                "Campaign group not billed"
            ),
            status => tracing::info!(
                campaign_id = %group.campaign_id,
                status = ?status,
                amount_cents = group.total_amount_cents(),
                new_movers = group.total_new_movers(),
                charges = group.charges.len(),
                "Campaign group billed"
            ),
        }

        outcome
    }

    async fn settle_group(&self, run_id: Uuid, group: &CampaignChargeGroup) -> Result<GroupOutcome> {
        let Some(customer) = self.store.find_customer(group.user_id).await? else {
            return self.customer_not_found(run_id, group).await;
        };

        let method = self.store.default_payment_method(&customer).await?;
        let plan = match &method {
            None => plan_settlement(group, Resolution::NoPaymentMethod, Utc::now()),
            Some(method) => {
                let request = PaymentRequest::for_group(group, &customer, method);
                let call = self.processor.create_and_confirm(&request);
                let resolution = match tokio::time::timeout(self.config.processor_timeout, call).await {
                    Ok(Ok(result)) => Resolution::Intent { method, result },
                    Ok(Err(e)) => Resolution::ProcessorException {
                        method,
                        message: e.to_string(),
                    },
                    Err(_) => Resolution::ProcessorException {
                        method,
                        message: BillingError::ProcessorTimeout(self.config.processor_timeout.as_secs())
                            .to_string(),
                    },
                };
                plan_settlement(group, resolution, Utc::now())
            }
        };

        if let Err(e) = self.store.commit_settlement(run_id, &plan).await {
            if plan.transaction.is_none() {
                return Err(e);
            }
            return self.recover_settlement(run_id, &plan, e).await;
        }
        Ok(plan.outcome)
    }

    /// Persist an attempt the processor already saw after the commit refused it
    ///
    /// Claims are not checked; the payment already happened.
    async fn recover_settlement(
        &self,
        run_id: Uuid,
        plan: &SettlementPlan,
        cause: BillingError,
    ) -> Result<GroupOutcome> {
        let campaign_id = plan.outcome.campaign_id;
        let intent = plan.transaction.as_ref().map(|t| t.payment_intent_id.as_str()).unwrap_or_default();
        tracing::error!(
            run_id = %run_id,
            campaign_id = %campaign_id,
            payment_intent_id = intent,
            error = %cause,
            "Settlement commit refused; recording processor outcome without claim checks"
        );

        let mut last_error = cause;
        for attempt in 1..=RECOVERY_ATTEMPTS {
            match self.store.recover_settlement(plan).await {
                Ok(report) => {
                    if plan.campaign_delta.is_some() && !report.campaign_updated {
                        tracing::error!(
                            campaign_id = %campaign_id,
                            payment_intent_id = intent,
                            "Payment recorded but campaign totals not updated"
                        );
                    }
                    if report.skipped_charges > 0 {
                        tracing::error!(
                            campaign_id = %campaign_id,
                            payment_intent_id = intent,
                            skipped = report.skipped_charges,
                            "Charges were already settled by another attempt; review for refund"
                        );
                    }
                    return Ok(plan.outcome.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        campaign_id = %campaign_id,
                        attempt,
                        error = %e,
                        "Settlement recovery failed"
                    );
                    last_error = e;
                    tokio::time::sleep(RECOVERY_BACKOFF * attempt).await;
                }
            }
        }

        tracing::error!(
            campaign_id = %campaign_id,
            payment_intent_id = intent,
            "Processor outcome could not be recorded; reconcile the payment intent"
        );
        Err(last_error)
    }

    async fn customer_not_found(&self, run_id: Uuid, group: &CampaignChargeGroup) -> Result<GroupOutcome> {
        let attempt = group.failed_attempts() + 1;
        let exhausted = attempt >= self.config.max_customer_attempts;
        let plan = plan_settlement(group, Resolution::CustomerNotFound { exhausted }, Utc::now());

        if plan.releases_charges() {
            let note = json!({
                "last_error": format!("No billing customer for user {}", group.user_id),
                "last_error_code": FailureKind::CustomerNotFound.as_str(),
            });
            self.store.release_charges(run_id, &group.charge_ids(), &note).await?;
        } else {
            tracing::error!(
                campaign_id = %group.campaign_id,
                user_id = %group.user_id,
                attempts = attempt,
                "Customer lookup retries exhausted; settling charges as failed"
            );
            self.store.commit_settlement(run_id, &plan).await?;
        }

        Ok(plan.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Campaign, Customer, PaymentMethod, PendingCharge, TransactionStatus};
    use crate::processor::{IntentStatus, MockPaymentProcessor, MockResponse};
    use crate::store::MemoryBillingStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryBillingStore>,
        processor: Arc<MockPaymentProcessor>,
        engine: BillingEngine,
    }

    fn fixture() -> Fixture {
        fixture_with(BillingConfig::default())
    }

    fn fixture_with(config: BillingConfig) -> Fixture {
        let store = Arc::new(MemoryBillingStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let engine = BillingEngine::new(store.clone(), processor.clone(), config);
        Fixture { store, processor, engine }
    }

    /// Campaign owned by a user with a customer and (optionally) a default card
    async fn campaign(store: &MemoryBillingStore, customer_id: &str, with_card: bool) -> Campaign {
        let user = Uuid::new_v4();
        let mut campaign = Campaign::new(user, "Movers");
        campaign.total_cost = dec!(10.00);
        campaign.postcards_sent = 4;
        store.insert_campaign(campaign.clone()).await;
        store
            .insert_customer(Customer {
                user_id: user,
                stripe_customer_id: customer_id.into(),
            })
            .await;
        if with_card {
            store
                .insert_payment_method(PaymentMethod {
                    stripe_payment_method_id: format!("pm_{customer_id}"),
                    stripe_customer_id: customer_id.into(),
                    is_default: true,
                    last4: Some("4242".into()),
                    brand: Some("visa".into()),
                })
                .await;
        }
        campaign
    }

    async fn charge(store: &MemoryBillingStore, campaign: &Campaign, cents: i64, movers: i64) -> PendingCharge {
        let charge = PendingCharge::new(
            campaign.id,
            campaign.user_id,
            cents,
            movers,
            Utc::now().date_naive(),
        );
        store.enqueue_charge(&charge).await.unwrap();
        charge
    }

    #[tokio::test]
    async fn test_successful_group_is_consolidated() {
        let f = fixture();
        let c = campaign(&f.store, "cus_ok", true).await;
        charge(&f.store, &c, 500, 2).await;
        charge(&f.store, &c, 300, 1).await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.results.total, 1);
        assert_eq!(report.results.succeeded, 1);

        let txs = f.store.transactions().await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount_cents, 800);
        assert_eq!(txs[0].new_mover_count, 3);
        assert_eq!(txs[0].status, TransactionStatus::Succeeded);

        let charges = f.store.charges().await;
        assert!(charges.iter().all(|c| c.processed && c.transaction_id == Some(txs[0].id)));
        assert!(charges.iter().all(|c| c.claimed_by.is_none()));

        let updated = f.store.campaign(c.id).await.unwrap();
        assert_eq!(updated.total_cost, dec!(18.00));
        assert_eq!(updated.postcards_sent, 7);

        let requests = f.processor.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount_cents, 800);
        assert_eq!(requests[0].metadata["charge_count"], "2");
    }

    #[tokio::test]
    async fn test_no_payment_method_settles_as_failed() {
        let f = fixture();
        let c = campaign(&f.store, "cus_nocard", false).await;
        charge(&f.store, &c, 500, 2).await;
        charge(&f.store, &c, 300, 1).await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.failed, 1);

        let txs = f.store.transactions().await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].status, TransactionStatus::Failed);
        assert_eq!(txs[0].failure_code.as_deref(), Some("no_payment_method"));

        for stored in f.store.charges().await {
            assert!(stored.processed);
            assert!(stored.transaction_id.is_none());
            assert!(stored.metadata.get("error").is_some());
        }

        let updated = f.store.campaign(c.id).await.unwrap();
        assert_eq!(updated.total_cost, dec!(10.00));
        assert_eq!(updated.postcards_sent, 4);
        assert!(f.processor.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_processing_counts_as_succeeded() {
        let f = fixture();
        let c = campaign(&f.store, "cus_ach", true).await;
        charge(&f.store, &c, 500, 2).await;
        f.processor
            .respond_for("cus_ach", MockResponse::Status(IntentStatus::Processing))
            .await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.succeeded, 1);
        assert_eq!(report.results.failed, 0);

        let txs = f.store.transactions().await;
        assert_eq!(txs[0].status, TransactionStatus::Processing);
        assert!(f.store.charges().await.iter().all(|c| c.processed));

        // Money not collected yet
        assert_eq!(f.store.campaign(c.id).await.unwrap().total_cost, dec!(10.00));
    }

    #[tokio::test]
    async fn test_declined_group_records_processor_error() {
        let f = fixture();
        let c = campaign(&f.store, "cus_declined", true).await;
        charge(&f.store, &c, 500, 2).await;
        f.processor
            .respond_for(
                "cus_declined",
                MockResponse::Decline {
                    code: "card_declined".into(),
                    message: "Your card was declined.".into(),
                },
            )
            .await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.failed, 1);
        assert_eq!(report.results.errors[0].error, "Your card was declined.");

        let tx = &f.store.transactions().await[0];
        assert_eq!(tx.failure_code.as_deref(), Some("card_declined"));
        assert!(tx.payment_intent_id.starts_with("pi_mock_"));
        assert_eq!(f.store.charges().await[0].transaction_id, Some(tx.id));
    }

    #[tokio::test]
    async fn test_processor_exception_is_isolated() {
        let f = fixture();
        let broken = campaign(&f.store, "cus_broken", true).await;
        let healthy = campaign(&f.store, "cus_healthy", true).await;
        charge(&f.store, &broken, 500, 1).await;
        charge(&f.store, &healthy, 700, 2).await;
        f.processor
            .respond_for("cus_broken", MockResponse::Error("connection reset".into()))
            .await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.total, 2);
        assert_eq!(report.results.succeeded, 1);
        assert_eq!(report.results.failed, 1);
        assert_eq!(report.results.errors[0].campaign_id, broken.id);

        let txs = f.store.transactions().await;
        let failed = txs.iter().find(|t| t.campaign_id == broken.id).unwrap();
        assert!(failed.payment_intent_id.starts_with("failed_"));
        assert_eq!(failed.status, TransactionStatus::Failed);

        assert!(f.store.charges().await.iter().all(|c| c.processed));
        assert_eq!(f.store.campaign(healthy.id).await.unwrap().total_cost, dec!(17.00));
        assert_eq!(f.store.campaign(broken.id).await.unwrap().total_cost, dec!(10.00));
    }

    #[tokio::test]
    async fn test_processor_timeout_is_exception() {
        let f = fixture_with(BillingConfig {
            processor_timeout: std::time::Duration::from_millis(20),
            ..BillingConfig::default()
        });
        let c = campaign(&f.store, "cus_slow", true).await;
        charge(&f.store, &c, 500, 1).await;
        f.processor
            .respond_for(
                "cus_slow",
                MockResponse::Delay(std::time::Duration::from_secs(5), IntentStatus::Succeeded),
            )
            .await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.failed, 1);
        assert!(report.results.errors[0].error.contains("timed out"));
        assert!(f.store.charges().await[0].processed);
    }

    #[tokio::test]
    async fn test_empty_run_touches_nothing() {
        let f = fixture();
        let c = campaign(&f.store, "cus_idle", true).await;
        let future = PendingCharge::new(
            c.id,
            c.user_id,
            500,
            1,
            Utc::now().date_naive() + Duration::days(3),
        );
        f.store.enqueue_charge(&future).await.unwrap();

        let result = f.engine.run().await;
        let response = RunResponse::from(&result);
        assert!(response.success);
        assert_eq!(response.processed, 0);
        assert_eq!(result.unwrap().outcome, RunOutcome::NothingDue);

        assert!(f.store.transactions().await.is_empty());
        assert_eq!(f.store.charges().await[0], future);
    }

    #[tokio::test]
    async fn test_second_run_never_double_bills() {
        let f = fixture();
        let c = campaign(&f.store, "cus_once", true).await;
        charge(&f.store, &c, 500, 2).await;

        f.engine.run().await.unwrap();
        let first_tx = f.store.charges().await[0].transaction_id;

        let second = f.engine.run().await.unwrap();
        assert_eq!(second.outcome, RunOutcome::NothingDue);
        assert_eq!(f.store.transactions().await.len(), 1);
        assert_eq!(f.store.charges().await[0].transaction_id, first_tx);
        assert_eq!(f.processor.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_customer_not_found_leaves_charges_for_later() {
        let f = fixture();
        let orphan = Campaign::new(Uuid::new_v4(), "Orphan");
        f.store.insert_campaign(orphan.clone()).await;
        charge(&f.store, &orphan, 500, 1).await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.failed, 1);
        assert!(f.store.transactions().await.is_empty());

        let stored = &f.store.charges().await[0];
        assert!(!stored.processed);
        assert!(stored.claimed_by.is_none());
        assert_eq!(stored.failed_attempts, 1);

        // Picked up again by the next run
        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.total, 1);
        assert_eq!(f.store.charges().await[0].failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_customer_not_found_settles_after_retry_budget() {
        let f = fixture_with(BillingConfig {
            max_customer_attempts: 2,
            ..BillingConfig::default()
        });
        let orphan = Campaign::new(Uuid::new_v4(), "Orphan");
        f.store.insert_campaign(orphan.clone()).await;
        charge(&f.store, &orphan, 500, 1).await;

        f.engine.run().await.unwrap();
        assert!(!f.store.charges().await[0].processed);

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.failed, 1);

        let stored = &f.store.charges().await[0];
        assert!(stored.processed);
        assert!(stored.transaction_id.is_none());
        assert_eq!(stored.metadata["error_code"], "customer_not_found");
        assert!(f.store.transactions().await.is_empty());

        let third = f.engine.run().await.unwrap();
        assert_eq!(third.outcome, RunOutcome::NothingDue);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let f = fixture();
        let c = campaign(&f.store, "cus_locked", true).await;
        charge(&f.store, &c, 500, 1).await;

        let other = RunClaim::new(Utc::now(), Duration::minutes(15));
        assert!(f.store.acquire_run_lock(&other).await.unwrap());

        let result = f.engine.run().await;
        assert!(matches!(result, Err(BillingError::RunInProgress)));
        let response = RunResponse::from(&result);
        assert!(!response.success);
        assert!(f.store.transactions().await.is_empty());
        assert!(!f.store.charges().await[0].processed);
    }

    #[tokio::test]
    async fn test_captured_payment_survives_missing_campaign() {
        let f = fixture();
        // Campaign row not stored yet: the regular commit is refused after the card was charged
        let ghost = Campaign::new(Uuid::new_v4(), "Ghost");
        f.store
            .insert_customer(Customer {
                user_id: ghost.user_id,
                stripe_customer_id: "cus_ghost".into(),
            })
            .await;
        f.store
            .insert_payment_method(PaymentMethod {
                stripe_payment_method_id: "pm_ghost".into(),
                stripe_customer_id: "cus_ghost".into(),
                is_default: true,
                last4: None,
                brand: None,
            })
            .await;
        let first = charge(&f.store, &ghost, 500, 1).await;

        let report = f.engine.run().await.unwrap();
        assert_eq!(report.results.succeeded, 1);

        let txs = f.store.transactions().await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].status, TransactionStatus::Succeeded);
        assert_eq!(txs[0].amount_cents, 500);

        let stored = &f.store.charges().await[0];
        assert!(stored.processed);
        assert!(stored.claimed_by.is_none());
        assert_eq!(stored.transaction_id, Some(txs[0].id));

        // Tomorrow only the new charge is billed
        f.store.insert_campaign(ghost.clone()).await;
        charge(&f.store, &ghost, 300, 1).await;
        f.engine.run_at(Utc::now() + Duration::days(1)).await.unwrap();

        let amounts: Vec<i64> = f.processor.requests().await.iter().map(|r| r.amount_cents).collect();
        assert_eq!(amounts, vec![500, 300]);
        assert_eq!(f.store.transactions().await.len(), 2);
        let first_stored = f.store.charges().await.into_iter().find(|c| c.id == first.id).unwrap();
        assert_eq!(first_stored.transaction_id, Some(txs[0].id));
        assert_eq!(f.store.campaign(ghost.id).await.unwrap().total_cost, dec!(3.00));
    }

    #[tokio::test]
    async fn test_long_run_keeps_lease() {
        let f = fixture_with(BillingConfig {
            run_lease: std::time::Duration::from_secs(2),
            processor_timeout: std::time::Duration::from_millis(1500),
            ..BillingConfig::default()
        });
        for i in 0..4 {
            let customer = format!("cus_slow_{i}");
            let c = campaign(&f.store, &customer, true).await;
            charge(&f.store, &c, 500, 1).await;
            f.processor
                .respond_for(
                    &customer,
                    MockResponse::Delay(std::time::Duration::from_millis(800), IntentStatus::Succeeded),
                )
                .await;
        }

        // Starts after the original lease has run out but while groups remain
        let rival = async {
            tokio::time::sleep(std::time::Duration::from_millis(2300)).await;
            f.engine.run_at(Utc::now()).await
        };
        let (first, second) = tokio::join!(f.engine.run(), rival);

        assert!(matches!(second, Err(BillingError::RunInProgress)));
        assert_eq!(first.unwrap().results.succeeded, 4);
        assert_eq!(f.processor.requests().await.len(), 4);
        assert_eq!(f.store.transactions().await.len(), 4);
        assert!(f.store.charges().await.iter().all(|c| c.processed));
    }

    #[tokio::test]
    async fn test_lost_lease_stops_billing() {
        let f = fixture();
        let slow = campaign(&f.store, "cus_first", true).await;
        let next = campaign(&f.store, "cus_second", true).await;
        charge(&f.store, &slow, 500, 1).await;
        charge(&f.store, &next, 700, 1).await;
        f.processor
            .respond_for(
                "cus_first",
                MockResponse::Delay(std::time::Duration::from_millis(300), IntentStatus::Succeeded),
            )
            .await;

        // Another run takes the lock while the first group is at the processor
        let takeover = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let claim = RunClaim::new(Utc::now() + Duration::hours(1), Duration::minutes(15));
            f.store.acquire_run_lock(&claim).await.unwrap()
        };
        let (report, taken) = tokio::join!(f.engine.run(), takeover);
        assert!(taken);

        let report = report.unwrap();
        assert_eq!(report.results.succeeded, 1);
        assert_eq!(report.results.failed, 1);
        assert_eq!(report.results.errors[0].campaign_id, next.id);

        assert_eq!(f.processor.requests().await.len(), 1);
        let charges = f.store.charges().await;
        let unbilled = charges.iter().find(|c| c.campaign_id == next.id).unwrap();
        assert!(!unbilled.processed);
    }
}
