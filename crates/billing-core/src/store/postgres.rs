//! PostgreSQL billing store
//!
//! Claims use `FOR UPDATE SKIP LOCKED`; settlements commit in one SQL
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use uuid::Uuid;

use super::{BillingStore, RecoveryReport, RunClaim};
use crate::error::{BillingError, Result};
use crate::events::{PostcardEvent, PostcardLifecycle, PostcardProjection, PostcardStatus, TransactionEvent};
use crate::model::{
    BillingReason, CampaignDelta, ChargeUpdate, Customer, PaymentMethod, PendingCharge, Transaction,
    TransactionStatus,
};
use crate::settlement::SettlementPlan;

const SCHEMA: &str = include_str!("schema.sql");

const CHARGE_COLUMNS: &str = "seq, id, campaign_id, user_id, amount_cents, new_mover_count, \
     scheduled_for, is_test_mode, processed, processed_at, transaction_id, metadata, \
     failed_attempts, claimed_by, claimed_until, created_at";

#[derive(sqlx::FromRow)]
struct ChargeRow {
    seq: i64,
    id: Uuid,
    campaign_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    new_mover_count: i64,
    scheduled_for: NaiveDate,
    is_test_mode: bool,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    transaction_id: Option<Uuid>,
    metadata: serde_json::Value,
    failed_attempts: i32,
    claimed_by: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ChargeRow> for PendingCharge {
    fn from(row: ChargeRow) -> Self {
        Self {
            id: row.id,
            campaign_id: row.campaign_id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            new_mover_count: row.new_mover_count,
            scheduled_for: row.scheduled_for,
            is_test_mode: row.is_test_mode,
            processed: row.processed,
            processed_at: row.processed_at,
            transaction_id: row.transaction_id,
            metadata: row.metadata,
            failed_attempts: row.failed_attempts,
            claimed_by: row.claimed_by,
            claimed_until: row.claimed_until,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    campaign_id: Uuid,
    payment_intent_id: String,
    charge_id: Option<String>,
    amount_cents: i64,
    amount_dollars: Decimal,
    currency: String,
    status: String,
    new_mover_count: i64,
    failure_code: Option<String>,
    failure_message: Option<String>,
    payment_method_last4: Option<String>,
    payment_method_brand: Option<String>,
    receipt_url: Option<String>,
    is_test_mode: bool,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let status = TransactionStatus::parse(&row.status)
            .ok_or_else(|| BillingError::Storage(format!("Unknown transaction status: {}", row.status)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            campaign_id: row.campaign_id,
            payment_intent_id: row.payment_intent_id,
            charge_id: row.charge_id,
            amount_cents: row.amount_cents,
            amount_dollars: row.amount_dollars,
            currency: row.currency,
            status,
            billing_reason: BillingReason::NewMoverAddition,
            new_mover_count: row.new_mover_count,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            payment_method_last4: row.payment_method_last4,
            payment_method_brand: row.payment_method_brand,
            receipt_url: row.receipt_url,
            is_test_mode: row.is_test_mode,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PostcardRow {
    postcard_id: String,
    campaign_id: Option<Uuid>,
    status: String,
    last_event_id: String,
    updated_at: DateTime<Utc>,
}

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PostgresBillingStore {
    pool: PgPool,
}

impl PostgresBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool sized for a single batch worker
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes when missing
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn object_or_empty(value: &serde_json::Value) -> serde_json::Value {
    if value.is_object() { value.clone() } else { json!({}) }
}

/// Write a transaction row once; a replayed id is a no-op
async fn insert_transaction(conn: &mut PgConnection, t: &Transaction) -> Result<()> {
    sqlx::query(
        "INSERT INTO transactions (id, user_id, campaign_id, payment_intent_id, charge_id, \
             amount_cents, amount_dollars, currency, status, billing_reason, new_mover_count, \
             failure_code, failure_message, payment_method_last4, payment_method_brand, \
             receipt_url, is_test_mode, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(t.id)
    .bind(t.user_id)
    .bind(t.campaign_id)
    .bind(&t.payment_intent_id)
    .bind(&t.charge_id)
    .bind(t.amount_cents)
    .bind(t.amount_dollars)
    .bind(&t.currency)
    .bind(t.status.as_str())
    .bind(t.billing_reason.as_str())
    .bind(t.new_mover_count)
    .bind(&t.failure_code)
    .bind(&t.failure_message)
    .bind(&t.payment_method_last4)
    .bind(&t.payment_method_brand)
    .bind(&t.receipt_url)
    .bind(t.is_test_mode)
    .bind(&t.metadata)
    .bind(t.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Settle one unprocessed charge, optionally only while `holder` claims it
async fn settle_charge(conn: &mut PgConnection, update: &ChargeUpdate, holder: Option<Uuid>) -> Result<bool> {
    let note = update.note.clone().unwrap_or_else(|| json!({}));
    let result = sqlx::query(
        "UPDATE pending_charges SET processed = TRUE, processed_at = $2, transaction_id = $3, \
             metadata = CASE WHEN jsonb_typeof(metadata) = 'object' THEN metadata ELSE '{}'::jsonb END || $4, \
             claimed_by = NULL, claimed_until = NULL \
         WHERE id = $1 AND NOT processed AND ($5::uuid IS NULL OR claimed_by = $5)",
    )
    .bind(update.charge_id)
    .bind(update.processed_at)
    .bind(update.transaction_id)
    .bind(note)
    .bind(holder)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Roll collected totals into a campaign; false when the campaign is missing
async fn apply_delta(conn: &mut PgConnection, delta: &CampaignDelta) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE campaigns SET total_cost = total_cost + $2, postcards_sent = postcards_sent + $3 \
         WHERE id = $1",
    )
    .bind(delta.campaign_id)
    .bind(delta.cost)
    .bind(delta.postcards)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn acquire_run_lock(&self, claim: &RunClaim) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO billing_run_lock (id, run_id, acquired_at, expires_at) VALUES (1, $1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET run_id = EXCLUDED.run_id, \
                 acquired_at = EXCLUDED.acquired_at, expires_at = EXCLUDED.expires_at \
             WHERE billing_run_lock.expires_at <= EXCLUDED.acquired_at \
                OR billing_run_lock.run_id = EXCLUDED.run_id",
        )
        .bind(claim.run_id)
        .bind(claim.started_at)
        .bind(claim.lease_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_run_lock(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM billing_run_lock WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue_charge(&self, charge: &PendingCharge) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_charges (id, campaign_id, user_id, amount_cents, new_mover_count, \
                 scheduled_for, is_test_mode, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(charge.id)
        .bind(charge.campaign_id)
        .bind(charge.user_id)
        .bind(charge.amount_cents)
        .bind(charge.new_mover_count)
        .bind(charge.scheduled_for)
        .bind(charge.is_test_mode)
        .bind(object_or_empty(&charge.metadata))
        .bind(charge.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due_charges(&self, today: NaiveDate, claim: &RunClaim) -> Result<Vec<PendingCharge>> {
        let sql = format!(
            "UPDATE pending_charges SET claimed_by = $1, claimed_until = $2 \
             WHERE id IN ( \
                 SELECT id FROM pending_charges \
                 WHERE NOT processed AND scheduled_for <= $3 \
                   AND (claimed_until IS NULL OR claimed_until <= $4) \
                 ORDER BY seq \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {CHARGE_COLUMNS}"
        );
        let mut rows: Vec<ChargeRow> = sqlx::query_as(&sql)
            .bind(claim.run_id)
            .bind(claim.lease_until)
            .bind(today)
            .bind(claim.started_at)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve order
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(PendingCharge::from).collect())
    }

    async fn find_customer(&self, user_id: Uuid) -> Result<Option<Customer>> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT user_id, stripe_customer_id FROM customers WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id, stripe_customer_id)| Customer {
            user_id,
            stripe_customer_id,
        }))
    }

    async fn default_payment_method(&self, customer: &Customer) -> Result<Option<PaymentMethod>> {
        let row: Option<(String, String, bool, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT stripe_payment_method_id, stripe_customer_id, is_default, last4, brand \
             FROM payment_methods WHERE stripe_customer_id = $1 AND is_default LIMIT 1",
        )
        .bind(&customer.stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(stripe_payment_method_id, stripe_customer_id, is_default, last4, brand)| PaymentMethod {
                stripe_payment_method_id,
                stripe_customer_id,
                is_default,
                last4,
                brand,
            },
        ))
    }

    async fn commit_settlement(&self, run_id: Uuid, plan: &SettlementPlan) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(t) = &plan.transaction {
            insert_transaction(&mut *tx, t).await?;
        }

        for update in &plan.charge_updates {
            if !settle_charge(&mut *tx, update, Some(run_id)).await? {
                // Dropping `tx` rolls back the transaction insert
                return Err(BillingError::ClaimLost(format!(
                    "charge {} is no longer held by run {run_id}",
                    update.charge_id
                )));
            }
        }

        if let Some(delta) = &plan.campaign_delta {
            if !apply_delta(&mut *tx, delta).await? {
                return Err(BillingError::Storage(format!("Campaign {} not found", delta.campaign_id)));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn recover_settlement(&self, plan: &SettlementPlan) -> Result<RecoveryReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = RecoveryReport::default();

        if let Some(t) = &plan.transaction {
            insert_transaction(&mut *tx, t).await?;
        }

        for update in &plan.charge_updates {
            if settle_charge(&mut *tx, update, None).await? {
                report.settled_charges += 1;
            } else {
                report.skipped_charges += 1;
            }
        }

        if let Some(delta) = &plan.campaign_delta {
            report.campaign_updated = apply_delta(&mut *tx, delta).await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn renew_run(&self, run_id: Uuid, until: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let held = sqlx::query("UPDATE billing_run_lock SET expires_at = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(until)
            .execute(&mut *tx)
            .await?;
        if held.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE pending_charges SET claimed_until = $2 WHERE claimed_by = $1 AND NOT processed")
            .bind(run_id)
            .bind(until)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_charges(&self, run_id: Uuid, charge_ids: &[Uuid], note: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE pending_charges SET claimed_by = NULL, claimed_until = NULL, \
                 failed_attempts = failed_attempts + 1, \
                 metadata = CASE WHEN jsonb_typeof(metadata) = 'object' THEN metadata ELSE '{}'::jsonb END || $3 \
             WHERE id = ANY($1) AND NOT processed AND claimed_by = $2",
        )
        .bind(charge_ids)
        .bind(run_id)
        .bind(object_or_empty(note))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_transaction_by_intent(&self, payment_intent_id: &str) -> Result<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT id, user_id, campaign_id, payment_intent_id, charge_id, amount_cents, amount_dollars, \
                 currency, status, new_mover_count, failure_code, failure_message, payment_method_last4, \
                 payment_method_brand, receipt_url, is_test_mode, metadata, created_at \
             FROM transactions WHERE payment_intent_id = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn record_transaction_event(&self, event: &TransactionEvent) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO transaction_events (id, provider_event_id, payment_intent_id, transaction_id, \
                 kind, amount_cents, failure_code, failure_message, received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (provider_event_id) DO NOTHING",
        )
        .bind(event.id)
        .bind(&event.provider_event_id)
        .bind(&event.payment_intent_id)
        .bind(event.transaction_id)
        .bind(event.kind.as_str())
        .bind(event.amount_cents)
        .bind(&event.failure_code)
        .bind(&event.failure_message)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_postcard_event(&self, event: &PostcardEvent) -> Result<PostcardProjection> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO postcard_events (event_id, postcard_id) VALUES ($1, $2) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(&event.postcard_id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(PostcardProjection::Duplicate);
        }

        let current: Option<PostcardRow> = sqlx::query_as(
            "SELECT postcard_id, campaign_id, status, last_event_id, updated_at \
             FROM postcard_statuses WHERE postcard_id = $1 FOR UPDATE",
        )
        .bind(&event.postcard_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (status, applied) = match current {
            Some(row) => {
                let lifecycle = PostcardLifecycle::parse(&row.status).ok_or_else(|| {
                    BillingError::Storage(format!("Unknown postcard status: {}", row.status))
                })?;
                let mut status = PostcardStatus {
                    postcard_id: row.postcard_id,
                    campaign_id: row.campaign_id,
                    status: lifecycle,
                    last_event_id: row.last_event_id,
                    updated_at: row.updated_at,
                };
                let applied = status.apply(event);
                (status, applied)
            }
            None => (PostcardStatus::from_event(event), true),
        };

        if applied {
            sqlx::query(
                "INSERT INTO postcard_statuses (postcard_id, campaign_id, status, last_event_id, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (postcard_id) DO UPDATE SET campaign_id = EXCLUDED.campaign_id, \
                     status = EXCLUDED.status, last_event_id = EXCLUDED.last_event_id, \
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(&status.postcard_id)
            .bind(status.campaign_id)
            .bind(status.status.as_str())
            .bind(&status.last_event_id)
            .bind(status.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(if applied {
            PostcardProjection::Applied { status: status.status }
        } else {
            PostcardProjection::Ignored { status: status.status }
        })
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
