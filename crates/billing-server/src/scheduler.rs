//! Daily Batch Scheduler

use std::sync::Arc;

use billing_core::{BillingEngine, BillingError};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::task::JoinHandle;

/// Next occurrence of `hour:00` UTC strictly after `now`
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let candidate = now.date_naive().and_time(at).and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// Run the batch once a day for the life of the process
pub fn spawn(engine: Arc<BillingEngine>, hour: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, hour);
            tracing::info!(next_run = %next, "Batch billing scheduled");

            tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;

            match engine.run().await {
                Ok(report) => tracing::info!(
                    run_id = %report.run_id,
                    total = report.results.total,
                    succeeded = report.results.succeeded,
                    failed = report.results.failed,
                    "Scheduled batch run complete"
                ),
                Err(BillingError::RunInProgress) => {
                    tracing::warn!("Scheduled batch run skipped: another run in progress");
                }
                Err(e) => tracing::error!(error = %e, "Scheduled batch run failed"),
            }
        }
    })
}
