//! Application State

use std::sync::Arc;

use billing_core::{BillingEngine, BillingStore};
use billing_payments::{PostcardWebhookVerifier, StripeClient};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Batch engine over the selected store and processor
    pub engine: Arc<BillingEngine>,

    /// Ledger store (memory or PostgreSQL)
    pub store: Arc<dyn BillingStore>,

    /// Stripe client (optional - None if not configured)
    pub stripe: Option<Arc<StripeClient>>,

    /// Print-mail webhook verifier (optional - None if not configured)
    pub postcards: Option<Arc<PostcardWebhookVerifier>>,

    /// Bearer token guarding the internal endpoints
    pub cron_secret: Option<String>,
}
