//! # billing-payments
//!
//! Stripe integration and provider webhooks for postcard billing.
//!
//! ## Outbound: one payment intent per campaign group
//!
//! ```text
//! ┌──────────────┐  create + confirm   ┌──────────────┐
//! │ BillingEngine│────────────────────▶│    Stripe    │
//! │ (batch run)  │◀────────────────────│ PaymentIntent│
//! └──────────────┘  status / decline   └──────────────┘
//! ```
//!
//! `StripeClient` implements `billing_core::PaymentProcessor`. Every call is
//! off-session, confirmed immediately and sent with the group's idempotency
//! key, so a retried run re-uses the intent instead of charging twice.
//!
//! ## Inbound: provider webhooks
//!
//! - `WebhookHandler` verifies `Stripe-Signature` and appends a
//!   `TransactionEvent` for intent and refund updates. Recorded transactions
//!   are never rewritten.
//! - `PostcardWebhookVerifier` checks the print-mail provider's HMAC-SHA256
//!   signature; `PostcardProjector` folds lifecycle events into one status
//!   per postcard.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use billing_payments::StripeClient;
//!
//! let stripe = Arc::new(StripeClient::from_env()?);
//! let engine = BillingEngine::new(store, stripe, BillingConfig::from_env()?);
//! let report = engine.run().await?;
//! ```

mod client;
mod error;
mod postcards;
mod webhook;

pub use client::StripeClient;
pub use error::{PaymentError, Result};
pub use postcards::{
    PostcardProjector, PostcardWebhookVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER,
    SIGNATURE_TOLERANCE_SECS,
};
pub use webhook::{PaymentNotification, WebhookHandler, WebhookOutcome};
