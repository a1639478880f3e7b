//! # billing-core
//!
//! Deferred batch billing for postcard campaigns: every new recipient adds a
//! pending charge to the ledger, and a daily run bills each campaign once for
//! everything that came due.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Charge Ledger│──▶│ Aggregator │──▶│  Processor  │──▶│  Settlement  │
//! │  (claimed)   │   │ per campaign│   │ one intent  │   │ tx + ledger  │
//! └──────────────┘   └────────────┘   └─────────────┘   └──────────────┘
//!                                                             │
//!                                              campaign totals (success only)
//! ```
//!
//! The `BillingStore` and `PaymentProcessor` traits are the seams: swap the
//! in-memory store for PostgreSQL (`postgres` feature) or the mock processor
//! for Stripe without touching the pipeline.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod processor;
pub mod results;
pub mod settlement;
pub mod store;

pub use aggregator::{group_due_charges, CampaignChargeGroup};
pub use config::BillingConfig;
pub use engine::{BillingEngine, RunOutcome, RunReport, RunResponse};
pub use error::{BillingError, Result};
pub use events::{
    PostcardEvent, PostcardLifecycle, PostcardProjection, PostcardStatus, TransactionEvent,
    TransactionEventKind,
};
pub use model::{
    Campaign, CampaignDelta, ChargeUpdate, Customer, PaymentMethod, PendingCharge, Transaction,
    TransactionStatus,
};
pub use processor::{
    IntentStatus, MockPaymentProcessor, MockResponse, PaymentIntentResult, PaymentProcessor,
    PaymentRequest,
};
pub use results::{BatchError, BatchResults};
pub use settlement::{plan_settlement, FailureKind, GroupOutcome, GroupStatus, SettlementPlan};
pub use store::{BillingStore, MemoryBillingStore, RecoveryReport, RunClaim};

#[cfg(feature = "postgres")]
pub use store::PostgresBillingStore;
