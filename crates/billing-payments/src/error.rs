//! Payment Error Types

use billing_core::BillingError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Stripe API error
    #[error("Stripe error: {0}")]
    Stripe(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger error while projecting an event
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stripe(_) => true,
            Self::Billing(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Stripe(_) => "Payment processing failed. Please try again.".into(),
            Self::WebhookSignature(_) => "Webhook signature could not be verified.".into(),
            Self::WebhookParse(_) => "Webhook payload was not understood.".into(),
            Self::Config(_) => "Service configuration error.".into(),
            Self::Billing(e) => e.user_message(),
            Self::Other(_) => "An error occurred processing your request.".into(),
        }
    }

    /// Whether the sender should stop retrying delivery
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::WebhookSignature(_) | Self::WebhookParse(_))
    }
}

impl From<anyhow::Error> for PaymentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<PaymentError> for BillingError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Billing(e) => e,
            PaymentError::Config(msg) => Self::Config(msg),
            PaymentError::Stripe(msg) => Self::Processor(msg),
            other => Self::Other(other.to_string()),
        }
    }
}
