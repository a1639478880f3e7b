//! Error Types

use thiserror::Error;

/// Result type alias for billing operations
pub type Result<T> = std::result::Result<T, BillingError>;

/// Billing error types
#[derive(Error, Debug)]
pub enum BillingError {
    /// Payment processor call failed (network, auth, unexpected response)
    #[error("Payment processor error: {0}")]
    Processor(String),

    /// Payment processor did not answer in time
    #[error("Payment processor timed out after {0}s")]
    ProcessorTimeout(u64),

    /// Another batch run holds the run lock
    #[error("Batch run already in progress")]
    RunInProgress,

    /// Charges were no longer claimed by this run at commit time
    #[error("Claim lost: {0}")]
    ClaimLost(String),

    /// Ledger storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl BillingError {
    /// Check if the error is worth retrying on a later run
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Processor(_)
                | Self::ProcessorTimeout(_)
                | Self::RunInProgress
                | Self::Storage(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Processor(_) | Self::ProcessorTimeout(_) => {
                "Payment processing failed. The charge will be reported on your billing history.".into()
            }
            Self::RunInProgress => "Billing is already running. Please try again later.".into(),
            _ => "An unexpected billing error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
