//! Billing Configuration

use std::time::Duration;

use crate::error::{BillingError, Result};

/// Batch run tuning
#[derive(Clone, Debug)]
pub struct BillingConfig {
    /// How long a run's lock and charge claims stay valid
    pub run_lease: Duration,

    /// Upper bound on one processor call
    pub processor_timeout: Duration,

    /// Customer lookup misses tolerated before charges are settled as failed
    pub max_customer_attempts: i32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            run_lease: Duration::from_secs(900),
            processor_timeout: Duration::from_secs(30),
            max_customer_attempts: 7,
        }
    }
}

impl BillingConfig {
    /// Read overrides from `BILLING_RUN_LEASE_SECS`,
    /// `BILLING_PROCESSOR_TIMEOUT_SECS` and `BILLING_MAX_CUSTOMER_ATTEMPTS`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Self {
            run_lease: env_secs("BILLING_RUN_LEASE_SECS")?.unwrap_or(defaults.run_lease),
            processor_timeout: env_secs("BILLING_PROCESSOR_TIMEOUT_SECS")?
                .unwrap_or(defaults.processor_timeout),
            max_customer_attempts: env_parse("BILLING_MAX_CUSTOMER_ATTEMPTS")?
                .unwrap_or(defaults.max_customer_attempts),
        }
        .validate()
    }

    /// The lease is renewed between groups, so one processor call must fit inside it
    pub fn validate(self) -> Result<Self> {
        if self.processor_timeout >= self.run_lease {
            return Err(BillingError::Config(format!(
                "processor timeout ({}s) must be shorter than the run lease ({}s)",
                self.processor_timeout.as_secs(),
                self.run_lease.as_secs()
            )));
        }
        Ok(self)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.run_lease).unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{key} is not a valid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.run_lease, Duration::from_secs(900));
        assert_eq!(config.max_customer_attempts, 7);
        assert_eq!(config.lease(), chrono::Duration::minutes(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_fit_in_lease() {
        let config = BillingConfig {
            run_lease: Duration::from_secs(30),
            processor_timeout: Duration::from_secs(30),
            ..BillingConfig::default()
        };
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }
}
