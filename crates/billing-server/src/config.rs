//! Server Configuration

use billing_core::{BillingError, Result};

/// HTTP service and scheduler settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Bearer token for the internal endpoints; open when unset
    pub cron_secret: Option<String>,

    /// UTC hour of the daily batch run
    pub schedule_hour_utc: u32,
    pub schedule_enabled: bool,

    /// Selects the PostgreSQL store when built with `postgres`
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            cron_secret: None,
            schedule_hour_utc: 6,
            schedule_enabled: true,
            database_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let schedule_hour_utc = match get("BILLING_SCHEDULE_HOUR_UTC") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|h| *h < 24)
                .ok_or_else(|| BillingError::Config(format!("BILLING_SCHEDULE_HOUR_UTC must be 0-23, got {raw}")))?,
            None => defaults.schedule_hour_utc,
        };

        let schedule_enabled = match get("BILLING_SCHEDULE_ENABLED") {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(BillingError::Config(format!(
                        "BILLING_SCHEDULE_ENABLED is not a boolean: {raw}"
                    )));
                }
            },
            None => defaults.schedule_enabled,
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            cron_secret: get("BILLING_CRON_SECRET"),
            schedule_hour_utc,
            schedule_enabled,
            database_url: get("DATABASE_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.schedule_hour_utc, 6);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("BILLING_CRON_SECRET", "s3cret"),
            ("BILLING_SCHEDULE_HOUR_UTC", "23"),
            ("BILLING_SCHEDULE_ENABLED", "off"),
            ("DATABASE_URL", " "),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.schedule_hour_utc, 23);
        assert!(!config.schedule_enabled);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("BILLING_SCHEDULE_HOUR_UTC", "24")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("BILLING_SCHEDULE_ENABLED", "maybe")])).is_err());
    }
}
