//! Configuration loading and representation.

use std::time::Duration;

use thiserror::Error;

pub const ENV_MAX_CLAIM_ATTEMPTS: &str = "CMDLEASE_MAX_CLAIM_ATTEMPTS";
pub const ENV_MAX_LEASE_MS: &str = "CMDLEASE_MAX_LEASE_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Command service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// How many candidates `claim` may try (each losing a race) before giving
    /// up with a lease conflict. At least 1.
    pub max_claim_attempts: u32,
    /// Upper bound on lease durations callers may ask for.
    pub max_lease: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_claim_attempts: 5,
            max_lease: None,
        }
    }
}

impl ServiceConfig {
    pub fn with_max_claim_attempts(mut self, attempts: u32) -> Self {
        self.max_claim_attempts = attempts;
        self
    }

    pub fn with_max_lease(mut self, max: Duration) -> Self {
        self.max_lease = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_claim_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_MAX_CLAIM_ATTEMPTS,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_lease.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: ENV_MAX_LEASE_MS,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overridden by `CMDLEASE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServiceConfig::from_env`] with an arbitrary key source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_CLAIM_ATTEMPTS) {
            config.max_claim_attempts = parse(ENV_MAX_CLAIM_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_LEASE_MS) {
            let ms: u64 = parse(ENV_MAX_LEASE_MS, &raw)?;
            config.max_lease = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.max_claim_attempts, 5);
        assert_eq!(config.max_lease, None);
    }

    #[test]
    fn env_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            (ENV_MAX_CLAIM_ATTEMPTS, "9"),
            (ENV_MAX_LEASE_MS, "60000"),
        ]))
        .unwrap();
        assert_eq!(config.max_claim_attempts, 9);
        assert_eq!(config.max_lease, Some(Duration::from_secs(60)));
    }

    #[test]
    fn garbage_is_reported_with_key() {
        let err = ServiceConfig::from_lookup(lookup(&[(ENV_MAX_CLAIM_ATTEMPTS, "lots")]))
            .unwrap_err();
        let ConfigError::InvalidValue { key, value, .. } = err;
        assert_eq!(key, ENV_MAX_CLAIM_ATTEMPTS);
        assert_eq!(value, "lots");
    }

    #[test]
    fn zero_attempts_is_invalid() {
        assert!(ServiceConfig::from_lookup(lookup(&[(ENV_MAX_CLAIM_ATTEMPTS, "0")])).is_err());
        assert!(ServiceConfig::default()
            .with_max_claim_attempts(0)
            .validate()
            .is_err());
    }
}
