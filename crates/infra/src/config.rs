//! Checkout engine configuration.
//!
//! Defaults suit a single storefront. Every knob can be overridden from the
//! environment (`NUTRISHOP_*`) or through the `with_*` builders.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

pub const ENV_RESERVATION_TTL_SECS: &str = "NUTRISHOP_RESERVATION_TTL_SECS";
pub const ENV_RESERVE_MAX_ATTEMPTS: &str = "NUTRISHOP_RESERVE_MAX_ATTEMPTS";
pub const ENV_RELEASE_MAX_ATTEMPTS: &str = "NUTRISHOP_RELEASE_MAX_ATTEMPTS";
pub const ENV_BACKOFF_BASE_MS: &str = "NUTRISHOP_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "NUTRISHOP_BACKOFF_MAX_MS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "NUTRISHOP_SWEEP_INTERVAL_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid unsigned integer: {value:?}")]
    NotANumber { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutConfig {
    /// How long a reservation holds stock before it may be swept.
    pub reservation_ttl: Duration,
    /// Attempts for a reservation to win the stock record race.
    pub reserve_max_attempts: u32,
    /// Attempts for giving stock back. Higher than reserve: a lost release leaks stock.
    pub release_max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub sweep_interval: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(15 * 60),
            reserve_max_attempts: 3,
            release_max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CheckoutConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read overrides through `lookup`; missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let read = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::NotANumber {
                    name,
                    value: raw,
                }),
            }
        };
        let read_u32 = |name: &'static str, default: u32| -> Result<u32, ConfigError> {
            let value = read(name, u64::from(default))?;
            u32::try_from(value).map_err(|_| ConfigError::NotANumber {
                name,
                value: value.to_string(),
            })
        };

        let config = Self {
            reservation_ttl: Duration::from_secs(read(
                ENV_RESERVATION_TTL_SECS,
                defaults.reservation_ttl.as_secs(),
            )?),
            reserve_max_attempts: read_u32(ENV_RESERVE_MAX_ATTEMPTS, defaults.reserve_max_attempts)?,
            release_max_attempts: read_u32(ENV_RELEASE_MAX_ATTEMPTS, defaults.release_max_attempts)?,
            base_backoff: Duration::from_millis(read(
                ENV_BACKOFF_BASE_MS,
                defaults.base_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(read(
                ENV_BACKOFF_MAX_MS,
                defaults.max_backoff.as_millis() as u64,
            )?),
            sweep_interval: Duration::from_secs(read(
                ENV_SWEEP_INTERVAL_SECS,
                defaults.sweep_interval.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reservation_ttl.is_zero() {
            return Err(ConfigError::Zero {
                name: ENV_RESERVATION_TTL_SECS,
            });
        }
        if chrono::Duration::from_std(self.reservation_ttl).is_err() {
            return Err(ConfigError::Invalid("reservation ttl out of range".to_string()));
        }
        if self.reserve_max_attempts == 0 {
            return Err(ConfigError::Zero {
                name: ENV_RESERVE_MAX_ATTEMPTS,
            });
        }
        if self.release_max_attempts == 0 {
            return Err(ConfigError::Zero {
                name: ENV_RELEASE_MAX_ATTEMPTS,
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero {
                name: ENV_SWEEP_INTERVAL_SECS,
            });
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(
                "base backoff must not exceed max backoff".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_reserve_max_attempts(mut self, attempts: u32) -> Self {
        self.reserve_max_attempts = attempts;
        self
    }

    pub fn with_release_max_attempts(mut self, attempts: u32) -> Self {
        self.release_max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn reserve_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.reserve_max_attempts, self.base_backoff, self.max_backoff)
    }

    pub fn release_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.release_max_attempts, self.base_backoff, self.max_backoff)
    }
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
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_storefront_policy() {
        let config = CheckoutConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CheckoutConfig::default());
        assert_eq!(config.reservation_ttl, Duration::from_secs(900));
        assert_eq!(config.reserve_max_attempts, 3);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = CheckoutConfig::from_lookup(lookup(&[
            (ENV_RESERVATION_TTL_SECS, "60"),
            (ENV_RESERVE_MAX_ATTEMPTS, "5"),
            (ENV_BACKOFF_BASE_MS, " 1 "),
            (ENV_BACKOFF_MAX_MS, "4"),
            (ENV_SWEEP_INTERVAL_SECS, "2"),
        ]))
        .unwrap();

        assert_eq!(config.reservation_ttl, Duration::from_secs(60));
        assert_eq!(config.reserve_max_attempts, 5);
        assert_eq!(config.base_backoff, Duration::from_millis(1));
        assert_eq!(config.max_backoff, Duration::from_millis(4));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.reserve_retry().max_attempts, 5);
    }

    #[test]
    fn garbage_and_zero_values_are_rejected() {
        let err = CheckoutConfig::from_lookup(lookup(&[(ENV_RESERVE_MAX_ATTEMPTS, "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotANumber { .. }));

        let err =
            CheckoutConfig::from_lookup(lookup(&[(ENV_RESERVATION_TTL_SECS, "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                name: ENV_RESERVATION_TTL_SECS
            }
        );

        let err = CheckoutConfig::from_lookup(lookup(&[
            (ENV_BACKOFF_BASE_MS, "500"),
            (ENV_BACKOFF_MAX_MS, "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
