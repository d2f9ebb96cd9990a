//! The counting algorithm engines.
//!
//! Four interchangeable engines implement the [`Algorithm`] contract. Each
//! owns its key scheme, its store-side script set and its policy
//! semantics; the store arbitrates every race through one atomic script
//! execution per decision.

mod fixed_window;
mod sliding_window;
mod sliding_window_log;
mod token_bucket;

pub(crate) mod scripts;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindowCounter;
pub use sliding_window_log::SlidingWindowLog;
pub use token_bucket::TokenBucket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ConfigError, StoreError};
use crate::store::Store;
use crate::types::RateLimitInfo;

/// Outcome of a consume round-trip, before orchestration.
#[derive(Debug)]
pub struct Decision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Quota facts at the moment of the decision.
    pub info: RateLimitInfo,
    /// Epoch millis at which the identifier stops being over limit; used
    /// by the orchestrator to record a local block after a denial.
    pub reset_at_millis: u64,
}

/// Contract shared by the four counting engines.
///
/// Identifiers arriving here are already namespaced by the orchestrator.
/// Engines never hide store failures; wrapping for diagnostics happens one
/// layer up.
#[async_trait]
pub trait Algorithm: Send + Sync {
    /// Name the engine declares for itself, used in key namespacing and
    /// policy headers unless overridden.
    fn policy_name(&self) -> &'static str;

    /// Maximum units permitted per window.
    fn max_units(&self) -> u64;

    /// Window (or refill interval) length in seconds.
    fn window_seconds(&self) -> u64;

    /// Read the remaining quota without consuming any of it.
    async fn check(&self, identifier: &str) -> Result<RateLimitInfo, StoreError>;

    /// Count `cost` against the identifier and decide admission.
    async fn consume(&self, identifier: &str, cost: u64) -> Result<Decision, StoreError>;

    /// Restore previously consumed quota; returns the remaining units.
    async fn refund(&self, identifier: &str, value: u64) -> Result<u64, StoreError>;

    /// Delete all counted state for the identifier.
    async fn reset(&self, identifier: &str) -> Result<(), StoreError>;
}

/// Algorithm selection and parameters, validated at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum AlgorithmConfig {
    /// Fixed window counter.
    FixedWindow {
        /// Maximum units per window.
        max_units: u64,
        /// Window length; at least one second.
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
    },
    /// Sliding window counter (weighted previous window).
    SlidingWindowCounter {
        /// Maximum units per window.
        max_units: u64,
        /// Window length; at least one second.
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
    },
    /// Exact sliding window over a log of admission timestamps.
    SlidingWindowLog {
        /// Maximum admissions per window.
        max_units: u64,
        /// Window length; at least one second.
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
    },
    /// Token bucket with stepwise refill.
    TokenBucket {
        /// Bucket capacity.
        max_units: u64,
        /// Refill interval; at least one second.
        #[serde(deserialize_with = "deserialize_duration")]
        interval: Duration,
        /// Tokens added per interval; greater than zero.
        refill_rate: u64,
    },
}

/// Build the engine selected by `config` against the given store.
pub fn build(
    config: AlgorithmConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Algorithm>, ConfigError> {
    match config {
        AlgorithmConfig::FixedWindow { max_units, window } => {
            Ok(Arc::new(FixedWindow::new(store, clock, max_units, window)?))
        }
        AlgorithmConfig::SlidingWindowCounter { max_units, window } => Ok(Arc::new(
            SlidingWindowCounter::new(store, clock, max_units, window)?,
        )),
        AlgorithmConfig::SlidingWindowLog { max_units, window } => Ok(Arc::new(
            SlidingWindowLog::new(store, clock, max_units, window)?,
        )),
        AlgorithmConfig::TokenBucket {
            max_units,
            interval,
            refill_rate,
        } => Ok(Arc::new(TokenBucket::new(
            store,
            clock,
            max_units,
            interval,
            refill_rate,
        )?)),
    }
}

/// Remaining units after `used` of `max`, clamped into `0..=max`.
///
/// `used` can exceed `max` after a denial and can go negative after a
/// refund landed in a fresh window.
pub(crate) fn clamp_remaining(max: u64, used: i64) -> u64 {
    if used <= 0 {
        max
    } else {
        max.saturating_sub(used as u64)
    }
}

/// Reject windows shorter than one second.
pub(crate) fn validate_window(window: Duration) -> Result<u64, ConfigError> {
    if window < Duration::from_secs(1) {
        return Err(ConfigError::WindowTooShort);
    }
    Ok(window.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_remaining_into_range() {
        assert_eq!(clamp_remaining(10, -3), 10);
        assert_eq!(clamp_remaining(10, 0), 10);
        assert_eq!(clamp_remaining(10, 4), 6);
        assert_eq!(clamp_remaining(10, 15), 0);
    }

    #[test]
    fn deserializes_algorithm_config_from_toml() {
        let toml = r#"
            algorithm = "token-bucket"
            max_units = 500
            interval = "1m"
            refill_rate = 50
        "#;
        let config: AlgorithmConfig = toml::from_str(toml).unwrap();

        let AlgorithmConfig::TokenBucket {
            max_units,
            interval,
            refill_rate,
        } = config
        else {
            panic!("expected token bucket config");
        };
        assert_eq!(max_units, 500);
        assert_eq!(interval, Duration::from_secs(60));
        assert_eq!(refill_rate, 50);
    }

    #[test]
    fn rejects_unknown_algorithm_names() {
        let toml = r#"
            algorithm = "leaky-bucket"
            max_units = 10
            window = "1s"
        "#;
        let result: Result<AlgorithmConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }
}
