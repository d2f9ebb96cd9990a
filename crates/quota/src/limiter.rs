//! The orchestrating rate limiter.

use std::sync::Arc;

use crate::algorithms::{self, Algorithm, AlgorithmConfig};
use crate::cache::BlockCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, LimiterError};
use crate::store::Store;
use crate::types::{Operation, Pending, RateLimitInfo, RateLimitResult};

/// Binds one counting algorithm to one store and one block cache.
///
/// Identifiers are namespaced as `prefix:policy_name:identifier` before
/// they reach the engine, so limiters with different policies can share a
/// store without colliding. Store failures surface as [`LimiterError`]
/// tagged with the operation that failed.
///
/// `consume` first consults the block cache: a hit answers "blocked"
/// without a store round-trip, a miss always defers to the store. The
/// cache never admits on its own.
pub struct RateLimiter {
    engine: Arc<dyn Algorithm>,
    cache: Arc<BlockCache>,
    clock: Arc<dyn Clock>,
    prefix: String,
    policy_name: Option<String>,
}

impl RateLimiter {
    /// Start building a limiter over the given store and algorithm.
    pub fn builder(store: Arc<dyn Store>, algorithm: AlgorithmConfig) -> RateLimiterBuilder {
        RateLimiterBuilder {
            store,
            algorithm,
            cache: None,
            clock: None,
            prefix: "limit".to_string(),
            policy_name: None,
        }
    }

    /// The policy name used in keys and reported in results.
    pub fn policy_name(&self) -> &str {
        self.policy_name
            .as_deref()
            .unwrap_or_else(|| self.engine.policy_name())
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}:{identifier}", self.prefix, self.policy_name())
    }

    fn apply_policy_name(&self, info: &mut RateLimitInfo) {
        if let Some(name) = &self.policy_name {
            info.policy_name = name.clone();
        }
    }

    /// Read the remaining quota without consuming any of it.
    pub async fn check(&self, identifier: &str) -> Result<RateLimitInfo, LimiterError> {
        let key = self.key(identifier);
        let mut info = self
            .engine
            .check(&key)
            .await
            .map_err(|e| LimiterError::new(Operation::Check, e))?;

        self.apply_policy_name(&mut info);
        Ok(info)
    }

    /// Count `cost` against the identifier and decide admission.
    pub async fn consume(
        &self,
        identifier: &str,
        cost: u64,
    ) -> Result<RateLimitResult, LimiterError> {
        let key = self.key(identifier);
        let now = self.clock.now_millis();

        let status = self.cache.is_blocked(&key, now);
        if status.blocked {
            log::debug!("{key}: blocked locally until {}", status.reset_at);
            return Ok(RateLimitResult {
                info: RateLimitInfo {
                    policy_name: self.policy_name().to_string(),
                    identifier: key,
                    window_seconds: self.engine.window_seconds(),
                    max_units: self.engine.max_units(),
                    remaining_units: 0,
                    reset_in_seconds: status.reset_at.saturating_sub(now).div_ceil(1000),
                },
                allowed: false,
                pending: Pending::settled(),
            });
        }

        let decision = self
            .engine
            .consume(&key, cost)
            .await
            .map_err(|e| LimiterError::new(Operation::Consume, e))?;

        if !decision.allowed {
            self.cache.block_until(&key, decision.reset_at_millis);
        }

        let mut info = decision.info;
        self.apply_policy_name(&mut info);
        Ok(RateLimitResult {
            info,
            allowed: decision.allowed,
            pending: Pending::settled(),
        })
    }

    /// Restore previously consumed quota; returns the remaining units.
    ///
    /// The quantity can only shrink "used", never grow it.
    pub async fn refund(&self, identifier: &str, value: u64) -> Result<u64, LimiterError> {
        let key = self.key(identifier);
        self.engine
            .refund(&key, value)
            .await
            .map_err(|e| LimiterError::new(Operation::Refund, e))
    }

    /// Clear all counted state for the identifier.
    ///
    /// Also forgets any local block, so a reset identifier never stays
    /// blocked by a stale cache entry.
    pub async fn reset(&self, identifier: &str) -> Result<(), LimiterError> {
        let key = self.key(identifier);
        self.engine
            .reset(&key)
            .await
            .map_err(|e| LimiterError::new(Operation::Reset, e))?;

        self.cache.unblock(&key);
        Ok(())
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    store: Arc<dyn Store>,
    algorithm: AlgorithmConfig,
    cache: Option<Arc<BlockCache>>,
    clock: Option<Arc<dyn Clock>>,
    prefix: String,
    policy_name: Option<String>,
}

impl RateLimiterBuilder {
    /// Key namespace prefix; defaults to `"limit"`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Override the engine's declared policy name.
    pub fn policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = Some(name.into());
        self
    }

    /// Use a specific block cache, e.g. one shared across limiters.
    pub fn block_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a specific clock instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the algorithm parameters and build the limiter.
    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let engine = algorithms::build(self.algorithm, self.store, clock.clone())?;

        Ok(RateLimiter {
            engine,
            cache: self.cache.unwrap_or_default(),
            clock,
            prefix: self.prefix,
            policy_name: self.policy_name,
        })
    }
}
