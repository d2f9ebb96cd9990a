//! Sliding window counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Algorithm, Decision, clamp_remaining, scripts, validate_window};
use crate::clock::Clock;
use crate::error::{ConfigError, StoreError};
use crate::store::{Script, Store};
use crate::types::RateLimitInfo;

/// Smooths the fixed-window boundary burst by weighting the previous
/// window's count with the fraction of the window not yet elapsed.
///
/// Two counters per identifier, one per adjacent window bucket. Admission
/// compares `previous × (1 − elapsed) + current + cost` against the limit
/// and increments the current bucket only on allow.
pub struct SlidingWindowCounter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_units: u64,
    window_millis: u64,
    increment: Script,
    introspect: Script,
}

impl std::fmt::Debug for SlidingWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowCounter")
            .field("max_units", &self.max_units)
            .field("window_millis", &self.window_millis)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowCounter {
    /// Create an engine; fails if the window is shorter than one second.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        max_units: u64,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            store,
            clock,
            max_units,
            window_millis: validate_window(window)?,
            increment: Script::new(scripts::SLIDING_WINDOW_INCREMENT),
            introspect: Script::new(scripts::SLIDING_WINDOW_INTROSPECT),
        })
    }

    fn bucket_keys(&self, identifier: &str, now: u64) -> [String; 2] {
        let current = now / self.window_millis;
        let previous = current.saturating_sub(1);
        [
            format!("{identifier}:{previous}"),
            format!("{identifier}:{current}"),
        ]
    }

    fn window_reset_at(&self, now: u64) -> u64 {
        (now / self.window_millis + 1) * self.window_millis
    }

    fn info(&self, identifier: &str, remaining_units: u64, reset_in_seconds: u64) -> RateLimitInfo {
        RateLimitInfo {
            policy_name: self.policy_name().to_string(),
            identifier: identifier.to_string(),
            window_seconds: self.window_seconds(),
            max_units: self.max_units,
            remaining_units,
            reset_in_seconds,
        }
    }
}

#[async_trait]
impl Algorithm for SlidingWindowCounter {
    fn policy_name(&self) -> &'static str {
        "sliding-window-counter"
    }

    fn max_units(&self) -> u64 {
        self.max_units
    }

    fn window_seconds(&self) -> u64 {
        self.window_millis / 1000
    }

    async fn check(&self, identifier: &str) -> Result<RateLimitInfo, StoreError> {
        let now = self.clock.now_millis();
        let keys = self.bucket_keys(identifier, now);

        let used = self
            .introspect
            .eval(
                self.store.as_ref(),
                &keys,
                &[now.to_string(), self.window_millis.to_string()],
            )
            .await?
            .into_int()?;

        let reset_in = (self.window_reset_at(now) - now).div_ceil(1000);
        Ok(self.info(identifier, clamp_remaining(self.max_units, used), reset_in))
    }

    async fn consume(&self, identifier: &str, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let keys = self.bucket_keys(identifier, now);

        let total = self
            .increment
            .eval(
                self.store.as_ref(),
                &keys,
                &[
                    self.max_units.to_string(),
                    now.to_string(),
                    self.window_millis.to_string(),
                    cost.to_string(),
                ],
            )
            .await?
            .into_int()?;

        let allowed = total >= 0 && (total as u64) <= self.max_units;
        let reset_at = self.window_reset_at(now);
        let remaining = if allowed {
            clamp_remaining(self.max_units, total)
        } else {
            0
        };

        log::debug!(
            "sliding-window {identifier}: weighted total {total}/{} allowed={allowed}",
            self.max_units
        );

        Ok(Decision {
            allowed,
            info: self.info(identifier, remaining, (reset_at - now).div_ceil(1000)),
            reset_at_millis: reset_at,
        })
    }

    async fn refund(&self, identifier: &str, value: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let [_, current] = self.bucket_keys(identifier, now);
        let used = self.store.decr_by(&current, value as i64).await?;

        Ok(clamp_remaining(self.max_units, used))
    }

    async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.store
            .del(&self.bucket_keys(identifier, now))
            .await?;
        Ok(())
    }
}
