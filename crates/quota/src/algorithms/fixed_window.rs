//! Fixed window counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Algorithm, Decision, clamp_remaining, scripts, validate_window};
use crate::clock::Clock;
use crate::error::{ConfigError, StoreError};
use crate::store::{Script, Store};
use crate::types::RateLimitInfo;

/// Counts cost against `identifier:bucket` where the bucket index is
/// `floor(now / window)`.
///
/// The counter increments even past the limit, which keeps admission a
/// single atomic round-trip. A caller can burst up to twice the limit
/// across a window boundary; that is inherent to the algorithm.
pub struct FixedWindow {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_units: u64,
    window_millis: u64,
    increment: Script,
}

impl std::fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow")
            .field("max_units", &self.max_units)
            .field("window_millis", &self.window_millis)
            .finish_non_exhaustive()
    }
}

impl FixedWindow {
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
            increment: Script::new(scripts::FIXED_WINDOW_INCREMENT),
        })
    }

    fn bucket_key(&self, identifier: &str, now: u64) -> String {
        format!("{identifier}:{}", now / self.window_millis)
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
impl Algorithm for FixedWindow {
    fn policy_name(&self) -> &'static str {
        "fixed-window"
    }

    fn max_units(&self) -> u64 {
        self.max_units
    }

    fn window_seconds(&self) -> u64 {
        self.window_millis / 1000
    }

    async fn check(&self, identifier: &str) -> Result<RateLimitInfo, StoreError> {
        let now = self.clock.now_millis();
        let used = self
            .store
            .get(&self.bucket_key(identifier, now))
            .await?
            .unwrap_or(0);

        let reset_in = (self.window_reset_at(now) - now).div_ceil(1000);
        Ok(self.info(identifier, clamp_remaining(self.max_units, used), reset_in))
    }

    async fn consume(&self, identifier: &str, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let key = self.bucket_key(identifier, now);

        let total = self
            .increment
            .eval(
                self.store.as_ref(),
                &[key],
                &[self.window_millis.to_string(), cost.to_string()],
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
            "fixed-window {identifier}: total {total}/{} allowed={allowed}",
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
        let used = self
            .store
            .decr_by(&self.bucket_key(identifier, now), value as i64)
            .await?;

        Ok(clamp_remaining(self.max_units, used))
    }

    async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.store
            .del(&[self.bucket_key(identifier, now)])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    // Aligned to a window boundary for windows dividing 10s.
    const EPOCH: u64 = 1_700_000_000_000;

    fn engine(max: u64, window_secs: u64) -> (FixedWindow, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine = FixedWindow::new(
            store,
            clock.clone(),
            max,
            Duration::from_secs(window_secs),
        )
        .unwrap();
        (engine, clock)
    }

    #[test]
    fn rejects_subsecond_window() {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let err = FixedWindow::new(store, clock, 10, Duration::from_millis(500)).unwrap_err();
        assert_eq!(err, ConfigError::WindowTooShort);
    }

    #[tokio::test]
    async fn allows_exactly_max_then_rejects_in_order() {
        let (engine, _clock) = engine(3, 10);

        for expected_remaining in [2, 1, 0] {
            let decision = engine.consume("caller", 1).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.info.remaining_units, expected_remaining);
        }

        let decision = engine.consume("caller", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);
        assert!(decision.info.reset_in_seconds > 0);
    }

    #[tokio::test]
    async fn allowed_again_after_the_window_turns() {
        let (engine, clock) = engine(1, 10);

        assert!(engine.consume("caller", 1).await.unwrap().allowed);
        let denied = engine.consume("caller", 1).await.unwrap();
        assert!(!denied.allowed);

        clock.advance(denied.info.reset_in_seconds * 1000);
        assert!(engine.consume("caller", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn zero_max_rejects_everything() {
        let (engine, _clock) = engine(0, 10);

        let decision = engine.consume("caller", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);
    }

    #[tokio::test]
    async fn cost_decrements_remaining_exactly() {
        let (engine, _clock) = engine(10, 10);

        let decision = engine.consume("caller", 4).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.remaining_units, 6);

        let info = engine.check("caller").await.unwrap();
        assert_eq!(info.remaining_units, 6);
    }

    #[tokio::test]
    async fn refund_restores_the_current_window() {
        let (engine, _clock) = engine(10, 10);

        engine.consume("caller", 5).await.unwrap();
        let remaining = engine.refund("caller", 2).await.unwrap();
        assert_eq!(remaining, 7);
    }

    #[tokio::test]
    async fn refund_after_rollover_does_not_resurrect_the_old_window() {
        let (engine, clock) = engine(5, 10);

        engine.consume("caller", 5).await.unwrap();
        clock.advance(10_000);

        // The refund lands in the fresh window; remaining is clamped to max.
        let remaining = engine.refund("caller", 3).await.unwrap();
        assert_eq!(remaining, 5);
        assert_eq!(engine.check("caller").await.unwrap().remaining_units, 5);
    }

    #[tokio::test]
    async fn reset_clears_the_bucket() {
        let (engine, _clock) = engine(2, 10);

        engine.consume("caller", 2).await.unwrap();
        engine.reset("caller").await.unwrap();

        assert_eq!(engine.check("caller").await.unwrap().remaining_units, 2);
    }

    #[tokio::test]
    async fn callers_are_counted_separately() {
        let (engine, _clock) = engine(1, 10);

        assert!(engine.consume("a", 1).await.unwrap().allowed);
        assert!(engine.consume("b", 1).await.unwrap().allowed);
        assert!(!engine.consume("a", 1).await.unwrap().allowed);
    }
}
