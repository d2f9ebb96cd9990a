//! Sliding window log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Algorithm, Decision, scripts, validate_window};
use crate::clock::Clock;
use crate::error::{ConfigError, StoreError};
use crate::store::{Script, Store};
use crate::types::RateLimitInfo;

/// Exact sliding window over a store-side log of admission timestamps.
///
/// Each consume prunes entries older than the window, counts survivors
/// and admits only while the count stays under the limit. One admission
/// records one log entry; cost beyond the first unit is not modeled by
/// this algorithm. The reported reset time is the full window length.
pub struct SlidingWindowLog {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_units: u64,
    window_millis: u64,
    // Entry members must be unique across processes sharing the log; a
    // random per-engine tag plus a local sequence keeps the script itself
    // deterministic.
    tag: u32,
    sequence: AtomicU64,
    increment: Script,
    introspect: Script,
    refund: Script,
}

impl SlidingWindowLog {
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
            tag: rand::random(),
            sequence: AtomicU64::new(0),
            increment: Script::new(scripts::SLIDING_WINDOW_LOG_INCREMENT),
            introspect: Script::new(scripts::SLIDING_WINDOW_LOG_INTROSPECT),
            refund: Script::new(scripts::SLIDING_WINDOW_LOG_REFUND),
        })
    }

    fn member(&self, now: u64) -> String {
        // Zero-padded so lexicographic member order matches insertion order
        // within one millisecond.
        format!(
            "{now:013}-{:08x}-{:016x}",
            self.tag,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn info(&self, identifier: &str, remaining_units: u64) -> RateLimitInfo {
        RateLimitInfo {
            policy_name: self.policy_name().to_string(),
            identifier: identifier.to_string(),
            window_seconds: self.window_seconds(),
            max_units: self.max_units,
            remaining_units,
            reset_in_seconds: self.window_seconds(),
        }
    }
}

#[async_trait]
impl Algorithm for SlidingWindowLog {
    fn policy_name(&self) -> &'static str {
        "sliding-window-log"
    }

    fn max_units(&self) -> u64 {
        self.max_units
    }

    fn window_seconds(&self) -> u64 {
        self.window_millis / 1000
    }

    async fn check(&self, identifier: &str) -> Result<RateLimitInfo, StoreError> {
        let now = self.clock.now_millis();
        let count = self
            .introspect
            .eval(
                self.store.as_ref(),
                &[identifier.to_string()],
                &[now.to_string(), self.window_millis.to_string()],
            )
            .await?
            .into_int()?;

        let count = count.max(0) as u64;
        Ok(self.info(identifier, self.max_units.saturating_sub(count)))
    }

    async fn consume(&self, identifier: &str, _cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let reply = self
            .increment
            .eval(
                self.store.as_ref(),
                &[identifier.to_string()],
                &[
                    self.max_units.to_string(),
                    self.window_millis.to_string(),
                    now.to_string(),
                    self.member(now),
                ],
            )
            .await?
            .into_array(2)?;

        let allowed = reply[0] == 1;
        let survivors = reply[1].max(0) as u64;
        let remaining = if allowed {
            self.max_units.saturating_sub(survivors + 1)
        } else {
            0
        };

        log::debug!(
            "sliding-window-log {identifier}: {survivors} live entries, allowed={allowed}"
        );

        Ok(Decision {
            allowed,
            info: self.info(identifier, remaining),
            reset_at_millis: now + self.window_millis,
        })
    }

    async fn refund(&self, identifier: &str, _value: u64) -> Result<u64, StoreError> {
        let count = self
            .refund
            .eval(self.store.as_ref(), &[identifier.to_string()], &[])
            .await?
            .into_int()?;

        Ok(self.max_units.saturating_sub(count.max(0) as u64))
    }

    async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        self.store.del(&[identifier.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const EPOCH: u64 = 1_700_000_000_000;

    fn engine(max: u64, window_secs: u64) -> (SlidingWindowLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine =
            SlidingWindowLog::new(store, clock.clone(), max, Duration::from_secs(window_secs))
                .unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn admits_until_the_log_is_full() {
        let (engine, _clock) = engine(2, 10);

        let first = engine.consume("caller", 1).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.info.remaining_units, 1);

        let second = engine.consume("caller", 1).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.info.remaining_units, 0);

        let third = engine.consume("caller", 1).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.info.remaining_units, 0);
        assert_eq!(third.info.reset_in_seconds, 10);
    }

    #[tokio::test]
    async fn entries_age_out_of_the_window() {
        let (engine, clock) = engine(1, 10);

        assert!(engine.consume("caller", 1).await.unwrap().allowed);
        assert!(!engine.consume("caller", 1).await.unwrap().allowed);

        clock.advance(10_001);
        assert_eq!(engine.check("caller").await.unwrap().remaining_units, 1);
        assert!(engine.consume("caller", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn refund_undoes_exactly_one_admission() {
        let (engine, clock) = engine(5, 10);

        engine.consume("caller", 1).await.unwrap();
        clock.advance(10);
        let before = engine.check("caller").await.unwrap().remaining_units;

        clock.advance(10);
        engine.consume("caller", 1).await.unwrap();
        engine.refund("caller", 1).await.unwrap();

        assert_eq!(engine.check("caller").await.unwrap().remaining_units, before);
    }

    #[tokio::test]
    async fn refund_on_an_empty_log_reports_full_quota() {
        let (engine, _clock) = engine(3, 10);
        assert_eq!(engine.refund("caller", 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reset_deletes_the_whole_log() {
        let (engine, _clock) = engine(2, 10);

        engine.consume("caller", 1).await.unwrap();
        engine.consume("caller", 1).await.unwrap();
        engine.reset("caller").await.unwrap();

        assert_eq!(engine.check("caller").await.unwrap().remaining_units, 2);
    }

    #[tokio::test]
    async fn zero_max_never_admits() {
        let (engine, _clock) = engine(0, 10);

        let decision = engine.consume("caller", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);
    }
}
