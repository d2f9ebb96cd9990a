//! Token bucket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Algorithm, Decision, scripts};
use crate::clock::Clock;
use crate::error::{ConfigError, StoreError};
use crate::store::{Script, Store};
use crate::types::RateLimitInfo;

/// Token bucket with stepwise refill.
///
/// Store-side state is a hash of `tokens` and `refilled_at`. Consume
/// refills whole elapsed intervals before deciding; `check` deliberately
/// reads the stored snapshot without simulating refill, so check and
/// consume may briefly disagree. That is documented behavior, not a race.
pub struct TokenBucket {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_units: u64,
    interval_millis: u64,
    refill_rate: u64,
    increment: Script,
    refund: Script,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_units", &self.max_units)
            .field("interval_millis", &self.interval_millis)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// Create an engine; fails on a sub-second interval or a zero rate.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        max_units: u64,
        interval: Duration,
        refill_rate: u64,
    ) -> Result<Self, ConfigError> {
        if interval < Duration::from_secs(1) {
            return Err(ConfigError::IntervalTooShort);
        }
        if refill_rate == 0 {
            return Err(ConfigError::ZeroRefillRate);
        }

        Ok(Self {
            store,
            clock,
            max_units,
            interval_millis: interval.as_millis() as u64,
            refill_rate,
            increment: Script::new(scripts::TOKEN_BUCKET_INCREMENT),
            refund: Script::new(scripts::TOKEN_BUCKET_REFUND),
        })
    }

    /// Epoch millis at which a bucket holding `tokens` refills completely,
    /// counting whole intervals from `refilled_at`.
    fn full_at(&self, tokens: u64, refilled_at: u64) -> u64 {
        let deficit = self.max_units.saturating_sub(tokens);
        if deficit == 0 {
            return refilled_at;
        }
        refilled_at + deficit.div_ceil(self.refill_rate) * self.interval_millis
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
impl Algorithm for TokenBucket {
    fn policy_name(&self) -> &'static str {
        "token-bucket"
    }

    fn max_units(&self) -> u64 {
        self.max_units
    }

    fn window_seconds(&self) -> u64 {
        self.interval_millis / 1000
    }

    async fn check(&self, identifier: &str) -> Result<RateLimitInfo, StoreError> {
        let now = self.clock.now_millis();
        let fields = self
            .store
            .hmget(identifier, &["tokens", "refilled_at"])
            .await?;

        let tokens = parse_field(fields.first())?;
        let refilled_at = parse_field(fields.get(1))?;

        let (remaining, reset_in) = match (tokens, refilled_at) {
            (Some(tokens), Some(refilled_at)) => {
                let tokens = tokens.max(0) as u64;
                let full_at = self.full_at(tokens, refilled_at.max(0) as u64);
                (tokens, full_at.saturating_sub(now).div_ceil(1000))
            }
            // No record: the bucket is full by definition.
            _ => (self.max_units, 0),
        };

        Ok(self.info(identifier, remaining, reset_in))
    }

    async fn consume(&self, identifier: &str, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let reply = self
            .increment
            .eval(
                self.store.as_ref(),
                &[identifier.to_string()],
                &[
                    self.max_units.to_string(),
                    self.interval_millis.to_string(),
                    self.refill_rate.to_string(),
                    cost.to_string(),
                    now.to_string(),
                ],
            )
            .await?
            .into_array(3)?;

        let allowed = reply[0] == 1;
        let tokens = reply[1].max(0) as u64;
        let reset_at = reply[2].max(0) as u64;

        log::debug!(
            "token-bucket {identifier}: {tokens}/{} tokens left, allowed={allowed}",
            self.max_units
        );

        Ok(Decision {
            allowed,
            info: self.info(
                identifier,
                if allowed { tokens } else { 0 },
                reset_at.saturating_sub(now).div_ceil(1000),
            ),
            reset_at_millis: reset_at,
        })
    }

    async fn refund(&self, identifier: &str, value: u64) -> Result<u64, StoreError> {
        let tokens = self
            .refund
            .eval(
                self.store.as_ref(),
                &[identifier.to_string()],
                &[self.max_units.to_string(), value.to_string()],
            )
            .await?
            .into_int()?;

        Ok(tokens.max(0) as u64)
    }

    async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        self.store.del(&[identifier.to_string()]).await?;
        Ok(())
    }
}

fn parse_field(field: Option<&Option<String>>) -> Result<Option<i64>, StoreError> {
    match field {
        Some(Some(raw)) => raw
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Decode(format!("malformed bucket field: {raw:?}"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const EPOCH: u64 = 1_700_000_000_000;

    fn engine(max: u64, interval_secs: u64, rate: u64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine = TokenBucket::new(
            store,
            clock.clone(),
            max,
            Duration::from_secs(interval_secs),
            rate,
        )
        .unwrap();
        (engine, clock)
    }

    #[test]
    fn invalid_parameters_fail_at_construction() {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        let err = TokenBucket::new(store.clone(), clock.clone(), 10, Duration::ZERO, 1)
            .unwrap_err();
        assert_eq!(err, ConfigError::IntervalTooShort);

        let err = TokenBucket::new(store, clock, 10, Duration::from_secs(1), 0).unwrap_err();
        assert_eq!(err, ConfigError::ZeroRefillRate);
    }

    #[tokio::test]
    async fn drains_then_denies() {
        let (engine, _clock) = engine(5, 1, 1);

        let decision = engine.consume("caller", 5).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);

        let decision = engine.consume("caller", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);
        assert!(decision.info.reset_in_seconds > 0);
    }

    #[tokio::test]
    async fn refills_whole_elapsed_intervals() {
        let (engine, clock) = engine(5, 1, 1);

        engine.consume("caller", 5).await.unwrap();
        clock.advance(2_000);

        let decision = engine.consume("caller", 2).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.remaining_units, 0);
    }

    #[tokio::test]
    async fn partial_intervals_do_not_refill() {
        let (engine, clock) = engine(5, 1, 1);

        engine.consume("caller", 5).await.unwrap();
        clock.advance(999);

        assert!(!engine.consume("caller", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn cost_above_capacity_is_denied_even_when_full() {
        let (engine, _clock) = engine(5, 1, 1);

        let decision = engine.consume("caller", 6).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn refund_caps_at_capacity() {
        let (engine, _clock) = engine(5, 1, 1);

        engine.consume("caller", 2).await.unwrap();
        assert_eq!(engine.refund("caller", 10).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn refund_without_a_record_reports_a_full_bucket() {
        let (engine, _clock) = engine(5, 1, 1);
        assert_eq!(engine.refund("caller", 1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn check_reads_the_snapshot_without_refilling() {
        let (engine, clock) = engine(5, 1, 1);

        engine.consume("caller", 3).await.unwrap();
        clock.advance(2_000);

        // The stored snapshot still says two tokens.
        assert_eq!(engine.check("caller").await.unwrap().remaining_units, 2);

        // Consume does refill and sees 2 + 2 - 1 = 3 tokens left.
        let decision = engine.consume("caller", 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.remaining_units, 3);
    }

    #[tokio::test]
    async fn reset_deletes_the_bucket() {
        let (engine, _clock) = engine(5, 1, 1);

        engine.consume("caller", 5).await.unwrap();
        engine.reset("caller").await.unwrap();

        let decision = engine.consume("caller", 5).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn missing_record_checks_as_full() {
        let (engine, _clock) = engine(7, 1, 1);

        let info = engine.check("caller").await.unwrap();
        assert_eq!(info.remaining_units, 7);
        assert_eq!(info.reset_in_seconds, 0);
    }
}
