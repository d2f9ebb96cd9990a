//! Error types for admission control.

use crate::types::Operation;

/// Invalid algorithm parameters, rejected at construction time.
///
/// A limiter that fails construction is unusable; configuration problems
/// never surface on the first call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The counting window is shorter than one second.
    #[error("window must be at least one second")]
    WindowTooShort,
    /// The token bucket refill interval is shorter than one second.
    #[error("refill interval must be at least one second")]
    IntervalTooShort,
    /// The token bucket refill rate is zero.
    #[error("refill rate must be greater than zero")]
    ZeroRefillRate,
}

/// Failure reported by a store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or the connection was lost.
    #[error("store connection error: {0}")]
    Connection(String),
    /// The store rejected or failed a command.
    #[error("store query error: {0}")]
    Query(String),
    /// A script handle was not present in the store's script cache.
    ///
    /// Distinct from [`StoreError::Query`] so the execution protocol can
    /// fall back to submitting the full script body exactly once.
    #[error("script not present in the store's script cache")]
    NoScript,
    /// The store replied with data the engine could not interpret.
    #[error("unexpected store reply: {0}")]
    Decode(String),
}

/// Failure of a limiter operation, tagged with the operation that failed.
///
/// The underlying [`StoreError`] is preserved as the error source for
/// diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("rate limit {operation} failed")]
pub struct LimiterError {
    operation: Operation,
    #[source]
    source: StoreError,
}

impl LimiterError {
    pub(crate) fn new(operation: Operation, source: StoreError) -> Self {
        Self { operation, source }
    }

    /// The operation that failed.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The store failure that caused this error.
    pub fn store_error(&self) -> &StoreError {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn limiter_error_preserves_cause() {
        let err = LimiterError::new(Operation::Consume, StoreError::Query("boom".into()));

        assert_eq!(err.operation(), Operation::Consume);
        assert_eq!(err.to_string(), "rate limit consume failed");
        assert_eq!(err.source().unwrap().to_string(), "store query error: boom");
    }
}
