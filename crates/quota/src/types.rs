//! Shared result types.

use std::fmt;

use tokio::task::JoinHandle;

/// The operations a limiter exposes, used to tag wrapped failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read the remaining quota without consuming.
    Check,
    /// Consume cost and decide admission.
    Consume,
    /// Restore previously consumed quota.
    Refund,
    /// Clear all counted state for an identifier.
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Check => "check",
            Operation::Consume => "consume",
            Operation::Refund => "refund",
            Operation::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Quota facts for one identifier at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Name of the policy that produced this result.
    pub policy_name: String,
    /// The namespaced identifier the quota is counted against.
    pub identifier: String,
    /// Length of the counting window (or refill interval) in seconds.
    pub window_seconds: u64,
    /// Maximum units permitted per window.
    pub max_units: u64,
    /// Units still available; always within `0..=max_units`.
    pub remaining_units: u64,
    /// Seconds until the quota next replenishes; suitable for `Retry-After`.
    pub reset_in_seconds: u64,
}

/// An admission decision plus any deferred side effect it carries.
#[derive(Debug)]
pub struct RateLimitResult {
    /// Quota facts at the moment of the decision.
    pub info: RateLimitInfo,
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Side effect of the decision, if any is still in flight.
    pub pending: Pending,
}

/// A deferred unit of work attached to a decision.
///
/// Admission decisions sometimes carry a fire-and-forget side effect such
/// as an asynchronous bookkeeping write. The decision itself never waits
/// for it; callers that care can [`settle`](Pending::settle) it, everyone
/// else can drop it. Most results carry an already-settled `Pending`.
#[derive(Debug, Default)]
pub struct Pending(Option<JoinHandle<()>>);

impl Pending {
    /// A side effect that has already settled (the common case).
    pub fn settled() -> Self {
        Self(None)
    }

    /// Track a spawned side effect until it settles.
    pub fn task(handle: JoinHandle<()>) -> Self {
        Self(Some(handle))
    }

    /// Wait until the side effect has settled.
    ///
    /// A panicked or cancelled task counts as settled; the decision it was
    /// attached to is unaffected either way.
    pub async fn settle(self) {
        if let Some(handle) = self.0 {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settled_pending_resolves_immediately() {
        Pending::settled().settle().await;
    }

    #[tokio::test]
    async fn task_pending_waits_for_the_side_effect() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let pending = Pending::task(tokio::spawn(async move {
            let _ = tx.send(());
        }));

        pending.settle().await;
        rx.await.expect("side effect ran before settle returned");
    }

    #[test]
    fn operations_display_as_lowercase_names() {
        assert_eq!(Operation::Check.to_string(), "check");
        assert_eq!(Operation::Consume.to_string(), "consume");
        assert_eq!(Operation::Refund.to_string(), "refund");
        assert_eq!(Operation::Reset.to_string(), "reset");
    }
}
