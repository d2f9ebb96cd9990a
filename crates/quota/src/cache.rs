//! In-process cache of identifiers known to be blocked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Number of identifiers tracked before the oldest entry is evicted.
pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 1000;

/// Result of a block-cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    /// Whether the identifier is currently known to be blocked.
    pub blocked: bool,
    /// When the block lifts, as epoch millis. Equals the lookup time when
    /// the identifier is not blocked.
    pub reset_at: u64,
}

/// Bounded map from identifier to the epoch-millis time its block lifts.
///
/// Entries are created after the store confirms a rejection and let later
/// calls skip the store round-trip entirely. The cache is an optimization
/// only: a hit means the store already said "blocked", a miss always
/// defers to the store. Expired entries are dropped lazily on read, and
/// when the cache is full the oldest-inserted entry is evicted first.
///
/// One instance is normally owned by a single [`RateLimiter`], but callers
/// may deliberately share an `Arc<BlockCache>` across limiters.
///
/// [`RateLimiter`]: crate::RateLimiter
#[derive(Debug)]
pub struct BlockCache {
    inner: Mutex<Entries>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Entries {
    reset_at: HashMap<String, u64>,
    // Insertion order. May hold ghosts of removed identifiers; eviction
    // skips them.
    order: VecDeque<String>,
}

impl BlockCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BLOCK_CACHE_CAPACITY)
    }

    /// Create a cache bounded to `capacity` identifiers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Look up an identifier, dropping the entry if it has expired.
    pub fn is_blocked(&self, identifier: &str, now: u64) -> BlockStatus {
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.reset_at.get(identifier).copied() {
            Some(reset_at) if reset_at > now => BlockStatus {
                blocked: true,
                reset_at,
            },
            Some(_) => {
                entries.reset_at.remove(identifier);
                BlockStatus {
                    blocked: false,
                    reset_at: now,
                }
            }
            None => BlockStatus {
                blocked: false,
                reset_at: now,
            },
        }
    }

    /// Record that `identifier` is blocked until `reset_at` (epoch millis).
    pub fn block_until(&self, identifier: &str, reset_at: u64) {
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if !entries.reset_at.contains_key(identifier) {
            while entries.reset_at.len() >= self.capacity {
                match entries.order.pop_front() {
                    Some(oldest) => {
                        entries.reset_at.remove(&oldest);
                    }
                    None => break,
                }
            }
            entries.order.push_back(identifier.to_string());
        }

        entries.reset_at.insert(identifier.to_string(), reset_at);
    }

    /// Forget any block recorded for `identifier`.
    pub fn unblock(&self, identifier: &str) {
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        entries.reset_at.remove(identifier);
    }

    /// Number of identifiers currently recorded as blocked.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_at
            .len()
    }

    /// Whether no identifier is currently recorded as blocked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_until_reset_passes() {
        let cache = BlockCache::new();
        cache.block_until("id", 5_000);

        let status = cache.is_blocked("id", 4_999);
        assert!(status.blocked);
        assert_eq!(status.reset_at, 5_000);

        let status = cache.is_blocked("id", 5_000);
        assert!(!status.blocked);
        assert_eq!(status.reset_at, 5_000);
    }

    #[test]
    fn expired_entry_is_gone_after_the_read() {
        let cache = BlockCache::new();
        cache.block_until("id", 5_000);

        assert!(!cache.is_blocked("id", 6_000).blocked);
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_identifier_is_not_blocked() {
        let cache = BlockCache::new();
        let status = cache.is_blocked("nobody", 1_234);

        assert!(!status.blocked);
        assert_eq!(status.reset_at, 1_234);
    }

    #[test]
    fn unblock_removes_the_entry() {
        let cache = BlockCache::new();
        cache.block_until("id", u64::MAX);
        cache.unblock("id");

        assert!(!cache.is_blocked("id", 0).blocked);
    }

    #[test]
    fn evicts_oldest_inserted_at_capacity() {
        let cache = BlockCache::with_capacity(2);
        cache.block_until("a", u64::MAX);
        cache.block_until("b", u64::MAX);
        cache.block_until("c", u64::MAX);

        assert_eq!(cache.len(), 2);
        assert!(!cache.is_blocked("a", 0).blocked);
        assert!(cache.is_blocked("b", 0).blocked);
        assert!(cache.is_blocked("c", 0).blocked);
    }

    #[test]
    fn reblocking_updates_reset_without_growing() {
        let cache = BlockCache::with_capacity(2);
        cache.block_until("a", 1_000);
        cache.block_until("a", 9_000);

        assert_eq!(cache.len(), 1);
        assert!(cache.is_blocked("a", 5_000).blocked);
    }
}
