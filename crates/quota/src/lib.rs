//! Distributed request admission control.
//!
//! This crate decides whether a caller identified by an opaque key may
//! proceed with a request of a given cost, and tracks the remaining quota.
//! Counting happens in a shared key-value store through single atomic
//! server-side scripts, so many processes can share one quota without
//! read-then-write races. A small in-process [`BlockCache`] short-circuits
//! callers that the store has already confirmed as blocked.
//!
//! Four interchangeable counting algorithms are provided behind the
//! [`algorithms::Algorithm`] contract:
//!
//! - fixed window counter
//! - sliding window counter
//! - sliding window log
//! - token bucket
//!
//! The [`RateLimiter`] binds one algorithm to one [`store::Store`] and one
//! block cache, namespaces identifiers, and wraps failures in a uniform
//! [`LimiterError`]. Response header rendering for the decision lives in
//! the sibling `limit-headers` crate.

#![deny(missing_docs)]

mod cache;
mod clock;
mod config;
mod error;
mod limiter;
mod types;

pub mod algorithms;
pub mod store;

pub use algorithms::AlgorithmConfig;
pub use cache::{BlockCache, BlockStatus, DEFAULT_BLOCK_CACHE_CAPACITY};
pub use clock::{Clock, SystemClock};
pub use config::{RedisConfig, RedisPoolConfig, StoreConfig};
pub use error::{ConfigError, LimiterError, StoreError};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use types::{Operation, Pending, RateLimitInfo, RateLimitResult};
