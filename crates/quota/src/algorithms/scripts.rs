//! Store-side script bodies shipped with the engines.
//!
//! The in-process [`MemoryStore`](crate::store::MemoryStore) recognizes
//! these bodies and executes the equivalent operations natively.

pub(crate) const FIXED_WINDOW_INCREMENT: &str =
    include_str!("scripts/fixed_window_increment.lua");

pub(crate) const SLIDING_WINDOW_INCREMENT: &str =
    include_str!("scripts/sliding_window_increment.lua");

pub(crate) const SLIDING_WINDOW_INTROSPECT: &str =
    include_str!("scripts/sliding_window_introspect.lua");

pub(crate) const SLIDING_WINDOW_LOG_INCREMENT: &str =
    include_str!("scripts/sliding_window_log_increment.lua");

pub(crate) const SLIDING_WINDOW_LOG_INTROSPECT: &str =
    include_str!("scripts/sliding_window_log_introspect.lua");

pub(crate) const SLIDING_WINDOW_LOG_REFUND: &str =
    include_str!("scripts/sliding_window_log_refund.lua");

pub(crate) const TOKEN_BUCKET_INCREMENT: &str =
    include_str!("scripts/token_bucket_increment.lua");

pub(crate) const TOKEN_BUCKET_REFUND: &str = include_str!("scripts/token_bucket_refund.lua");
