//! Store adapters and the atomic script execution protocol.
//!
//! Engines talk to their backing store exclusively through the [`Store`]
//! capability surface. Every authoritative check-and-increment is one
//! server-side script execution, so the store arbitrates races between
//! concurrent callers, never process memory.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Value returned by a store-side script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutput {
    /// No value.
    Nil,
    /// A single integer.
    Int(i64),
    /// An array of integers.
    Array(Vec<i64>),
}

impl ScriptOutput {
    /// Interpret the reply as a single integer.
    pub fn into_int(self) -> Result<i64, StoreError> {
        match self {
            Self::Int(n) => Ok(n),
            other => Err(StoreError::Decode(format!(
                "expected integer script reply, got {other:?}"
            ))),
        }
    }

    /// Interpret the reply as an array of at least `len` integers.
    pub fn into_array(self, len: usize) -> Result<Vec<i64>, StoreError> {
        match self {
            Self::Array(items) if items.len() >= len => Ok(items),
            other => Err(StoreError::Decode(format!(
                "expected array script reply of at least {len} integers, got {other:?}"
            ))),
        }
    }
}

/// Capability surface the algorithm engines require from a store.
///
/// Implementations must make [`eval_by_handle`](Store::eval_by_handle)
/// fail with [`StoreError::NoScript`], and nothing else, when the handle
/// is not present in the store's script cache, so the execution protocol
/// can tell eviction apart from genuine failures.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read an integer value; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Atomically add `delta` to a counter, creating it at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Atomically subtract `delta` from a counter, creating it at zero.
    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Read multiple fields of a hash; `None` per missing field or key.
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError>;

    /// Load a script into the store's script cache, returning its handle.
    async fn script_load(&self, body: &str) -> Result<String, StoreError>;

    /// Execute a previously loaded script by handle.
    async fn eval_by_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError>;

    /// Execute a script by submitting its full body.
    async fn eval_by_body(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError>;
}

/// A store-side script with a lazily loaded, memoized handle.
///
/// The handle is loaded through the store once per engine instance and
/// reused afterwards. Execution goes by handle; if the store reports the
/// handle unknown (evicted from its script cache), the full body is
/// submitted exactly once and that result is authoritative. Any other
/// store error propagates unchanged.
#[derive(Debug)]
pub(crate) struct Script {
    body: &'static str,
    handle: OnceCell<String>,
}

impl Script {
    pub(crate) const fn new(body: &'static str) -> Self {
        Self {
            body,
            handle: OnceCell::const_new(),
        }
    }

    pub(crate) async fn eval(
        &self,
        store: &dyn Store,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        let handle = self
            .handle
            .get_or_try_init(|| store.script_load(self.body))
            .await?;

        match store.eval_by_handle(handle, keys, args).await {
            Err(StoreError::NoScript) => {
                log::warn!("script handle {handle} evicted from store cache, resending body");
                store.eval_by_body(self.body, keys, args).await
            }
            other => other,
        }
    }
}

/// Build a store from configuration.
pub async fn from_config(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Redis(redis) => Ok(Arc::new(RedisStore::connect(redis).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn script_output_accessors() {
        assert_eq!(ScriptOutput::Int(7).into_int().unwrap(), 7);
        assert!(ScriptOutput::Nil.into_int().is_err());

        let array = ScriptOutput::Array(vec![1, 2, 3]);
        assert_eq!(array.into_array(3).unwrap(), vec![1, 2, 3]);
        assert!(ScriptOutput::Array(vec![1]).into_array(2).is_err());
        assert!(ScriptOutput::Int(1).into_array(1).is_err());
    }

    /// Store stub that rejects handles so the fallback path can be counted.
    #[derive(Default)]
    struct EvictingStore {
        loads: AtomicUsize,
        handle_calls: AtomicUsize,
        body_calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for EvictingStore {
        async fn get(&self, _key: &str) -> Result<Option<i64>, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn incr_by(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn decr_by(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn del(&self, _keys: &[String]) -> Result<u64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn hmget(
            &self,
            _key: &str,
            _fields: &[&str],
        ) -> Result<Vec<Option<String>>, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn script_load(&self, _body: &str) -> Result<String, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok("handle".to_string())
        }

        async fn eval_by_handle(
            &self,
            _handle: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<ScriptOutput, StoreError> {
            self.handle_calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NoScript)
        }

        async fn eval_by_body(
            &self,
            _body: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<ScriptOutput, StoreError> {
            self.body_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptOutput::Int(42))
        }
    }

    #[tokio::test]
    async fn falls_back_to_body_exactly_once_on_evicted_handle() {
        let store = EvictingStore::default();
        let script = Script::new("return 42");

        let out = script.eval(&store, &[], &[]).await.unwrap();
        assert_eq!(out, ScriptOutput::Int(42));
        assert_eq!(store.handle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.body_calls.load(Ordering::SeqCst), 1);

        // The handle stays memoized; a later call does not reload.
        let out = script.eval(&store, &[], &[]).await.unwrap();
        assert_eq!(out, ScriptOutput::Int(42));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    /// Store stub whose handle execution fails with a non-eviction error.
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<i64>, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn incr_by(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn decr_by(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn del(&self, _keys: &[String]) -> Result<u64, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn hmget(
            &self,
            _key: &str,
            _fields: &[&str],
        ) -> Result<Vec<Option<String>>, StoreError> {
            unimplemented!("not used by these tests")
        }

        async fn script_load(&self, _body: &str) -> Result<String, StoreError> {
            Ok("handle".to_string())
        }

        async fn eval_by_handle(
            &self,
            _handle: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<ScriptOutput, StoreError> {
            Err(StoreError::Query("READONLY replica".to_string()))
        }

        async fn eval_by_body(
            &self,
            _body: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<ScriptOutput, StoreError> {
            panic!("body fallback must not run for non-eviction errors");
        }
    }

    #[tokio::test]
    async fn non_eviction_errors_propagate_without_fallback() {
        let script = Script::new("return 1");

        let err = script.eval(&BrokenStore, &[], &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
