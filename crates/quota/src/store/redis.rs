//! Redis store adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{self, Metrics};
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, ErrorKind, RedisError};

use super::{ScriptOutput, Store};
use crate::config::RedisConfig;
use crate::error::StoreError;

type Pool = managed::Pool<Manager>;

/// Deadpool manager for multiplexed Redis connections.
#[derive(Debug)]
struct Manager {
    client: Client,
    response_timeout: Duration,
    connection_timeout: Duration,
    ping_number: AtomicUsize,
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, RedisError> {
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(self.connection_timeout)
            .set_response_timeout(self.response_timeout);

        self.client
            .get_multiplexed_async_connection_with_config(&config)
            .await
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        _: &Metrics,
    ) -> managed::RecycleResult<RedisError> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let (n,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .arg(&ping_number)
            .query_async::<(String,)>(conn)
            .await?;

        if n == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

/// Redis-backed implementation of the [`Store`] capability surface.
///
/// Counters, logs and buckets live server-side, so any number of
/// processes sharing the same Redis share the same quota. Script
/// execution maps onto `SCRIPT LOAD` / `EVALSHA` / `EVAL`, with the
/// server's `NOSCRIPT` reply surfaced as [`StoreError::NoScript`].
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis and verify the server responds to PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let manager = Manager {
            client,
            response_timeout: config.response_timeout.unwrap_or(Duration::from_secs(1)),
            connection_timeout: config.connection_timeout.unwrap_or(Duration::from_secs(5)),
            ping_number: AtomicUsize::new(0),
        };

        let mut pool_config = managed::PoolConfig::default();
        if let Some(max_size) = config.pool.max_size {
            pool_config.max_size = max_size;
        }
        pool_config.timeouts.create = config.pool.timeout_create;
        pool_config.timeouts.wait = config.pool.timeout_wait;
        pool_config.timeouts.recycle = config.pool.timeout_recycle;

        let pool = Pool::builder(manager)
            .config(pool_config)
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(format!("failed to build pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn conn(&self) -> Result<managed::Object<Manager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn eval(
        &self,
        mut cmd: redis::Cmd,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        cmd.arg(keys.len());
        for key in keys {
            cmd.arg(self.prefixed(key));
        }
        for arg in args {
            cmd.arg(arg);
        }

        let mut conn = self.conn().await?;
        let value: redis::Value = cmd.query_async(&mut *conn).await.map_err(map_err)?;
        script_output(value)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(self.prefixed(key))
            .query_async(&mut *conn)
            .await
            .map_err(map_err)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("INCRBY")
            .arg(self.prefixed(key))
            .arg(delta)
            .query_async(&mut *conn)
            .await
            .map_err(map_err)
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DECRBY")
            .arg(self.prefixed(key))
            .arg(delta)
            .query_async(&mut *conn)
            .await
            .map_err(map_err)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(self.prefixed(key));
        }

        let mut conn = self.conn().await?;
        cmd.query_async(&mut *conn).await.map_err(map_err)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.prefixed(key));
        for field in fields {
            cmd.arg(*field);
        }

        let mut conn = self.conn().await?;
        cmd.query_async(&mut *conn).await.map_err(map_err)
    }

    async fn script_load(&self, body: &str) -> Result<String, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut *conn)
            .await
            .map_err(map_err)
    }

    async fn eval_by_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle);
        self.eval(cmd, keys, args).await
    }

    async fn eval_by_body(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(body);
        self.eval(cmd, keys, args).await
    }
}

fn map_err(error: RedisError) -> StoreError {
    if error.kind() == ErrorKind::NoScriptError {
        StoreError::NoScript
    } else if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        StoreError::Connection(error.to_string())
    } else {
        StoreError::Query(error.to_string())
    }
}

fn script_output(value: redis::Value) -> Result<ScriptOutput, StoreError> {
    use redis::Value;

    match value {
        Value::Nil => Ok(ScriptOutput::Nil),
        Value::Int(n) => Ok(ScriptOutput::Int(n)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Int(n) => Ok(n),
                other => Err(StoreError::Decode(format!(
                    "unexpected script reply element: {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ScriptOutput::Array),
        other => Err(StoreError::Decode(format!(
            "unexpected script reply: {other:?}"
        ))),
    }
}
