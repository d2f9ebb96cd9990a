//! In-process store with native execution of the engines' scripts.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ScriptOutput, Store};
use crate::algorithms::scripts;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Complete in-process implementation of the [`Store`] capability surface.
///
/// Suitable as a single-process backend and as the test double for the
/// distributed path: it recognizes the script bodies the engines ship and
/// executes the equivalent operations natively, holds keys to their
/// script-assigned expiry, and keeps a script cache that
/// [`flush_scripts`](MemoryStore::flush_scripts) can clear to exercise the
/// handle-eviction fallback.
///
/// The whole keyspace sits behind one mutex; holding it across a script
/// run is exactly what makes script execution atomic here.
pub struct MemoryStore {
    inner: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    // Key -> epoch millis deadline. Expired keys are dropped lazily on
    // access, like server-side lazy expiry.
    expirations: HashMap<String, u64>,
    scripts: HashMap<String, String>,
}

#[derive(Debug, Clone)]
enum Entry {
    Counter(i64),
    Hash(HashMap<String, String>),
    Log(Vec<(i64, String)>),
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose expiry follows the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    /// Drop every cached script, as a server-side `SCRIPT FLUSH` would.
    ///
    /// Loaded handles become unknown, so the next execution by handle
    /// fails with [`StoreError::NoScript`] and takes the body fallback.
    pub fn flush_scripts(&self) {
        self.lock().scripts.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Keyspace> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_script(
        keyspace: &mut Keyspace,
        body: &str,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        if body == scripts::FIXED_WINDOW_INCREMENT {
            keyspace.fixed_window_increment(keys, args, now)
        } else if body == scripts::SLIDING_WINDOW_INCREMENT {
            keyspace.sliding_window_increment(keys, args, now)
        } else if body == scripts::SLIDING_WINDOW_INTROSPECT {
            keyspace.sliding_window_introspect(keys, args, now)
        } else if body == scripts::SLIDING_WINDOW_LOG_INCREMENT {
            keyspace.sliding_window_log_increment(keys, args, now)
        } else if body == scripts::SLIDING_WINDOW_LOG_INTROSPECT {
            keyspace.sliding_window_log_introspect(keys, args, now)
        } else if body == scripts::SLIDING_WINDOW_LOG_REFUND {
            keyspace.sliding_window_log_refund(keys, now)
        } else if body == scripts::TOKEN_BUCKET_INCREMENT {
            keyspace.token_bucket_increment(keys, args, now)
        } else if body == scripts::TOKEN_BUCKET_REFUND {
            keyspace.token_bucket_refund(keys, args, now)
        } else {
            Err(StoreError::Query(
                "script body not supported by the in-process store".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();
        keyspace.purge(key, now);

        match keyspace.entries.get(key) {
            None => Ok(None),
            Some(Entry::Counter(n)) => Ok(Some(*n)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();
        keyspace.purge(key, now);
        keyspace.add(key, delta)
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();
        keyspace.purge(key, now);
        keyspace.add(key, delta.checked_neg().unwrap_or(i64::MAX))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();

        let mut removed = 0;
        for key in keys {
            keyspace.purge(key, now);
            if keyspace.entries.remove(key).is_some() {
                removed += 1;
            }
            keyspace.expirations.remove(key);
        }
        Ok(removed)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();
        keyspace.purge(key, now);

        match keyspace.entries.get(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry::Hash(map)) => Ok(fields.iter().map(|f| map.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn script_load(&self, body: &str) -> Result<String, StoreError> {
        let handle = script_handle(body);
        self.lock().scripts.insert(handle.clone(), body.to_string());
        Ok(handle)
    }

    async fn eval_by_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();

        let body = match keyspace.scripts.get(handle) {
            Some(body) => body.clone(),
            None => return Err(StoreError::NoScript),
        };
        Self::run_script(&mut keyspace, &body, keys, args, now)
    }

    async fn eval_by_body(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptOutput, StoreError> {
        let now = self.clock.now_millis();
        let mut keyspace = self.lock();

        // Submitting a body caches it, as a server-side EVAL would.
        keyspace
            .scripts
            .insert(script_handle(body), body.to_string());
        Self::run_script(&mut keyspace, body, keys, args, now)
    }
}

impl Keyspace {
    fn purge(&mut self, key: &str, now: u64) {
        if let Some(&deadline) = self.expirations.get(key)
            && deadline <= now
        {
            self.entries.remove(key);
            self.expirations.remove(key);
        }
    }

    fn counter(&self, key: &str) -> Result<i64, StoreError> {
        match self.entries.get(key) {
            None => Ok(0),
            Some(Entry::Counter(n)) => Ok(*n),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn add(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let value = self
            .counter(key)?
            .checked_add(delta)
            .ok_or_else(|| StoreError::Query("increment or decrement overflow".to_string()))?;
        self.entries.insert(key.to_string(), Entry::Counter(value));
        Ok(value)
    }

    fn expire(&mut self, key: &str, now: u64, ttl_millis: u64) {
        self.expirations.insert(key.to_string(), now + ttl_millis);
    }

    fn fixed_window_increment(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;
        let window = int_arg(args, 0)?;
        let cost = int_arg(args, 1)?;

        self.purge(key, now);
        let total = self.add(key, cost)?;
        if total == cost {
            self.expire(key, now, (window.max(0) as u64) * 2);
        }
        Ok(ScriptOutput::Int(total))
    }

    fn weighted_count(
        &mut self,
        keys: &[String],
        now_arg: i64,
        window: i64,
        store_now: u64,
    ) -> Result<f64, StoreError> {
        let previous_key = key_arg(keys, 0)?;
        let current_key = key_arg(keys, 1)?;
        if window <= 0 {
            return Err(StoreError::Query("window must be positive".to_string()));
        }

        self.purge(previous_key, store_now);
        self.purge(current_key, store_now);

        let previous = self.counter(previous_key)? as f64;
        let current = self.counter(current_key)? as f64;
        let elapsed = (now_arg.rem_euclid(window)) as f64 / window as f64;

        Ok(previous * (1.0 - elapsed) + current)
    }

    fn sliding_window_increment(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let max = int_arg(args, 0)?;
        let now_arg = int_arg(args, 1)?;
        let window = int_arg(args, 2)?;
        let cost = int_arg(args, 3)?;

        let weighted = self.weighted_count(keys, now_arg, window, now)?;
        let total = (weighted + cost as f64).ceil() as i64;

        if weighted + cost as f64 > max as f64 {
            return Ok(ScriptOutput::Int(total));
        }

        let current_key = key_arg(keys, 1)?;
        let written = self.add(current_key, cost)?;
        if written == cost {
            self.expire(current_key, now, (window as u64) * 2);
        }
        Ok(ScriptOutput::Int(total))
    }

    fn sliding_window_introspect(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let now_arg = int_arg(args, 0)?;
        let window = int_arg(args, 1)?;

        let weighted = self.weighted_count(keys, now_arg, window, now)?;
        Ok(ScriptOutput::Int(weighted.ceil() as i64))
    }

    fn log_entries(&mut self, key: &str) -> Result<Vec<(i64, String)>, StoreError> {
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Log(entries)) => Ok(entries.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn write_log(&mut self, key: &str, entries: Vec<(i64, String)>) {
        if entries.is_empty() {
            // An emptied sorted set disappears server-side.
            self.entries.remove(key);
            self.expirations.remove(key);
        } else {
            self.entries.insert(key.to_string(), Entry::Log(entries));
        }
    }

    fn sliding_window_log_increment(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;
        let max = int_arg(args, 0)?;
        let window = int_arg(args, 1)?;
        let now_arg = int_arg(args, 2)?;
        let member = str_arg(args, 3)?;

        self.purge(key, now);
        let mut entries = self.log_entries(key)?;
        entries.retain(|(score, _)| *score > now_arg - window);
        let count = entries.len() as i64;

        let admitted = count < max;
        if admitted {
            entries.retain(|(_, existing)| existing.as_str() != member);
            entries.push((now_arg, member.to_string()));
            entries.sort();
            self.expire(key, now, window.max(0) as u64);
        }
        self.write_log(key, entries);

        Ok(ScriptOutput::Array(vec![i64::from(admitted), count]))
    }

    fn sliding_window_log_introspect(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;
        let now_arg = int_arg(args, 0)?;
        let window = int_arg(args, 1)?;

        self.purge(key, now);
        let entries = self.log_entries(key)?;
        let live = entries
            .iter()
            .filter(|(score, _)| *score > now_arg - window)
            .count();
        Ok(ScriptOutput::Int(live as i64))
    }

    fn sliding_window_log_refund(
        &mut self,
        keys: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;

        self.purge(key, now);
        let mut entries = self.log_entries(key)?;
        entries.sort();
        entries.pop();
        let count = entries.len() as i64;
        self.write_log(key, entries);

        Ok(ScriptOutput::Int(count))
    }

    fn bucket_state(&self, key: &str) -> Result<Option<(i64, i64)>, StoreError> {
        let map = match self.entries.get(key) {
            None => return Ok(None),
            Some(Entry::Hash(map)) => map,
            Some(_) => return Err(wrong_type(key)),
        };

        let tokens = map.get("tokens").and_then(|raw| raw.parse().ok());
        let refilled_at = map.get("refilled_at").and_then(|raw| raw.parse().ok());
        match (tokens, refilled_at) {
            (Some(tokens), Some(refilled_at)) => Ok(Some((tokens, refilled_at))),
            _ => Ok(None),
        }
    }

    fn write_bucket(&mut self, key: &str, tokens: i64, refilled_at: i64) {
        let mut map = HashMap::new();
        map.insert("tokens".to_string(), tokens.to_string());
        map.insert("refilled_at".to_string(), refilled_at.to_string());
        self.entries.insert(key.to_string(), Entry::Hash(map));
    }

    fn token_bucket_increment(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;
        let max = int_arg(args, 0)?;
        let interval = int_arg(args, 1)?;
        let rate = int_arg(args, 2)?;
        let cost = int_arg(args, 3)?;
        let now_arg = int_arg(args, 4)?;
        if interval <= 0 || rate <= 0 {
            return Err(StoreError::Query(
                "interval and rate must be positive".to_string(),
            ));
        }

        self.purge(key, now);
        let (mut tokens, mut refilled_at) = match self.bucket_state(key)? {
            Some(state) => state,
            None => (max, now_arg),
        };

        let intervals = (now_arg - refilled_at) / interval;
        if intervals > 0 {
            tokens = max.min(tokens + intervals * rate);
            refilled_at += intervals * interval;
        }

        let admitted = tokens >= cost;
        if admitted {
            tokens -= cost;
        }
        self.write_bucket(key, tokens, refilled_at);

        let deficit = max - tokens;
        let full_at = if deficit > 0 {
            let full_at = refilled_at + (deficit as u64).div_ceil(rate as u64) as i64 * interval;
            self.expire(key, now, (full_at - now_arg + interval).max(0) as u64);
            full_at
        } else {
            self.expire(key, now, interval as u64);
            now_arg
        };

        Ok(ScriptOutput::Array(vec![
            i64::from(admitted),
            tokens,
            full_at,
        ]))
    }

    fn token_bucket_refund(
        &mut self,
        keys: &[String],
        args: &[String],
        now: u64,
    ) -> Result<ScriptOutput, StoreError> {
        let key = key_arg(keys, 0)?;
        let max = int_arg(args, 0)?;
        let value = int_arg(args, 1)?;

        self.purge(key, now);
        let Some((tokens, refilled_at)) = self.bucket_state(key)? else {
            return Ok(ScriptOutput::Int(max));
        };

        let tokens = max.min(tokens + value);
        self.write_bucket(key, tokens, refilled_at);
        Ok(ScriptOutput::Int(tokens))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Query(format!("WRONGTYPE operation against key {key:?}"))
}

fn script_handle(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    let mut handle = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(handle, "{byte:02x}");
    }
    handle
}

fn key_arg<'a>(keys: &'a [String], index: usize) -> Result<&'a str, StoreError> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Query(format!("script key {index} missing")))
}

fn str_arg<'a>(args: &'a [String], index: usize) -> Result<&'a str, StoreError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Query(format!("script argument {index} missing")))
}

fn int_arg(args: &[String], index: usize) -> Result<i64, StoreError> {
    str_arg(args, index)?
        .parse()
        .map_err(|_| StoreError::Query(format!("script argument {index} is not an integer")))
}
