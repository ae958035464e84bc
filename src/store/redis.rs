//! Backing store client for Redis.
//!
//! A thin adapter over a pooled Redis connection providing the primitives the
//! admission algorithms need: TTL-bearing keys, sorted-set operations and a
//! server-side atomic script facility. Every call is a single round-trip and
//! carries the configured deadline; expiry is reported as
//! [`StoreError::Timeout`], which the circuit breaker treats like any other
//! store failure.

use std::future::Future;
use std::time::Duration;

use deadpool_redis::redis::{self, ErrorKind, FromRedisValue, RedisError};
use deadpool_redis::{Config, Connection, Pool, PoolError, Runtime};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::StoreConfig;

/// Errors raised by backing store interactions.
///
/// This is the sole failure signal the circuit breaker consumes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection could not be established or was lost.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The per-call deadline expired.
    #[error("store call timed out after {0} ms")]
    Timeout(u64),

    /// The store replied with something unexpected.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            ErrorKind::IoError => StoreError::Connection(err.to_string()),
            _ => StoreError::Protocol(err.to_string()),
        }
    }
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// A server-side atomic script.
///
/// The handle caches the SHA returned by `SCRIPT LOAD`; when the store
/// answers NOSCRIPT (for example after a restart), [`RedisStore::eval_script`]
/// re-registers the source and retries once.
#[derive(Debug)]
pub struct ScriptHandle {
    source: &'static str,
    sha: Mutex<Option<String>>,
}

impl ScriptHandle {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            sha: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    fn sha(&self) -> Option<String> {
        self.sha.lock().clone()
    }

    fn set_sha(&self, sha: &str) {
        *self.sha.lock() = Some(sha.to_string());
    }
}

/// Pooled client for the backing store.
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
}

impl RedisStore {
    /// Build the connection pool. Connections are established lazily; use
    /// [`RedisStore::connect`] to also verify reachability at startup.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = Config::from_url(config.url())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            pool,
            timeout: config.timeout(),
        })
    }

    /// Build the pool and verify the store answers a `PING`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        store.ping().await?;
        debug!(url = %config.url(), "connected to backing store");
        Ok(store)
    }

    /// Run a store interaction under the per-call deadline.
    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    /// Health probe.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            Ok(redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await?)
        })
        .await
    }

    pub async fn zremrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            Ok(redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await?)
        })
        .await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let set: i64 = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            Ok(set == 1)
        })
        .await
    }

    /// Register a script with the store, caching its SHA in the handle.
    ///
    /// Called once at startup for each algorithm script; a failure here is
    /// not fatal since [`RedisStore::eval_script`] loads on demand.
    pub async fn register_script(&self, script: &ScriptHandle) -> Result<(), StoreError> {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            Self::load_script(&mut conn, script).await?;
            Ok(())
        })
        .await
    }

    /// Execute a registered script atomically on the store.
    ///
    /// Uses `EVALSHA`; on a "script not cached" reply the source is
    /// re-registered and the invocation retried exactly once.
    pub async fn eval_script<T>(
        &self,
        script: &ScriptHandle,
        keys: &[&str],
        args: &[String],
    ) -> Result<T, StoreError>
    where
        T: FromRedisValue,
    {
        self.with_deadline(async {
            let mut conn = self.conn().await?;
            let sha = match script.sha() {
                Some(sha) => sha,
                None => Self::load_script(&mut conn, script).await?,
            };

            match eval_cmd(&sha, keys, args).query_async(&mut conn).await {
                Ok(value) => Ok(value),
                Err(err) if err.kind() == ErrorKind::NoScriptError => {
                    let sha = Self::load_script(&mut conn, script).await?;
                    Ok(eval_cmd(&sha, keys, args).query_async(&mut conn).await?)
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn load_script(
        conn: &mut Connection,
        script: &ScriptHandle,
    ) -> Result<String, StoreError> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(conn)
            .await?;
        script.set_sha(&sha);
        debug!(sha = %sha, "script registered with backing store");
        Ok(sha)
    }
}

fn eval_cmd(sha: &str, keys: &[&str], args: &[String]) -> redis::Cmd {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(sha).arg(keys.len());
    for key in keys {
        cmd.arg(*key);
    }
    for arg in args {
        cmd.arg(arg);
    }
    cmd
}
