//! Redis-backed lock store
//!
//! Set-if-absent is a single `SET key value NX PX ms`. The conditional
//! operations run as Lua scripts on the server, so the comparison and the
//! mutation happen in one atomic step.

use super::{LockStore, StoreError, StoreResult};
use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delete KEYS[1] only while it still holds ARGV[1]
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Reset the expiry of KEYS[1] to ARGV[2] ms only while it still holds ARGV[1]
const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// [`LockStore`] backed by a Redis server
///
/// Cloning is cheap; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    url: String,
    response_timeout: Duration,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`
    ///
    /// `response_timeout` bounds the initial connection and every command.
    pub async fn connect(url: &str, response_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = with_timeout(response_timeout, client.get_connection_manager()).await?;

        debug!(url = %redacted_url(url), "Connected to Redis lock store");

        Ok(Self {
            conn,
            url: url.to_string(),
            response_timeout,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE_SCRIPT),
        })
    }

    /// Get the per-command response timeout
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &redacted_url(&self.url))
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = with_timeout(
            self.response_timeout,
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = with_timeout(
            self.response_timeout,
            self.compare_and_delete
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = with_timeout(
            self.response_timeout,
            self.compare_and_expire
                .key(key)
                .arg(expected)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(updated == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        with_timeout(
            self.response_timeout,
            ::redis::cmd("GET").arg(key).query_async(&mut conn),
        )
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = with_timeout(
            self.response_timeout,
            ::redis::cmd("DEL").arg(key).query_async(&mut conn),
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = with_timeout(
            self.response_timeout,
            ::redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;
        Ok(updated == 1)
    }
}

/// Run a Redis call under `limit`, mapping both failure modes to [`StoreError`]
async fn with_timeout<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(map_redis_error),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Connection(format!("timed out: {}", err))
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

/// Redis PX arguments must be at least one millisecond
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Strip credentials from a connection URL before logging it
pub(crate) fn redacted_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
