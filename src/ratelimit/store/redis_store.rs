//! Redis-backed [`WindowStore`].
//!
//! Windows survive process restarts and are shared by every instance pointed
//! at the same Redis.
//!
//! ## Layout
//!
//! - `{prefix}window:{identifier}`: hash with `count`, `window_start` and
//!   `last_request` (epoch milliseconds). Every counted request refreshes a
//!   `PEXPIRE` of the retention horizon, so idle windows expire on their own.
//! - `{prefix}activity`: sorted set of identifiers scored by `last_request`,
//!   used for summaries, recent activity and retention trimming.
//!
//! Check-and-increment and decrement run as Lua scripts, which Redis executes
//! atomically.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::{debug, info};

use super::{StoreError, StoreSummary, WindowStore, WindowTicket};
use crate::ratelimit::window::{from_millis, to_millis, UsageWindow};

const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
local start = tonumber(redis.call('HGET', KEYS[1], 'window_start') or '-1')
if start < 0 or now - start >= tonumber(ARGV[2]) then
  count = 1
  start = now
elseif count >= tonumber(ARGV[3]) then
  return {0, count, start}
else
  count = count + 1
end
local last = tonumber(redis.call('HGET', KEYS[1], 'last_request') or '0')
if now > last then
  last = now
end
redis.call('HSET', KEYS[1], 'count', count, 'window_start', start, 'last_request', last)
redis.call('PEXPIRE', KEYS[1], ARGV[4])
redis.call('ZADD', KEYS[2], last, ARGV[5])
return {1, count, start}
"#;

const DECREMENT_SCRIPT: &str = r#"
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
if count > 0 then
  redis.call('HINCRBY', KEYS[1], 'count', -1)
end
return 0
"#;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key the store writes (default: "tollgate:")
    pub key_prefix: String,
    /// Idle retention horizon (default: 1 hour)
    pub retention: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:".to_string(),
            retention: Duration::from_secs(3600),
        }
    }
}

/// Durable window store on top of Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    admit: Script,
    decrement: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Connected to Redis window store");

        Ok(Self {
            connection,
            config,
            admit: Script::new(ADMIT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
        })
    }

    fn window_key(&self, identifier: &str) -> String {
        format!("{}window:{}", self.config.key_prefix, identifier)
    }

    fn activity_key(&self) -> String {
        format!("{}activity", self.config.key_prefix)
    }

    async fn load_windows(&self, identifiers: &[String]) -> Result<Vec<UsageWindow>, StoreError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for identifier in identifiers {
            pipe.hgetall(self.window_key(identifier));
        }

        let mut conn = self.connection.clone();
        let fields: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        Ok(identifiers
            .iter()
            .zip(fields)
            .filter_map(|(identifier, fields)| parse_window(identifier, &fields))
            .collect())
    }
}

/// Decode a window hash, `None` if it is missing or malformed.
fn parse_window(identifier: &str, fields: &HashMap<String, String>) -> Option<UsageWindow> {
    let field = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());

    let count = field("count")?;
    let window_start = from_millis(field("window_start")?)?;
    let last_request = from_millis(field("last_request")?)?;

    Some(UsageWindow {
        identifier: identifier.to_string(),
        count: count.max(0) as u64,
        window_start,
        last_request,
    })
}

fn corrupt(reply: &[i64]) -> StoreError {
    StoreError::unavailable(format!("unexpected admit reply {:?}", reply))
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn admit_and_count(
        &self,
        identifier: &str,
        window: Duration,
        quota: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowTicket, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Vec<i64> = self
            .admit
            .key(self.window_key(identifier))
            .key(self.activity_key())
            .arg(to_millis(now))
            .arg(window.as_millis() as u64)
            .arg(quota)
            .arg(self.config.retention.as_millis() as u64)
            .arg(identifier)
            .invoke_async(&mut conn)
            .await?;

        let &[admitted, count, start] = reply.as_slice() else {
            return Err(corrupt(&reply));
        };
        let window_start = from_millis(start).ok_or_else(|| corrupt(&reply))?;

        Ok(WindowTicket {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            window_start,
        })
    }

    async fn decrement(&self, identifier: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .decrement
            .key(self.window_key(identifier))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn peek(&self, identifier: &str) -> Result<Option<UsageWindow>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.window_key(identifier)).await?;
        Ok(parse_window(identifier, &fields))
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let mut conn = self.connection.clone();
        let identifiers: Vec<String> = conn.zrange(self.activity_key(), 0, -1).await?;
        let windows = self.load_windows(&identifiers).await?;

        let requests = windows.iter().map(|w| w.count).sum();
        Ok(StoreSummary::from_totals(windows.len() as u64, requests))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<UsageWindow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let identifiers: Vec<String> = conn
            .zrevrange(self.activity_key(), 0, limit as isize - 1)
            .await?;

        self.load_windows(&identifiers).await
    }

    async fn reset(&self, identifier: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let (deleted, _): (u64, u64) = redis::pipe()
            .atomic()
            .del(self.window_key(identifier))
            .zrem(self.activity_key(), identifier)
            .query_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn purge_idle(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = to_millis(now) - retention.as_millis() as i64;
        let mut conn = self.connection.clone();
        let removed: usize = conn
            .zrembyscore(self.activity_key(), "-inf", cutoff)
            .await?;

        debug!(removed = removed, cutoff = cutoff, "Trimmed Redis activity index");
        Ok(removed)
    }
}
