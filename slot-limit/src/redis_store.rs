use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Client;
use redis::Script;
use redis::aio::ConnectionManager;

use crate::SlotStore;
use crate::StoreError;
use crate::config::clamp_ttl_secs;

// KEYS[1] = ledger key
// ARGV[1] = max concurrency, ARGV[2] = ttl seconds, ARGV[3] = request id
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local max_concurrency = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local request_id = ARGV[3]

local now = tonumber(redis.call('TIME')[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl)

if redis.call('ZSCORE', key, request_id) ~= false then
    redis.call('ZADD', key, now, request_id)
    redis.call('EXPIRE', key, ttl)
    return 1
end

if redis.call('ZCARD', key) < max_concurrency then
    redis.call('ZADD', key, now, request_id)
    redis.call('EXPIRE', key, ttl)
    return 1
end

return 0
"#;

// KEYS[1] = ledger key
// ARGV[1] = ttl seconds
const COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])

local now = tonumber(redis.call('TIME')[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl)
return redis.call('ZCARD', key)
"#;

// KEYS[1] = wait counter key
// ARGV[1] = max wait, ARGV[2] = ttl seconds
const ENTER_WAIT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    current = 0
else
    current = tonumber(current)
end

if current >= tonumber(ARGV[1]) then
    return 0
end

if redis.call('INCR', KEYS[1]) == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

// KEYS[1] = wait counter key
const LEAVE_WAIT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= false and tonumber(current) > 0 then
    redis.call('DECR', KEYS[1])
end
return 1
"#;

/// The atomic procedures, compiled once and shared by every clone of the store.
struct Scripts {
    acquire: Script,
    count: Script,
    enter_wait: Script,
    leave_wait: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            acquire: Script::new(ACQUIRE_SCRIPT),
            count: Script::new(COUNT_SCRIPT),
            enter_wait: Script::new(ENTER_WAIT_SCRIPT),
            leave_wait: Script::new(LEAVE_WAIT_SCRIPT),
        }
    }
}

/// A [`SlotStore`] running its procedures as Lua scripts inside Redis (or Valkey).
///
/// Scripts are sent by `EVALSHA`, falling back to loading them on the first
/// `NOSCRIPT`. Time is read with `TIME` inside the scripts, so callers with skewed
/// clocks still agree on which slots are stale.
///
/// `ConnectionManager` multiplexes and reconnects, so a single `RedisStore` should be
/// shared through an `Arc` rather than created per request.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            scripts: Arc::new(Scripts::new()),
        }
    }

    /// Opens a managed connection to `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!(url, "connected slot store to redis");
        Ok(Self::new(connection))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    clamp_ttl_secs(ttl).as_secs().max(1)
}

#[async_trait]
impl SlotStore for RedisStore {
    async fn acquire(
        &self,
        key: &str,
        max_concurrency: u32,
        ttl: Duration,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let granted: i64 = self
            .scripts
            .acquire
            .key(key)
            .arg(max_concurrency)
            .arg(ttl_secs(ttl))
            .arg(request_id)
            .invoke_async(&mut connection)
            .await?;
        Ok(granted == 1)
    }

    async fn release(&self, key: &str, request_id: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _removed: i64 = connection.zrem(key, request_id).await?;
        Ok(())
    }

    async fn count(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let count: u64 = self
            .scripts
            .count
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(count)
    }

    async fn enter_wait(
        &self,
        key: &str,
        max_wait: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let granted: i64 = self
            .scripts
            .enter_wait
            .key(key)
            .arg(max_wait)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(granted == 1)
    }

    async fn leave_wait(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = self
            .scripts
            .leave_wait
            .key(key)
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn wait_count(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let current: Option<i64> = connection.get(key).await?;
        Ok(current.unwrap_or(0).max(0) as u64)
    }
}
