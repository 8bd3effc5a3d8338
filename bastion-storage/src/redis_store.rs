//! Redis-backed remote store.
//!
//! Connections come from a `deadpool-redis` pool. Keys are used as given;
//! namespacing is the caller's job. `clear` is not offered on a shared
//! server.

use std::time::Duration;

use async_trait::async_trait;
use bastion_core::{CacheError, RedisConfig};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;

use crate::remote::{KeyTtl, RemoteStore};

/// INCR, then attach an expiry only if the key has none, in one round trip.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local expire_ms = tonumber(ARGV[1])
if expire_ms > 0 and redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], expire_ms)
end
return count
"#;

/// Pooled Redis [`RemoteStore`].
pub struct RedisRemoteStore {
    pool: Pool,
    increment: redis::Script,
}

impl RedisRemoteStore {
    /// Build the pool and check the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CacheError::Connection(format!("Failed to create pool config: {}", e)))?
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(format!("Failed to build pool: {}", e)))?;

        let store = Self {
            pool,
            increment: redis::Script::new(INCREMENT_SCRIPT),
        };
        store.ping().await?;
        tracing::info!(url = %config.url, max_connections = config.max_connections, "Connected to Redis");
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| CacheError::Connection(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to get connection: {}", e)))
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis GET failed: {}", e)))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| CacheError::Backend(format!("Redis SET failed: {}", e)))
        } else {
            // SETEX has second granularity; round sub-second TTLs up.
            let ttl_secs = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(key, value, ttl_secs)
                .await
                .map_err(|e| CacheError::Backend(format!("Redis SETEX failed: {}", e)))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, i64>(key)
            .await
            .map(|_| ())
            .map_err(|e| CacheError::Backend(format!("Redis DEL failed: {}", e)))
    }

    async fn increment(&self, key: &str, expire: Option<Duration>) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let expire_ms = expire
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1))
            .unwrap_or(0);
        self.increment
            .key(key)
            .arg(expire_ms)
            .invoke_async::<i64>(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis INCR failed: {}", e)))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let mut conn = self.conn().await?;
        conn.ttl::<_, i64>(key)
            .await
            .map(KeyTtl::from_seconds)
            .map_err(|e| CacheError::Backend(format!("Redis TTL failed: {}", e)))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, KeyTtl)>, CacheError> {
        let mut conn = self.conn().await?;
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis GET/PTTL failed: {}", e)))?;
        Ok(value.map(|value| (value, KeyTtl::from_millis(pttl))))
    }
}

impl std::fmt::Debug for RedisRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisRemoteStore")
            .field("pool_size", &status.size)
            .field("pool_available", &status.available)
            .finish()
    }
}
