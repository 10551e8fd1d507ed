//! Redis cache backend.

use super::CacheBackend;
use crate::error::{Error, Result};
use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;

const DEFAULT_POOL_SIZE: usize = 16;

/// Configuration for the Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// Redis backend over a `deadpool-redis` pool.
///
/// Batched reads use `MGET`; batched writes use one atomic pipeline of
/// `SET ... EX` commands so a shared TTL applies to every key.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// # Errors
    /// Returns `Error::Config` if the URL is invalid or the pool cannot be built.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(config.url.clone());
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Failed to create redis pool: {}", e)))?;

        info!(
            "Redis backend initialized: {} (pool size: {})",
            config.url, config.pool_size
        );
        Ok(RedisBackend { pool })
    }

    /// Pool size comes from `REDIS_POOL_SIZE`, else `DEFAULT_POOL_SIZE`.
    pub async fn from_url(url: String) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        Self::new(RedisConfig { url, pool_size }).await
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("redis pool: {}", e)))
    }
}

fn unavailable(op: &str, e: redis::RedisError) -> Error {
    Error::BackendUnavailable(format!("redis {}: {}", op, e))
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("GET", e))?;
        debug!(
            "Redis GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("SET", e))?;
        debug!("Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.mdelete(&[key]).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: u32 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("EXISTS", e))?;
        Ok(count > 0)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("MGET", e))?;
        debug!("Redis MGET {} keys", keys.len());
        Ok(values)
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            cmd.ignore();
        }

        let mut conn = self.conn().await?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("MSET", e))?;
        debug!("Redis MSET {} keys (TTL: {:?})", count, ttl);
        Ok(())
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("DEL", e))?;
        debug!("Redis DEL {} keys", keys.len());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let Ok(mut conn) = self.conn().await else {
            return Ok(false);
        };
        let pong: std::result::Result<String, _> =
            redis::cmd("PING").query_async(&mut conn).await;
        Ok(pong.is_ok())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("FLUSHDB", e))?;
        warn!("Redis FLUSHDB executed");
        Ok(())
    }
}
