//! Memcached cache backend.

use super::CacheBackend;
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Object, Pool};
use std::collections::HashMap;
use std::time::Duration;

/// Pool size used by [`MemcachedBackend::from_server`] when
/// `MEMCACHED_POOL_SIZE` is unset or unparsable.
const DEFAULT_POOL_SIZE: u32 = 16;

/// Configuration for the Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub server: String,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            server: "localhost:11211".to_string(),
            pool_size: 10,
        }
    }
}

/// Memcached backend over a `deadpool-memcached` pool.
///
/// ```no_run
/// # use entity_cache::backend::{MemcachedBackend, MemcachedConfig, CacheBackend};
/// # async fn example() -> entity_cache::Result<()> {
/// let backend = MemcachedBackend::new(MemcachedConfig::default()).await?;
/// backend.set("user|1", b"...".to_vec(), None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedBackend {
    pool: Pool,
}

impl MemcachedBackend {
    /// # Errors
    /// Returns `Error::Config` if the pool cannot be built.
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        let manager = Manager::new(config.server.clone());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create memcached pool: {}", e)))?;

        info!(
            "Memcached backend initialized: {} (pool size: {})",
            config.server, config.pool_size
        );
        Ok(MemcachedBackend { pool })
    }

    /// Pool size comes from `MEMCACHED_POOL_SIZE`, else `DEFAULT_POOL_SIZE`.
    pub async fn from_server(server: String) -> Result<Self> {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        Self::new(MemcachedConfig { server, pool_size }).await
    }

    async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("memcached pool: {}", e)))
    }
}

/// Map a DELETE reply. Absent keys are fine.
fn delete_outcome<E: std::fmt::Display>(key: &str, result: std::result::Result<(), E>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("not found") => Ok(()),
        Err(e) => Err(Error::BackendUnavailable(format!(
            "memcached DELETE {}: {}",
            key, e
        ))),
    }
}

/// Memcached reads expirations below 30 days as relative seconds.
fn expiration(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| d.as_secs().max(1) as i64)
}

impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        match conn.get(key).await {
            Ok(Some(value)) => {
                debug!("Memcached GET {} -> HIT", key);
                Ok(value.data)
            }
            Ok(None) => {
                debug!("Memcached GET {} -> MISS", key);
                Ok(None)
            }
            Err(e) => Err(Error::BackendUnavailable(format!(
                "memcached GET {}: {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.set(key, value.as_slice(), expiration(ttl), None)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("memcached SET {}: {}", key, e)))?;
        debug!("Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        delete_outcome(key, conn.delete(key).await)?;
        debug!("Memcached DELETE {}", key);
        Ok(())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let values = match conn.get_multi(keys).await {
            Ok(values) => values,
            Err(e) if e.to_string().contains("not found") => {
                debug!("Memcached MGET {} keys (all miss)", keys.len());
                return Ok(vec![None; keys.len()]);
            }
            Err(e) => return Err(Error::BackendUnavailable(format!("memcached MGET: {}", e))),
        };

        let mut by_key: HashMap<String, Vec<u8>> = HashMap::with_capacity(values.len());
        for value in values {
            if let Some(data) = value.data {
                by_key.insert(String::from_utf8_lossy(&value.key).into_owned(), data);
            }
        }

        debug!("Memcached MGET {} keys, {} hits", keys.len(), by_key.len());
        Ok(keys.iter().map(|k| by_key.remove(*k)).collect())
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        // The ASCII protocol has no multi-set; reuse one connection for the batch.
        let mut conn = self.conn().await?;
        let count = entries.len();
        for (key, value) in entries {
            conn.set(key.as_str(), value.as_slice(), expiration(ttl), None)
                .await
                .map_err(|e| Error::BackendUnavailable(format!("memcached SET {}: {}", key, e)))?;
        }
        debug!("Memcached MSET {} keys (TTL: {:?})", count, ttl);
        Ok(())
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        // every key is attempted; the first real failure is returned
        let mut conn = self.conn().await?;
        let mut first = Ok(());
        for key in keys {
            let outcome = delete_outcome(key, conn.delete(key).await);
            if let Err(e) = &outcome {
                warn!("{}", e);
                if first.is_ok() {
                    first = outcome;
                }
            }
        }
        debug!("Memcached MDELETE {} keys", keys.len());
        first
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => Ok(conn.get("__health_check__").await.is_ok()),
            Err(_) => Ok(false),
        }
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.flush_all()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("memcached FLUSH_ALL: {}", e)))?;
        warn!("Memcached FLUSH_ALL executed");
        Ok(())
    }
}
