//! KV cache backends.
//!
//! The [`CacheBackend`] trait is the whole contract the entity cache needs:
//! point and batched get/set/delete with an optional TTL. Values are opaque
//! bytes; encoding lives in [`crate::serialization`].

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "memcached")]
mod memcached;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisConfig};

/// Key-value cache client.
///
/// Connection failures surface as `Error::BackendUnavailable`. Batched methods
/// have sequential default implementations; backends with native multi-key
/// commands override them so each call is a single round trip.
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch one value; `None` when absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store one value. `ttl = None` means no expiry.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove one value. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Fetch many values; the result is aligned with `keys`.
    fn mget(&self, keys: &[&str]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(self.get(key).await?);
            }
            Ok(values)
        }
    }

    /// Store many values with one shared TTL.
    fn mset(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in entries {
                self.set(&key, value, ttl).await?;
            }
            Ok(())
        }
    }

    fn mdelete(&self, keys: &[&str]) -> impl Future<Output = Result<()>> + Send {
        async move {
            for key in keys {
                self.delete(key).await?;
            }
            Ok(())
        }
    }

    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }

    /// Drop every entry. Only meant for tests and maintenance tooling.
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send;
}
