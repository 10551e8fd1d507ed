//! In-process cache backend.

use super::CacheBackend;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Thread-safe in-memory backend with per-key expiry.
///
/// Cloning is cheap and every clone shares the same map, so a test can hand
/// one clone to an `EntityCache` and inspect the other.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<DashMap<String, Entry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time to live of a key, `None` if absent or without expiry.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl InMemoryBackend {
    /// Drop `key` if its entry is expired at `now`. A value written after the
    /// expiry was observed is kept.
    fn purge_expired(&self, key: &str, now: Instant) -> bool {
        self.entries.remove_if(key, |_, e| !e.is_live(now)).is_some()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|e| (e.is_live(now), e.value.clone()));

        match hit {
            Some((true, value)) => {
                debug!("InMemory GET {} -> HIT", key);
                Ok(Some(value))
            }
            Some((false, _)) => {
                self.purge_expired(key, now);
                debug!("InMemory GET {} -> EXPIRED", key);
                Ok(None)
            }
            None => {
                debug!("InMemory GET {} -> MISS", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        debug!("InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        debug!("InMemory DELETE {}", key);
        Ok(())
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        let count = entries.len();
        for (key, value) in entries {
            self.entries.insert(key, Entry { value, expires_at });
        }
        debug!("InMemory MSET {} keys (TTL: {:?})", count, ttl);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.entries.clear();
        warn!("InMemory cache cleared");
        Ok(())
    }
}
