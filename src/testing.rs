//! Shared fixtures for unit tests.

use crate::backend::{CacheBackend, InMemoryBackend};
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

impl User {
    pub fn new(id: u64, name: &str) -> Self {
        User {
            id,
            name: name.to_string(),
        }
    }
}

impl CacheEntity for User {
    type Key = u64;

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn kind_name() -> &'static str {
        "user"
    }
}

/// In-memory backend with switchable failures and call counters.
#[derive(Clone, Default)]
pub struct FlakyBackend {
    pub inner: InMemoryBackend,
    down: Arc<AtomicBool>,
    failing_writes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call while `down` is set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("connection refused".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check()?;
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::BackendUnavailable("write timed out".into()));
        }
        Ok(())
    }
}

impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        self.inner.delete(key).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.mget(keys).await
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        self.inner.mset(entries, ttl).await
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        self.inner.mdelete(keys).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }
}
