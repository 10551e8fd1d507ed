//! Builder for cache writes.

use crate::backend::CacheBackend;
use crate::cache::EntityCache;
use crate::entity::CacheEntity;
use crate::error::Result;
use crate::serialization::encode_snapshot;
use crate::snapshot::RawSnapshot;
use std::time::Duration;

/// Longest pause between two write attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay after failed attempt `attempt` (1-based): 100ms, doubling, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1_u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(100_u64.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// Fluent builder for cache writes.
///
/// Provides chainable methods for a TTL override and retry count. Cache writes
/// are idempotent, so a failed write can be repeated safely.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
///
/// users
///     .write()
///     .with_ttl(Duration::from_secs(300))
///     .with_retry(3)
///     .set(&user)
///     .await?;
/// ```
pub struct CacheWriteBuilder<'a, T: CacheEntity, B: CacheBackend> {
    cache: &'a EntityCache<T, B>,
    ttl_override: Option<Duration>,
    retry_count: u32,
}

impl<'a, T: CacheEntity, B: CacheBackend> CacheWriteBuilder<'a, T, B> {
    pub(crate) fn new(cache: &'a EntityCache<T, B>) -> Self {
        Self {
            cache,
            ttl_override: None,
            retry_count: 0,
        }
    }

    /// Override the kind's default TTL for this write.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Retry a failed write up to `count` more times.
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub async fn set(self, entity: &T) -> Result<()> {
        let snapshot = entity.to_snapshot()?;
        self.execute(vec![(entity.primary_key().to_string(), snapshot)])
            .await
    }

    pub async fn set_raw(self, pk: &str, snapshot: RawSnapshot) -> Result<()> {
        self.execute(vec![(pk.to_string(), snapshot)]).await
    }

    /// Write every entity in one batched call.
    pub async fn mset(self, entities: &[T]) -> Result<()> {
        let mut entries = Vec::with_capacity(entities.len());
        for entity in entities {
            entries.push((entity.primary_key().to_string(), entity.to_snapshot()?));
        }
        self.execute(entries).await
    }

    /// Encode and write, retrying with exponential backoff.
    ///
    /// # Errors
    ///
    /// Encoding errors are returned directly. A write that still fails after
    /// every retry goes to the failure callbacks; only an error raised by a
    /// `raise_on_error` callback is returned.
    async fn execute(self, entries: Vec<(String, RawSnapshot)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if !self.cache.is_enabled() {
            debug!(
                "Skipping cache write for '{}': caching disabled",
                self.cache.kind().name()
            );
            return Ok(());
        }

        let ttl = self.cache.kind().resolve_ttl(self.ttl_override);
        let mut encoded = Vec::with_capacity(entries.len());
        for (pk, snapshot) in &entries {
            encoded.push((
                self.cache.key_for(pk).into_string(),
                encode_snapshot(snapshot)?,
            ));
        }

        let backend = self.cache.backend();
        let mut attempts = 0;
        let max_attempts = self.retry_count + 1; // +1 for initial attempt

        loop {
            attempts += 1;

            let result = match encoded.as_slice() {
                [(key, value)] => backend.set(key, value.clone(), ttl).await,
                _ => backend.mset(encoded.clone(), ttl).await,
            };

            match result {
                Ok(()) => {
                    debug!(
                        "Cached {} {} entries (ttl: {:?})",
                        encoded.len(),
                        self.cache.kind().name(),
                        ttl
                    );
                    return Ok(());
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        return self
                            .cache
                            .report_failure(entries.iter().map(|(pk, _)| pk.as_str()), &e);
                    }

                    debug!(
                        "Cache write failed (attempt {}/{}), retrying...",
                        attempts, max_attempts
                    );

                    tokio::time::sleep(backoff_delay(attempts)).await;
                }
            }
        }
    }
}
