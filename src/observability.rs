//! Metrics hook for cache hits, misses and errors.

/// Receives cache counters. Every method defaults to a no-op so an
/// implementation only overrides what it exports.
///
/// Counts are per call: a batched read reports all of its hits at once.
pub trait CacheMetrics: Send + Sync {
    /// Rows served without a store query (identity map or KV cache).
    fn record_hit(&self, _kind: &str, _count: usize) {}

    /// Rows that fell through to the store.
    fn record_miss(&self, _kind: &str, _count: usize) {}

    /// A cache-layer failure that was swallowed.
    fn record_error(&self, _kind: &str, _error: &str) {}
}

/// Default metrics sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}
