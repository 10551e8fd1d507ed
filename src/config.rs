//! Store router configuration.

use crate::store::LoadBalanceStrategy;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_RECYCLE_SECS: u64 = 1200;
const DEFAULT_ROLLBACK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

/// Settings for [`StoreRouter`](crate::store::StoreRouter).
///
/// Deserializes from any serde source with every field optional:
///
/// ```
/// # use entity_cache::RouterConfig;
/// let config: RouterConfig =
///     serde_json::from_str(r#"{ "strategy": "round_robin", "close_timeout_ms": 250 }"#).unwrap();
/// assert_eq!(config.close_timeout().as_millis(), 250);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: LoadBalanceStrategy,
    /// Base pool recycle interval; each connection gets it jittered by ±25%.
    /// Zero disables recycling.
    pub recycle_interval_secs: u64,
    pub rollback_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            strategy: LoadBalanceStrategy::default(),
            recycle_interval_secs: DEFAULT_RECYCLE_SECS,
            rollback_timeout_ms: DEFAULT_ROLLBACK_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl RouterConfig {
    /// Defaults overridden by `STORE_LB_STRATEGY`, `STORE_POOL_RECYCLE_SECS`,
    /// `STORE_ROLLBACK_TIMEOUT_MS` and `STORE_CLOSE_TIMEOUT_MS`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = RouterConfig::default();

        if let Ok(raw) = std::env::var("STORE_LB_STRATEGY") {
            match raw.parse() {
                Ok(strategy) => config.strategy = strategy,
                Err(e) => warn!("ignoring STORE_LB_STRATEGY: {}", e),
            }
        }
        if let Some(secs) = env_u64("STORE_POOL_RECYCLE_SECS") {
            config.recycle_interval_secs = secs;
        }
        if let Some(ms) = env_u64("STORE_ROLLBACK_TIMEOUT_MS") {
            config.rollback_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("STORE_CLOSE_TIMEOUT_MS") {
            config.close_timeout_ms = ms;
        }

        config
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_recycle_interval(mut self, interval: Duration) -> Self {
        self.recycle_interval_secs = interval.as_secs();
        self
    }

    /// Deadlines beyond `u64::MAX` milliseconds saturate.
    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout_ms = millis(timeout);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = millis(timeout);
        self
    }

    pub fn recycle_interval(&self) -> Option<Duration> {
        (self.recycle_interval_secs > 0).then(|| Duration::from_secs(self.recycle_interval_secs))
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {}: '{}' is not a non-negative integer", name, raw);
            None
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
