//! Replica selection strategies.

use crate::error::{Error, Result};
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a read-only unit of work picks among replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Uniformly random replica.
    #[default]
    Random,
    /// Replicas in registration order, wrapping around.
    RoundRobin,
    /// Random replica, proportional to its weight.
    Weighted,
}

impl LoadBalanceStrategy {
    /// Pick an index into `weights` (one entry per replica).
    ///
    /// `weights` must be non-empty. A weighted pick where every weight is zero
    /// degrades to a uniform pick.
    pub fn pick(&self, weights: &[u32], cursor: &AtomicUsize) -> usize {
        debug_assert!(!weights.is_empty());
        match self {
            LoadBalanceStrategy::Random => rand::rng().random_range(0..weights.len()),
            LoadBalanceStrategy::RoundRobin => {
                cursor.fetch_add(1, Ordering::Relaxed) % weights.len()
            }
            LoadBalanceStrategy::Weighted => {
                let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
                if total == 0 {
                    return rand::rng().random_range(0..weights.len());
                }
                let mut ticket = rand::rng().random_range(0..total);
                for (idx, weight) in weights.iter().enumerate() {
                    let weight = u64::from(*weight);
                    if ticket < weight {
                        return idx;
                    }
                    ticket -= weight;
                }
                weights.len() - 1
            }
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::Weighted => "weighted",
        };
        f.write_str(name)
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(LoadBalanceStrategy::Random),
            "round_robin" | "roundrobin" | "round-robin" => Ok(LoadBalanceStrategy::RoundRobin),
            "weighted" => Ok(LoadBalanceStrategy::Weighted),
            other => Err(Error::Config(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}
