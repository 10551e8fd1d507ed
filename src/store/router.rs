//! Named store connections and per-unit-of-work routing.

use super::StoreConnection;
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Role of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    /// Read replica; `weight` only matters for
    /// [`LoadBalanceStrategy::Weighted`](crate::store::LoadBalanceStrategy::Weighted).
    Replica { weight: u32 },
}

struct Slot<C> {
    name: String,
    role: Role,
    conn: Arc<C>,
    recycle_at: Mutex<Option<Instant>>,
}

/// A connection handed out by the router, tagged with its name and role.
pub struct RoutedConnection<C> {
    name: String,
    primary: bool,
    conn: Arc<C>,
}

impl<C> RoutedConnection<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }
}

impl<C> Clone for RoutedConnection<C> {
    fn clone(&self) -> Self {
        RoutedConnection {
            name: self.name.clone(),
            primary: self.primary,
            conn: self.conn.clone(),
        }
    }
}

impl<C> Deref for RoutedConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> fmt::Debug for RoutedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .finish()
    }
}

/// Owns one primary and any number of replicas and decides which one a unit
/// of work talks to.
///
/// Precedence: explicit pin, then the primary for writes, then the configured
/// [`LoadBalanceStrategy`](crate::store::LoadBalanceStrategy) among replicas
/// (the primary when there are none).
pub struct StoreRouter<C: StoreConnection> {
    config: RouterConfig,
    slots: Vec<Slot<C>>,
    by_name: HashMap<String, usize>,
    primary: Option<usize>,
    replicas: Vec<usize>,
    cursor: AtomicUsize,
}

impl<C: StoreConnection> StoreRouter<C> {
    pub fn new(config: RouterConfig) -> Self {
        StoreRouter {
            config,
            slots: Vec::new(),
            by_name: HashMap::new(),
            primary: None,
            replicas: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register a named connection.
    ///
    /// # Errors
    /// `DuplicateRegistration` when the name is taken or a second primary is
    /// registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        conn: impl Into<Arc<C>>,
        role: Role,
    ) -> Result<()> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateRegistration(format!("connection '{}'", name)));
        }
        if role == Role::Primary {
            if let Some(existing) = self.primary {
                return Err(Error::DuplicateRegistration(format!(
                    "primary connection '{}' (already '{}')",
                    name, self.slots[existing].name
                )));
            }
        }

        let idx = self.slots.len();
        let recycle_at = self.next_recycle_at();
        match role {
            Role::Primary => self.primary = Some(idx),
            Role::Replica { .. } => self.replicas.push(idx),
        }
        self.by_name.insert(name.clone(), idx);
        self.slots.push(Slot {
            name: name.clone(),
            role,
            conn: conn.into(),
            recycle_at: Mutex::new(recycle_at),
        });

        info!("Registered store connection '{}' as {:?}", name, role);
        Ok(())
    }

    pub fn register_primary(
        &mut self,
        name: impl Into<String>,
        conn: impl Into<Arc<C>>,
    ) -> Result<()> {
        self.register(name, conn, Role::Primary)
    }

    pub fn register_replica(
        &mut self,
        name: impl Into<String>,
        conn: impl Into<Arc<C>>,
        weight: u32,
    ) -> Result<()> {
        self.register(name, conn, Role::Replica { weight })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    /// Direct handle on a named connection, bypassing routing.
    pub fn connection(&self, name: &str) -> Option<Arc<C>> {
        self.by_name.get(name).map(|idx| self.slots[*idx].conn.clone())
    }

    /// Choose a connection and make sure it is healthy before handing it out.
    pub async fn acquire(
        &self,
        pin: Option<&str>,
        for_write: bool,
    ) -> Result<RoutedConnection<C>> {
        let idx = self.select(pin, for_write)?;
        self.checkout(idx).await
    }

    fn select(&self, pin: Option<&str>, for_write: bool) -> Result<usize> {
        if let Some(name) = pin {
            return self
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| Error::Config(format!("unknown connection '{}'", name)));
        }

        let primary = self.primary;
        if for_write || self.replicas.is_empty() {
            return primary
                .ok_or_else(|| Error::Config("no primary connection registered".into()));
        }

        let weights: Vec<u32> = self
            .replicas
            .iter()
            .map(|idx| match self.slots[*idx].role {
                Role::Replica { weight } => weight,
                Role::Primary => 0,
            })
            .collect();
        let pick = self.config.strategy.pick(&weights, &self.cursor);
        Ok(self.replicas[pick])
    }

    async fn checkout(&self, idx: usize) -> Result<RoutedConnection<C>> {
        let slot = &self.slots[idx];
        let now = Instant::now();
        let due = slot.recycle_at.lock().map_or(false, |at| now >= at);

        if due || !slot.conn.is_valid() {
            debug!(
                "Recycling store connection '{}' ({})",
                slot.name,
                if due { "interval elapsed" } else { "invalidated" }
            );
            slot.conn.recycle().await?;
            *slot.recycle_at.lock() = self.next_recycle_at();
        }

        debug!("Routed unit of work to '{}'", slot.name);
        Ok(RoutedConnection {
            name: slot.name.clone(),
            primary: slot.role == Role::Primary,
            conn: slot.conn.clone(),
        })
    }

    fn next_recycle_at(&self) -> Option<Instant> {
        self.config
            .recycle_interval()
            .map(|base| Instant::now() + jittered(base))
    }

    /// Roll back, giving up after `deadline`.
    ///
    /// # Errors
    /// `StoreTimeout` when the deadline passes; the connection is invalidated.
    pub async fn rollback(&self, routed: &RoutedConnection<C>, deadline: Duration) -> Result<()> {
        bounded("rollback", routed, deadline, routed.conn.rollback()).await
    }

    /// Close, giving up after `deadline`.
    ///
    /// # Errors
    /// `StoreTimeout` when the deadline passes; the connection is invalidated.
    pub async fn close(&self, routed: &RoutedConnection<C>, deadline: Duration) -> Result<()> {
        bounded("close", routed, deadline, routed.conn.close()).await
    }

    /// Close every registered connection, each bounded by `deadline`.
    ///
    /// Every connection is attempted; the first failure is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let mut first = Ok(());
        for slot in &self.slots {
            let routed = RoutedConnection {
                name: slot.name.clone(),
                primary: slot.role == Role::Primary,
                conn: slot.conn.clone(),
            };
            let result = self.close(&routed, deadline).await;
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}

async fn bounded<C, F>(
    operation: &'static str,
    routed: &RoutedConnection<C>,
    deadline: Duration,
    fut: F,
) -> Result<()>
where
    C: StoreConnection,
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            routed.conn.invalidate();
            error!(
                "Store {} on '{}' exceeded {:?}; connection invalidated",
                operation, routed.name, deadline
            );
            Err(Error::StoreTimeout {
                operation,
                connection: routed.name.clone(),
                deadline,
            })
        }
    }
}

/// `base` scaled by a uniform factor in `[0.75, 1.25]`.
pub fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::rng().random_range(0.75..=1.25))
}
