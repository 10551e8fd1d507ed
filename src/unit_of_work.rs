//! Explicit transaction scope.
//!
//! A [`UnitOfWork`] is created per request or transaction, owned by one task,
//! and passed by `&mut` to every cache read. It holds the identity map, the
//! pending writes and deletes, and the snapshots staged for publication.

use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::hook::{LifecycleHook, StagedSnapshots};
use crate::store::{
    ChangeSet, RoutedConnection, StagedDelete, StagedWrite, StoreConnection, StoreRouter,
};
use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    Active,
    Preparing,
    Committed,
    RolledBack,
    Closed,
}

/// Where the live object in the identity map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Added or modified in this unit.
    Added,
    /// Loaded from the persistent store.
    Store,
    /// Reconstructed from the KV cache.
    Cache,
}

/// (kind, pk)
type EntityKey = (String, String);

struct Tracked {
    entity: Arc<dyn Any + Send + Sync>,
    origin: Origin,
}

fn entity_key<T: CacheEntity>(pk: &str) -> EntityKey {
    (T::kind_name().to_string(), pk.to_string())
}

pub struct UnitOfWork<C: StoreConnection> {
    router: Arc<StoreRouter<C>>,
    hook: Arc<LifecycleHook>,
    state: UowState,
    pinned: Option<String>,
    connection: Option<RoutedConnection<C>>,
    identity_map: HashMap<EntityKey, Tracked>,
    pending_writes: Vec<StagedWrite>,
    pending_deletes: Vec<StagedDelete>,
    staged: StagedSnapshots,
}

impl<C: StoreConnection> UnitOfWork<C> {
    pub fn new(router: Arc<StoreRouter<C>>, hook: Arc<LifecycleHook>) -> Self {
        UnitOfWork {
            router,
            hook,
            state: UowState::Active,
            pinned: None,
            connection: None,
            identity_map: HashMap::new(),
            pending_writes: Vec::new(),
            pending_deletes: Vec::new(),
            staged: StagedSnapshots::new(),
        }
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    /// Bind this unit to a named connection for the rest of its life.
    ///
    /// # Errors
    /// `Config` for an unknown name, `InvalidState` when another connection is
    /// already in use.
    pub fn pin(&mut self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        if !self.router.contains(name) {
            return Err(Error::Config(format!("unknown connection '{}'", name)));
        }
        if let Some(current) = &self.connection {
            if current.name() != name {
                return Err(Error::InvalidState(format!(
                    "unit of work already uses '{}', cannot pin '{}'",
                    current.name(),
                    name
                )));
            }
        }
        self.pinned = Some(name.to_string());
        Ok(())
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Name of the connection this unit currently holds.
    pub fn connection_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.name())
    }

    /// The connection for the next store call.
    ///
    /// A held connection is reused unless a write needs the primary and the
    /// unit is not pinned. The replica given up on that switch is closed.
    pub async fn connection(&mut self, for_write: bool) -> Result<RoutedConnection<C>> {
        self.ensure_usable()?;
        if let Some(current) = &self.connection {
            if !for_write || current.is_primary() || self.pinned.is_some() {
                return Ok(current.clone());
            }
        }

        let routed = self
            .router
            .acquire(self.pinned.as_deref(), for_write)
            .await?;
        if let Some(previous) = self.connection.replace(routed.clone()) {
            debug!(
                "Switching unit of work from '{}' to '{}'",
                previous.name(),
                routed.name()
            );
            self.release(&previous).await;
        }
        Ok(routed)
    }

    /// Close a read connection the unit no longer uses. Failures are logged;
    /// a timed out close has already invalidated the connection.
    async fn release(&self, previous: &RoutedConnection<C>) {
        let deadline = self.router.config().close_timeout();
        if let Err(e) = self.router.close(previous, deadline).await {
            warn!("Releasing '{}' failed: {}", previous.name(), e);
        }
    }

    /// Stage an insert or update and make `entity` the live object for its pk.
    pub fn add<T: CacheEntity>(&mut self, entity: &T) -> Result<()> {
        self.ensure_active("add")?;
        let pk = entity.primary_key().to_string();
        let write = StagedWrite {
            kind: T::kind_name().to_string(),
            pk: pk.clone(),
            snapshot: entity.to_snapshot()?,
        };

        self.pending_deletes
            .retain(|d| !(d.kind == write.kind && d.pk == write.pk));
        match self
            .pending_writes
            .iter_mut()
            .find(|w| w.kind == write.kind && w.pk == write.pk)
        {
            Some(existing) => *existing = write,
            None => self.pending_writes.push(write),
        }

        self.identity_map.insert(
            entity_key::<T>(&pk),
            Tracked {
                entity: Arc::new(entity.clone()),
                origin: Origin::Added,
            },
        );
        Ok(())
    }

    pub fn delete<T: CacheEntity>(&mut self, entity: &T) -> Result<()> {
        self.delete_by_pk::<T>(&entity.primary_key())
    }

    /// Stage a delete. Cancels a pending write of the same entity.
    pub fn delete_by_pk<T: CacheEntity>(&mut self, pk: &T::Key) -> Result<()> {
        self.ensure_active("delete")?;
        let (kind, pk) = entity_key::<T>(&pk.to_string());

        self.pending_writes
            .retain(|w| !(w.kind == kind && w.pk == pk));
        self.identity_map.remove(&(kind.clone(), pk.clone()));
        if !self.pending_deletes.iter().any(|d| d.kind == kind && d.pk == pk) {
            self.pending_deletes.push(StagedDelete { kind, pk });
        }
        Ok(())
    }

    /// Forget the live object for `pk` without touching pending work.
    pub fn expunge<T: CacheEntity>(&mut self, pk: &T::Key) -> bool {
        self.identity_map
            .remove(&entity_key::<T>(&pk.to_string()))
            .is_some()
    }

    pub fn contains<T: CacheEntity>(&self, pk: &T::Key) -> bool {
        self.identity_map
            .contains_key(&entity_key::<T>(&pk.to_string()))
    }

    /// Origin of the live object for `pk`, if any.
    pub fn origin<T: CacheEntity>(&self, pk: &T::Key) -> Option<Origin> {
        self.identity_map
            .get(&entity_key::<T>(&pk.to_string()))
            .map(|t| t.origin)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_writes.is_empty() || !self.pending_deletes.is_empty()
    }

    pub(crate) fn lookup<T: CacheEntity>(&self, pk: &str) -> Option<T> {
        self.identity_map
            .get(&entity_key::<T>(pk))
            .and_then(|t| t.entity.downcast_ref::<T>())
            .cloned()
    }

    pub(crate) fn is_pending_delete<T: CacheEntity>(&self, pk: &str) -> bool {
        self.pending_deletes
            .iter()
            .any(|d| d.kind == T::kind_name() && d.pk == pk)
    }

    /// Record a loaded object. An object added in this unit is never replaced.
    pub(crate) fn attach<T: CacheEntity>(&mut self, entity: &T, origin: Origin) {
        let key = entity_key::<T>(&entity.primary_key().to_string());
        if let Some(existing) = self.identity_map.get(&key) {
            if existing.origin == Origin::Added {
                return;
            }
        }
        self.identity_map.insert(
            key,
            Tracked {
                entity: Arc::new(entity.clone()),
                origin,
            },
        );
    }

    /// Make pending work durable, then publish cache events for it.
    ///
    /// Events are published only when the store commit succeeded. A failed
    /// prepare or commit behaves as a rollback and returns the store error.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;

        let has_changes = self.has_pending_changes();
        if !has_changes && self.connection.is_none() {
            self.state = UowState::Committed;
            return Ok(());
        }

        let routed = self.connection(has_changes).await?;
        let changes = ChangeSet {
            writes: mem::take(&mut self.pending_writes),
            deletes: mem::take(&mut self.pending_deletes),
        };
        self.state = UowState::Preparing;

        if let Err(e) = routed.prepare(&changes).await {
            return Err(self.abort(&routed, e).await);
        }
        self.hook.on_prepare(&changes.writes, &mut self.staged);

        if let Err(e) = routed.commit(&changes).await {
            return Err(self.abort(&routed, e).await);
        }
        self.state = UowState::Committed;
        debug!(
            "Committed {} changes on '{}'",
            changes.len(),
            routed.name()
        );

        let staged = mem::take(&mut self.staged);
        self.hook.on_commit(staged, &changes.deletes).await;
        Ok(())
    }

    async fn abort(&mut self, routed: &RoutedConnection<C>, cause: Error) -> Error {
        warn!("Commit on '{}' failed, rolling back: {}", routed.name(), cause);
        self.hook.on_rollback(&mut self.staged);
        self.identity_map.clear();

        let deadline = self.router.config().rollback_timeout();
        match self.router.rollback(routed, deadline).await {
            Ok(()) => self.state = UowState::RolledBack,
            Err(e @ Error::StoreTimeout { .. }) => {
                error!("{}", e);
                self.state = UowState::Closed;
                self.connection = None;
            }
            Err(e) => {
                warn!("Rollback after failed commit also failed: {}", e);
                self.state = UowState::RolledBack;
            }
        }
        cause
    }

    /// Discard pending work and staged snapshots without publishing anything.
    ///
    /// Rolling back a unit that is already rolled back does nothing.
    ///
    /// # Errors
    /// `InvalidState` once the unit has committed or closed. `StoreTimeout`
    /// when the store rollback exceeds its deadline; the unit is closed
    /// afterwards.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state == UowState::RolledBack {
            return Ok(());
        }
        self.ensure_active("rollback")?;
        self.hook.on_rollback(&mut self.staged);
        self.pending_writes.clear();
        self.pending_deletes.clear();
        self.identity_map.clear();

        if let Some(routed) = self.connection.clone() {
            let deadline = self.router.config().rollback_timeout();
            if let Err(e) = self.router.rollback(&routed, deadline).await {
                if matches!(e, Error::StoreTimeout { .. }) {
                    self.state = UowState::Closed;
                    self.connection = None;
                }
                return Err(e);
            }
        }

        self.state = UowState::RolledBack;
        Ok(())
    }

    /// End the unit. Pending work of an active unit is rolled back first.
    pub async fn close(mut self) -> Result<()> {
        if self.state == UowState::Closed {
            return Ok(());
        }

        let mut result = Ok(());
        if self.state == UowState::Active && self.has_pending_changes() {
            debug!("Closing unit of work with pending changes; rolling back");
            result = self.rollback().await;
        }

        if let Some(routed) = self.connection.take() {
            let closed = self
                .router
                .close(&routed, self.router.config().close_timeout())
                .await;
            if result.is_ok() {
                result = closed;
            }
        }

        self.identity_map.clear();
        self.state = UowState::Closed;
        result
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.state == UowState::Closed {
            return Err(Error::InvalidState("unit of work is closed".into()));
        }
        Ok(())
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        if self.state != UowState::Active {
            return Err(Error::InvalidState(format!(
                "cannot {} in state {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }
}

impl<C: StoreConnection> Drop for UnitOfWork<C> {
    fn drop(&mut self) {
        if self.state != UowState::Closed && self.connection.is_some() {
            warn!("Unit of work dropped without close in state {:?}", self.state);
        }
    }
}
