//! Unit-of-work lifecycle hook.
//!
//! The hook is the only bridge between persistence and caching: it stages
//! snapshots while a unit of work prepares and turns them into events once
//! the store reports a durable commit. It never touches a cache itself.

use crate::entity::EntityKind;
use crate::error::Result;
use crate::events::{CacheEvent, EventBus};
use crate::snapshot::RawSnapshot;
use crate::store::{StagedDelete, StagedWrite};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;

/// Staging key: (pk, kind name).
pub type SnapshotKey = (String, String);

/// Snapshots captured at prepare, waiting for the commit outcome.
pub type StagedSnapshots = HashMap<SnapshotKey, RawSnapshot>;

pub struct LifecycleHook {
    bus: Arc<EventBus>,
    tracked: DashSet<String>,
}

impl LifecycleHook {
    pub fn new(bus: Arc<EventBus>) -> Self {
        LifecycleHook {
            bus,
            tracked: DashSet::new(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Start tracking an entity kind and declare its event channels.
    ///
    /// # Errors
    /// `MissingPrimaryKey` when the kind has no pk field, and
    /// `DuplicateRegistration` when it is already tracked.
    pub fn track(&self, kind: &EntityKind) -> Result<()> {
        kind.require_primary_key()?;
        self.bus.declare(kind.name())?;
        self.tracked.insert(kind.name().to_string());
        info!("cache hook enabled for entity kind: {}", kind.name());
        Ok(())
    }

    pub fn is_tracked(&self, kind: &str) -> bool {
        self.tracked.contains(kind)
    }

    /// Capture a snapshot for every pending write of a tracked kind.
    ///
    /// A later write of the same (pk, kind) replaces the earlier one.
    pub fn on_prepare(&self, writes: &[StagedWrite], staged: &mut StagedSnapshots) {
        for write in writes {
            if !self.is_tracked(&write.kind) {
                continue;
            }
            staged.insert(
                (write.pk.clone(), write.kind.clone()),
                write.snapshot.clone(),
            );
        }
        debug!("staged {} snapshots at prepare", staged.len());
    }

    /// Publish one upsert per staged snapshot and one delete per deleted
    /// entity. Call only after the durable commit succeeded.
    ///
    /// Returns the number of events published.
    pub async fn on_commit(&self, staged: StagedSnapshots, deletes: &[StagedDelete]) -> usize {
        let mut published = 0;

        for ((pk, kind), snapshot) in staged {
            self.bus.publish(&CacheEvent::upsert(kind, pk, snapshot)).await;
            published += 1;
        }

        for delete in deletes {
            if !self.is_tracked(&delete.kind) {
                continue;
            }
            self.bus
                .publish(&CacheEvent::delete(delete.kind.clone(), delete.pk.clone()))
                .await;
            published += 1;
        }

        debug!("published {} cache events after commit", published);
        published
    }

    /// Drop staged snapshots without publishing anything.
    pub fn on_rollback(&self, staged: &mut StagedSnapshots) {
        if !staged.is_empty() {
            debug!("discarding {} staged snapshots on rollback", staged.len());
        }
        staged.clear();
    }
}
