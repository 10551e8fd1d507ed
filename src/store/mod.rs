//! Persistent store connections and routing.

use crate::error::Result;
use crate::snapshot::RawSnapshot;
use std::future::Future;

mod balance;
mod memory;
mod router;

pub use balance::LoadBalanceStrategy;
pub use memory::{MemoryConnection, MemoryStore};
pub use router::{jittered, Role, RoutedConnection, StoreRouter};

/// A pending insert or update, captured when it was added to a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub kind: String,
    pub pk: String,
    pub snapshot: RawSnapshot,
}

/// A pending delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDelete {
    pub kind: String,
    pub pk: String,
}

/// Everything a unit of work asks the store to make durable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub writes: Vec<StagedWrite>,
    pub deletes: Vec<StagedDelete>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }
}

/// Transaction hooks of one named store connection.
///
/// `commit` must only return `Ok` once the change set is durable. `rollback`
/// and `close` may block on the driver; the router bounds them with a deadline
/// and calls `invalidate` when the deadline passes.
pub trait StoreConnection: Send + Sync + 'static {
    /// Flush the change set inside the open transaction.
    fn prepare(&self, _changes: &ChangeSet) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn commit(&self, changes: &ChangeSet) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&self) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Mark the underlying connection unusable without waiting on the driver.
    fn invalidate(&self);

    fn is_valid(&self) -> bool;

    /// Replace the underlying connection with a fresh one.
    fn recycle(&self) -> impl Future<Output = Result<()>> + Send;
}
