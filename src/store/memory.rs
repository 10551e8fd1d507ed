//! In-memory persistent store for tests and demos.

use super::{ChangeSet, StoreConnection};
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::repository::DataRepository;
use crate::snapshot::RawSnapshot;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type RowKey = (String, String);

/// Shared table storage. Every [`MemoryConnection`] opened from the same store
/// sees the same rows, so replicas are always caught up.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<DashMap<RowKey, RawSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self, name: impl Into<String>) -> MemoryConnection {
        MemoryConnection {
            name: name.into(),
            rows: self.rows.clone(),
            valid: AtomicBool::new(true),
            fail_commits: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            recycles: AtomicUsize::new(0),
        }
    }

    /// Write a row directly, outside any unit of work.
    pub fn insert<T: CacheEntity>(&self, entity: &T) -> Result<()> {
        let snapshot = entity.to_snapshot()?;
        self.rows.insert(
            (T::kind_name().to_string(), entity.primary_key().to_string()),
            snapshot,
        );
        Ok(())
    }

    /// Read a row directly, outside any unit of work.
    pub fn get<T: CacheEntity>(&self, pk: &T::Key) -> Result<Option<T>> {
        let snapshot = self
            .rows
            .get(&(T::kind_name().to_string(), pk.to_string()))
            .map(|row| row.value().clone());
        snapshot.map(|s| T::from_snapshot(&s)).transpose()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One named handle onto a [`MemoryStore`].
pub struct MemoryConnection {
    name: String,
    rows: Arc<DashMap<RowKey, RawSnapshot>>,
    valid: AtomicBool,
    fail_commits: AtomicBool,
    commits: AtomicUsize,
    recycles: AtomicUsize,
}

impl MemoryConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every following commit fail, simulating a store that rejects the
    /// transaction.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn recycle_count(&self) -> usize {
        self.recycles.load(Ordering::SeqCst)
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Repository(format!(
                "connection '{}' has been invalidated",
                self.name
            )))
        }
    }
}

impl StoreConnection for MemoryConnection {
    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        self.check_valid()?;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Repository(format!(
                "commit rejected on '{}'",
                self.name
            )));
        }

        for write in &changes.writes {
            self.rows.insert(
                (write.kind.clone(), write.pk.clone()),
                write.snapshot.clone(),
            );
        }
        for delete in &changes.deletes {
            self.rows.remove(&(delete.kind.clone(), delete.pk.clone()));
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            "MemoryStore '{}' committed {} changes",
            self.name,
            changes.len()
        );
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.check_valid()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn recycle(&self) -> Result<()> {
        self.valid.store(true, Ordering::SeqCst);
        self.recycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<T: CacheEntity> DataRepository<T> for MemoryConnection {
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>> {
        self.check_valid()?;
        let snapshot = self
            .rows
            .get(&(T::kind_name().to_string(), id.to_string()))
            .map(|row| row.value().clone());
        snapshot.map(|s| T::from_snapshot(&s)).transpose()
    }

    async fn fetch_by_ids(&self, ids: &[T::Key]) -> Result<Vec<T>> {
        self.check_valid()?;
        let kind = T::kind_name().to_string();
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let snapshot = self
                .rows
                .get(&(kind.clone(), id.to_string()))
                .map(|row| row.value().clone());
            if let Some(snapshot) = snapshot {
                rows.push(T::from_snapshot(&snapshot)?);
            }
        }
        Ok(rows)
    }
}
