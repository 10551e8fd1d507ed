//! Read side of the persistent store.

use crate::entity::CacheEntity;
use crate::error::Result;
use std::future::Future;

/// Primary-key lookups against the persistent store.
///
/// The entity cache falls back to this on a miss. Implement it for your
/// connection type (SQLx pool, tokio-postgres client, ...).
///
/// # Example
///
/// ```ignore
/// impl DataRepository<User> for PgConnection {
///     async fn fetch_by_id(&self, id: &u64) -> Result<Option<User>> {
///         sqlx::query_as("SELECT * FROM users WHERE id = $1")
///             .bind(*id as i64)
///             .fetch_optional(&self.pool)
///             .await
///             .map_err(|e| Error::Repository(e.to_string()))
///     }
/// }
/// ```
pub trait DataRepository<T: CacheEntity>: Send + Sync {
    /// Point lookup.
    fn fetch_by_id(&self, id: &T::Key) -> impl Future<Output = Result<Option<T>>> + Send;

    /// Batched lookup. Rows that do not exist are simply absent from the
    /// result; order is unspecified.
    ///
    /// The default issues one point lookup per id. Override it with a single
    /// `WHERE pk IN (...)` query.
    fn fetch_by_ids(&self, ids: &[T::Key]) -> impl Future<Output = Result<Vec<T>>> + Send {
        async move {
            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(row) = self.fetch_by_id(id).await? {
                    rows.push(row);
                }
            }
            Ok(rows)
        }
    }
}
