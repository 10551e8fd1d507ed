//! Per-kind cache façade.

use crate::backend::CacheBackend;
use crate::builder::CacheWriteBuilder;
use crate::callbacks::FailureCallbacks;
use crate::entity::{CacheEntity, EntityKind};
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventKind, EventPayload, EventSubscriber};
use crate::hook::LifecycleHook;
use crate::key::CacheKey;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::repository::DataRepository;
use crate::serialization::decode_snapshot;
use crate::snapshot::RawSnapshot;
use crate::store::StoreConnection;
use crate::unit_of_work::{Origin, UnitOfWork};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Window over an ordered pk list for [`EntityCache::mget_page`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    /// `None` takes everything after `offset`.
    pub limit: Option<usize>,
    /// Walk the pk list back to front before slicing.
    pub descending: bool,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Page {
            offset,
            limit: Some(limit),
            descending: false,
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn apply<'a, K>(&self, pks: &'a [K]) -> Vec<&'a K> {
        let ordered: Box<dyn Iterator<Item = &'a K> + 'a> = if self.descending {
            Box::new(pks.iter().rev())
        } else {
            Box::new(pks.iter())
        };
        ordered
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Cache for one entity kind, layered over a KV backend.
///
/// Reads go identity map, then KV cache, then store. Writes arrive from the
/// event bus after commits, or directly through [`set`](Self::set) and
/// [`write`](Self::write). Cache failures never fail a read: they are logged,
/// counted and answered from the store.
///
/// A kind without a primary-key field is store-only: reads skip the KV cache
/// and writes are ignored.
pub struct EntityCache<T: CacheEntity, B: CacheBackend> {
    kind: EntityKind,
    backend: B,
    callbacks: FailureCallbacks,
    metrics: Box<dyn CacheMetrics>,
    enabled: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: CacheEntity, B: CacheBackend> EntityCache<T, B> {
    /// # Errors
    /// `Config` when the descriptor name does not match `T::kind_name()`.
    pub fn new(kind: EntityKind, backend: B) -> Result<Self> {
        if kind.name() != T::kind_name() {
            return Err(Error::Config(format!(
                "descriptor '{}' does not describe entity kind '{}'",
                kind.name(),
                T::kind_name()
            )));
        }

        let enabled = match kind.require_primary_key() {
            Ok(_) => true,
            Err(e) => {
                warn!("{}; caching disabled, reads go to the store", e);
                false
            }
        };

        Ok(EntityCache {
            kind,
            backend,
            callbacks: FailureCallbacks::new(),
            metrics: Box::new(NoOpMetrics),
            enabled,
            _entity: PhantomData,
        })
    }

    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn callbacks(&self) -> &FailureCallbacks {
        &self.callbacks
    }

    /// Register a callback fired with (pk, error) for every failed cache
    /// mutation.
    pub fn register_failure_callback<F>(&self, callback: F, raise_on_error: bool)
    where
        F: Fn(&str, &Error) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register(callback, raise_on_error);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn key_for(&self, pk: &str) -> CacheKey {
        CacheKey::new(&self.kind, pk)
    }

    /// Track this kind on `hook` and subscribe to both of its event channels.
    pub fn attach(self: &Arc<Self>, hook: &LifecycleHook) -> Result<()> {
        if !self.enabled {
            warn!(
                "entity kind '{}' has no primary key; not attached to commit events",
                self.kind.name()
            );
            return Ok(());
        }

        hook.track(&self.kind)?;
        for event in EventKind::ALL {
            let subscriber: Arc<dyn EventSubscriber> = self.clone();
            hook.bus().subscribe(self.kind.name(), event, subscriber)?;
        }
        Ok(())
    }

    /// Fluent writer with TTL override and retry.
    pub fn write(&self) -> CacheWriteBuilder<'_, T, B> {
        CacheWriteBuilder::new(self)
    }

    /// Load one entity.
    ///
    /// Unless `force` is set, the unit's identity map and then the KV cache are
    /// consulted first. Anything else goes to the store and repopulates the
    /// cache on success.
    pub async fn get<C>(
        &self,
        uow: &mut UnitOfWork<C>,
        pk: &T::Key,
        force: bool,
    ) -> Result<Option<T>>
    where
        C: StoreConnection + DataRepository<T>,
    {
        uow.ensure_usable()?;
        let pk_str = pk.to_string();

        if uow.is_pending_delete::<T>(&pk_str) {
            return Ok(None);
        }

        if !force {
            if let Some(live) = uow.lookup::<T>(&pk_str) {
                debug!("✓ Identity map hit for {}|{}", self.kind.name(), pk_str);
                self.metrics.record_hit(self.kind.name(), 1);
                return Ok(Some(live));
            }

            if let Some(cached) = self.read_cached(&pk_str).await {
                uow.attach(&cached, Origin::Cache);
                self.metrics.record_hit(self.kind.name(), 1);
                return Ok(Some(cached));
            }
        }

        self.metrics.record_miss(self.kind.name(), 1);
        let conn = uow.connection(false).await?;
        let row = DataRepository::<T>::fetch_by_id(&*conn, pk).await?;

        match row {
            Some(entity) => {
                uow.attach(&entity, Origin::Store);
                self.repopulate(std::slice::from_ref(&entity)).await;
                Ok(Some(entity))
            }
            None => {
                debug!("{}|{} not in store", self.kind.name(), pk_str);
                Ok(None)
            }
        }
    }

    /// Load many entities in the caller's pk order. Absent pks are dropped,
    /// duplicates are repeated.
    pub async fn mget<C>(
        &self,
        uow: &mut UnitOfWork<C>,
        pks: &[T::Key],
        force: bool,
    ) -> Result<Vec<T>>
    where
        C: StoreConnection + DataRepository<T>,
    {
        let found = self.collect(uow, pks.iter(), force).await?;
        Ok(pks
            .iter()
            .filter_map(|pk| found.get(&pk.to_string()).cloned())
            .collect())
    }

    /// Load many entities as a pk → entity map.
    pub async fn mget_map<C>(
        &self,
        uow: &mut UnitOfWork<C>,
        pks: &[T::Key],
        force: bool,
    ) -> Result<HashMap<T::Key, T>>
    where
        C: StoreConnection + DataRepository<T>,
    {
        let found = self.collect(uow, pks.iter(), force).await?;
        Ok(found
            .into_values()
            .map(|entity| (entity.primary_key(), entity))
            .collect())
    }

    /// [`mget`](Self::mget) over one window of `pks`.
    pub async fn mget_page<C>(
        &self,
        uow: &mut UnitOfWork<C>,
        pks: &[T::Key],
        page: Page,
        force: bool,
    ) -> Result<Vec<T>>
    where
        C: StoreConnection + DataRepository<T>,
    {
        let window = page.apply(pks);
        let found = self.collect(uow, window.iter().copied(), force).await?;
        Ok(window
            .into_iter()
            .filter_map(|pk| found.get(&pk.to_string()).cloned())
            .collect())
    }

    /// Resolve a pk set with at most one KV round trip and one store query.
    async fn collect<'k, C, I>(
        &self,
        uow: &mut UnitOfWork<C>,
        pks: I,
        force: bool,
    ) -> Result<HashMap<String, T>>
    where
        C: StoreConnection + DataRepository<T>,
        I: IntoIterator<Item = &'k T::Key>,
    {
        uow.ensure_usable()?;

        let mut seen = HashSet::new();
        let mut pending: Vec<(String, &T::Key)> = Vec::new();
        for pk in pks {
            let pk_str = pk.to_string();
            if seen.insert(pk_str.clone()) && !uow.is_pending_delete::<T>(&pk_str) {
                pending.push((pk_str, pk));
            }
        }

        let mut found = HashMap::with_capacity(pending.len());
        if pending.is_empty() {
            return Ok(found);
        }

        let mut hits = 0;
        if !force {
            pending.retain(|(pk_str, _)| match uow.lookup::<T>(pk_str) {
                Some(live) => {
                    found.insert(pk_str.clone(), live);
                    hits += 1;
                    false
                }
                None => true,
            });

            if !pending.is_empty() {
                let pk_strs: Vec<&str> = pending.iter().map(|(s, _)| s.as_str()).collect();
                let cached = self.read_cached_many(&pk_strs).await;
                for (pk_str, entity) in pending.iter().zip(cached) {
                    if let Some(entity) = entity {
                        uow.attach(&entity, Origin::Cache);
                        found.insert(pk_str.0.clone(), entity);
                        hits += 1;
                    }
                }
                pending.retain(|(pk_str, _)| !found.contains_key(pk_str));
            }
        }

        if hits > 0 {
            self.metrics.record_hit(self.kind.name(), hits);
        }
        if pending.is_empty() {
            return Ok(found);
        }

        self.metrics.record_miss(self.kind.name(), pending.len());
        let missing: Vec<T::Key> = pending.iter().map(|(_, pk)| (*pk).clone()).collect();
        let conn = uow.connection(false).await?;
        let rows = DataRepository::<T>::fetch_by_ids(&*conn, &missing).await?;
        debug!(
            "{}: {} of {} misses found in store",
            self.kind.name(),
            rows.len(),
            missing.len()
        );

        self.repopulate(&rows).await;
        for row in rows {
            uow.attach(&row, Origin::Store);
            found.insert(row.primary_key().to_string(), row);
        }
        Ok(found)
    }

    /// Cache one entity. TTL: `ttl`, then the kind default, then none.
    pub async fn set(&self, entity: &T, ttl: Option<Duration>) -> Result<()> {
        self.writer(ttl).set(entity).await
    }

    /// Cache many entities in one batched write.
    pub async fn mset(&self, entities: &[T], ttl: Option<Duration>) -> Result<()> {
        self.writer(ttl).mset(entities).await
    }

    /// Cache a snapshot under an explicit pk.
    pub async fn set_raw(&self, pk: &str, snapshot: RawSnapshot, ttl: Option<Duration>) -> Result<()> {
        self.writer(ttl).set_raw(pk, snapshot).await
    }

    /// Cache a snapshot, reading its pk from the kind's pk field.
    pub async fn set_raw_snapshot(&self, snapshot: RawSnapshot, ttl: Option<Duration>) -> Result<()> {
        let pk = self.kind.pk_of(&snapshot)?;
        self.set_raw(&pk, snapshot, ttl).await
    }

    fn writer(&self, ttl: Option<Duration>) -> CacheWriteBuilder<'_, T, B> {
        match ttl {
            Some(ttl) => self.write().with_ttl(ttl),
            None => self.write(),
        }
    }

    /// Remove cached entries. Absent keys are not an error.
    pub async fn flush(&self, pks: &[T::Key]) -> Result<()> {
        let pks: Vec<String> = pks.iter().map(|pk| pk.to_string()).collect();
        self.flush_raw(&pks).await
    }

    pub async fn flush_raw(&self, pks: &[String]) -> Result<()> {
        if !self.enabled || pks.is_empty() {
            return Ok(());
        }

        let keys: Vec<CacheKey> = pks.iter().map(|pk| self.key_for(pk)).collect();
        let refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        match self.backend.mdelete(&refs).await {
            Ok(()) => {
                debug!("Flushed {} {} entries", refs.len(), self.kind.name());
                Ok(())
            }
            Err(e) => self.report_failure(pks.iter().map(String::as_str), &e),
        }
    }

    /// Route a failed cache mutation to metrics, the log and the callbacks.
    pub(crate) fn report_failure<'a, I>(&self, pks: I, error: &Error) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        warn!("Cache write for '{}' failed: {}", self.kind.name(), error);
        self.metrics.record_error(self.kind.name(), &error.to_string());
        self.callbacks.notify_all(pks, error)
    }

    async fn read_cached(&self, pk: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let key = self.key_for(pk);
        match self.backend.get(key.as_str()).await {
            Ok(Some(bytes)) => {
                let decoded = self.decode(&key, &bytes);
                if decoded.is_some() {
                    debug!("✓ Cache hit for {}", key);
                }
                decoded
            }
            Ok(None) => {
                debug!("✗ Cache miss for {}", key);
                None
            }
            Err(e) => {
                warn!("Cache read of {} failed, falling back to store: {}", key, e);
                self.metrics.record_error(self.kind.name(), &e.to_string());
                None
            }
        }
    }

    async fn read_cached_many(&self, pks: &[&str]) -> Vec<Option<T>> {
        if !self.enabled {
            return vec![None; pks.len()];
        }

        let keys: Vec<CacheKey> = pks.iter().map(|pk| self.key_for(pk)).collect();
        let refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        match self.backend.mget(&refs).await {
            Ok(values) if values.len() == keys.len() => keys
                .iter()
                .zip(values)
                .map(|(key, value)| value.and_then(|bytes| self.decode(key, &bytes)))
                .collect(),
            Ok(values) => {
                warn!(
                    "Cache multi-get returned {} values for {} keys; ignoring",
                    values.len(),
                    keys.len()
                );
                vec![None; pks.len()]
            }
            Err(e) => {
                warn!("Cache multi-get failed, falling back to store: {}", e);
                self.metrics.record_error(self.kind.name(), &e.to_string());
                vec![None; pks.len()]
            }
        }
    }

    fn decode(&self, key: &CacheKey, bytes: &[u8]) -> Option<T> {
        match decode_snapshot(bytes).and_then(|s| T::from_snapshot(&s)) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!("Treating malformed cache entry {} as a miss: {}", key, e);
                self.metrics.record_error(self.kind.name(), &e.to_string());
                None
            }
        }
    }

    async fn repopulate(&self, rows: &[T]) {
        if !self.enabled || rows.is_empty() {
            return;
        }
        if let Err(e) = self.write().mset(rows).await {
            error!("Cache repopulation for '{}' failed: {}", self.kind.name(), e);
        }
    }
}

impl<T: CacheEntity, B: CacheBackend> EventSubscriber for EntityCache<T, B> {
    fn handle<'a>(&'a self, event: &'a CacheEvent) -> BoxFuture<'a, Result<()>> {
        async move {
            match &event.payload {
                EventPayload::Snapshot(snapshot) => {
                    self.set_raw(&event.pk, snapshot.clone(), None).await
                }
                EventPayload::Deleted => self.flush_raw(std::slice::from_ref(&event.pk)).await,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::RouterConfig;
    use crate::events::EventBus;
    use crate::observability::testing::CountingMetrics;
    use crate::serialization::encode_snapshot;
    use crate::store::{MemoryConnection, MemoryStore, StoreRouter};
    use crate::testing::{FlakyBackend, User};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user_kind() -> EntityKind {
        EntityKind::of::<User>().primary_key("id")
    }

    struct Fixture<B: CacheBackend> {
        store: MemoryStore,
        router: Arc<StoreRouter<MemoryConnection>>,
        hook: Arc<LifecycleHook>,
        cache: Arc<EntityCache<User, B>>,
        metrics: CountingMetrics,
    }

    impl<B: CacheBackend> Fixture<B> {
        fn new(backend: B) -> Self {
            Self::with_kind(user_kind(), backend)
        }

        fn with_kind(kind: EntityKind, backend: B) -> Self {
            let store = MemoryStore::new();
            let mut router = StoreRouter::new(RouterConfig::default());
            router
                .register_primary("primary", store.connection("primary"))
                .expect("register");
            let hook = Arc::new(LifecycleHook::new(Arc::new(EventBus::new())));

            let metrics = CountingMetrics::default();
            let cache = Arc::new(
                EntityCache::new(kind, backend)
                    .expect("cache")
                    .with_metrics(Box::new(metrics.clone())),
            );
            cache.attach(&hook).expect("attach");

            Fixture {
                store,
                router: Arc::new(router),
                hook,
                cache,
                metrics,
            }
        }

        fn uow(&self) -> UnitOfWork<MemoryConnection> {
            UnitOfWork::new(self.router.clone(), self.hook.clone())
        }
    }

    #[tokio::test]
    async fn test_identity_map_hit_skips_backend() {
        let backend = FlakyBackend::new();
        let fx = Fixture::new(backend.clone());
        let mut uow = fx.uow();
        uow.add(&User::new(1, "local")).expect("add");

        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");

        assert_eq!(got, Some(User::new(1, "local")));
        assert_eq!(backend.reads(), 0);
        assert_eq!(fx.metrics.hits(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_is_flagged_as_cache_origin() {
        let fx = Fixture::new(InMemoryBackend::new());
        fx.cache.set(&User::new(1, "cached"), None).await.expect("set");
        let mut uow = fx.uow();

        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");

        assert_eq!(got, Some(User::new(1, "cached")));
        assert_eq!(uow.origin::<User>(&1), Some(Origin::Cache));
        assert_eq!(fx.metrics.misses(), 0);
    }

    #[tokio::test]
    async fn test_miss_falls_back_and_repopulates() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "stored")).expect("insert");
        let mut uow = fx.uow();

        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");

        assert_eq!(got, Some(User::new(1, "stored")));
        assert_eq!(uow.origin::<User>(&1), Some(Origin::Store));
        assert_eq!(backend.keys(), vec!["user|1".to_string()]);
        assert_eq!(fx.metrics.misses(), 1);
    }

    #[tokio::test]
    async fn test_absent_everywhere_is_none() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        let mut uow = fx.uow();

        assert_eq!(fx.cache.get(&mut uow, &42, false).await.expect("get"), None);
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_backend_down_falls_back_to_store() {
        let backend = FlakyBackend::new();
        backend.set_down(true);
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "stored")).expect("insert");

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        fx.cache.register_failure_callback(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            false,
        );

        let mut uow = fx.uow();
        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");

        assert_eq!(got, Some(User::new(1, "stored")));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(fx.metrics.errors() >= 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_a_miss() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "stored")).expect("insert");
        backend
            .set("user|1", b"garbage".to_vec(), None)
            .await
            .expect("seed");

        let mut uow = fx.uow();
        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");
        assert_eq!(got, Some(User::new(1, "stored")));

        // repopulation replaced the garbage
        let bytes = backend.get("user|1").await.expect("get").expect("present");
        assert!(decode_snapshot(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_force_bypasses_identity_map_and_cache() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "fresh")).expect("insert");
        fx.cache.set(&User::new(1, "stale"), None).await.expect("set");

        let mut uow = fx.uow();
        let got = fx.cache.get(&mut uow, &1, true).await.expect("get");
        assert_eq!(got, Some(User::new(1, "fresh")));
    }

    #[tokio::test]
    async fn test_mget_partial_hits_in_caller_order() {
        let backend = FlakyBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "one")).expect("insert");
        fx.store.insert(&User::new(2, "two")).expect("insert");
        fx.cache.set(&User::new(1, "one"), None).await.expect("set");
        let reads_before = backend.reads();

        let mut uow = fx.uow();
        let rows = fx.cache.mget(&mut uow, &[1, 2, 3], false).await.expect("mget");

        assert_eq!(rows, vec![User::new(1, "one"), User::new(2, "two")]);
        assert_eq!(backend.reads() - reads_before, 1);
        assert_eq!(
            backend.inner.keys(),
            vec!["user|1".to_string(), "user|2".to_string()]
        );
        assert_eq!(uow.origin::<User>(&1), Some(Origin::Cache));
        assert_eq!(uow.origin::<User>(&2), Some(Origin::Store));
    }

    #[tokio::test]
    async fn test_mget_checks_identity_map_per_pk() {
        let backend = FlakyBackend::new();
        let fx = Fixture::new(backend.clone());
        let mut uow = fx.uow();
        uow.add(&User::new(1, "a")).expect("add");
        uow.add(&User::new(2, "b")).expect("add");

        let rows = fx.cache.mget(&mut uow, &[2, 1], false).await.expect("mget");

        assert_eq!(rows, vec![User::new(2, "b"), User::new(1, "a")]);
        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn test_mget_empty_input_makes_no_calls() {
        let backend = FlakyBackend::new();
        let fx = Fixture::new(backend.clone());
        let mut uow = fx.uow();

        let rows = fx.cache.mget(&mut uow, &[], false).await.expect("mget");
        assert!(rows.is_empty());
        assert_eq!(backend.reads(), 0);
        assert_eq!(uow.connection_name(), None);
    }

    #[tokio::test]
    async fn test_mget_map_and_duplicates() {
        let fx = Fixture::new(InMemoryBackend::new());
        fx.store.insert(&User::new(1, "one")).expect("insert");
        let mut uow = fx.uow();

        let rows = fx.cache.mget(&mut uow, &[1, 1, 9], false).await.expect("mget");
        assert_eq!(rows, vec![User::new(1, "one"), User::new(1, "one")]);

        let map = fx.cache.mget_map(&mut uow, &[1, 9], false).await.expect("mget_map");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&1), Some(&User::new(1, "one")));
    }

    #[tokio::test]
    async fn test_mget_page_slices_before_lookup() {
        let fx = Fixture::new(InMemoryBackend::new());
        for id in 1..=5 {
            fx.store.insert(&User::new(id, "u")).expect("insert");
        }
        let mut uow = fx.uow();
        let pks = [1, 2, 3, 4, 5];

        let page = fx
            .cache
            .mget_page(&mut uow, &pks, Page::new(1, 2), false)
            .await
            .expect("page");
        assert_eq!(page.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2, 3]);

        let page = fx
            .cache
            .mget_page(&mut uow, &pks, Page::new(0, 2).descending(), false)
            .await
            .expect("page");
        assert_eq!(page.iter().map(|u| u.id).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[tokio::test]
    async fn test_set_uses_kind_default_ttl() {
        let backend = InMemoryBackend::new();
        let kind = user_kind().ttl(Duration::from_secs(60));
        let fx = Fixture::with_kind(kind, backend.clone());

        fx.cache.set(&User::new(1, "a"), None).await.expect("set");
        fx.cache
            .set(&User::new(2, "b"), Some(Duration::from_secs(5)))
            .await
            .expect("set");

        let default_ttl = backend.ttl_of("user|1").expect("ttl");
        assert!(default_ttl > Duration::from_secs(55));
        let explicit_ttl = backend.ttl_of("user|2").expect("ttl");
        assert!(explicit_ttl <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_version_tag_changes_keys() {
        let backend = InMemoryBackend::new();
        let old = EntityCache::<User, _>::new(user_kind().version("v1"), backend.clone())
            .expect("cache");
        let new = EntityCache::<User, _>::new(user_kind().version("v2"), backend.clone())
            .expect("cache");

        old.set(&User::new(1, "old"), None).await.expect("set");
        assert!(new.read_cached("1").await.is_none());
        assert_eq!(new.key_for("1").as_str(), "user|1|v2");
    }

    #[tokio::test]
    async fn test_flush_then_get_hits_store() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.store.insert(&User::new(1, "stored")).expect("insert");
        fx.cache.set(&User::new(1, "cached"), None).await.expect("set");

        fx.cache.flush(&[1, 7]).await.expect("flush");
        assert!(backend.is_empty().await);

        let mut uow = fx.uow();
        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");
        assert_eq!(got, Some(User::new(1, "stored")));
    }

    #[tokio::test]
    async fn test_raising_callback_surfaces_write_failure() {
        let backend = FlakyBackend::new();
        let fx = Fixture::new(backend.clone());
        fx.cache
            .register_failure_callback(|pk, _| Err(Error::Callback(format!("alert {}", pk))), true);

        backend.set_down(true);
        let err = fx
            .cache
            .set(&User::new(1, "a"), None)
            .await
            .expect_err("raised");
        assert!(matches!(err, Error::Callback(_)));

        fx.cache.callbacks().clear();
        assert!(fx.cache.flush(&[1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_events_drive_cache_writes() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        let snapshot = User::new(3, "evt").to_snapshot().expect("snapshot");

        fx.hook
            .bus()
            .publish(&CacheEvent::upsert("user", "3", snapshot.clone()))
            .await;
        let bytes = backend.get("user|3").await.expect("get").expect("present");
        assert_eq!(decode_snapshot(&bytes).expect("decode"), snapshot);

        fx.hook.bus().publish(&CacheEvent::delete("user", "3")).await;
        assert!(backend.get("user|3").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_set_raw_snapshot_reads_pk_field() {
        let backend = InMemoryBackend::new();
        let fx = Fixture::new(backend.clone());
        let snapshot = RawSnapshot::default().with("id", 8_i64).with("name", "raw");

        fx.cache
            .set_raw_snapshot(snapshot.clone(), None)
            .await
            .expect("set_raw_snapshot");
        let bytes = backend.get("user|8").await.expect("get").expect("present");
        assert_eq!(bytes, encode_snapshot(&snapshot).expect("encode"));
    }

    #[tokio::test]
    async fn test_kind_without_pk_is_store_only() {
        let backend = FlakyBackend::new();
        let fx = Fixture::with_kind(EntityKind::of::<User>(), backend.clone());
        assert!(!fx.cache.is_enabled());
        fx.store.insert(&User::new(1, "stored")).expect("insert");

        let mut uow = fx.uow();
        let got = fx.cache.get(&mut uow, &1, false).await.expect("get");

        assert_eq!(got, Some(User::new(1, "stored")));
        assert_eq!(backend.reads(), 0);
        assert_eq!(backend.writes(), 0);
        assert!(!fx.hook.is_tracked("user"));
    }

    #[test]
    fn test_descriptor_must_match_entity() {
        let result = EntityCache::<User, _>::new(EntityKind::new("order"), InMemoryBackend::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_page_bounds() {
        let pks = [1, 2, 3];
        assert_eq!(Page::new(5, 2).apply(&pks), Vec::<&i32>::new());
        assert_eq!(Page::default().apply(&pks), vec![&1, &2, &3]);
    }

    proptest! {
        #[test]
        fn prop_page_never_exceeds_limit(len in 0usize..50, offset in 0usize..60, limit in 0usize..20) {
            let pks: Vec<usize> = (0..len).collect();
            let window = Page::new(offset, limit).apply(&pks);
            prop_assert!(window.len() <= limit);
            prop_assert_eq!(window.len(), len.saturating_sub(offset).min(limit));
        }

        #[test]
        fn prop_mget_follows_caller_order(
            stored in prop::collection::btree_set(0u64..12, 0..12),
            cached in prop::collection::btree_set(0u64..12, 0..12),
            pks in prop::collection::vec(0u64..12, 0..24),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            let (first, second) = runtime.block_on(async {
                let fx = Fixture::new(InMemoryBackend::new());
                for id in &stored {
                    let user = User::new(*id, &format!("u{}", id));
                    fx.store.insert(&user).expect("insert");
                    if cached.contains(id) {
                        fx.cache.set(&user, None).await.expect("set");
                    }
                }

                let mut uow = fx.uow();
                let first = fx.cache.mget(&mut uow, &pks, false).await.expect("mget");
                uow.close().await.expect("close");

                // second pass is served from the repopulated cache
                let mut uow = fx.uow();
                let second = fx.cache.mget(&mut uow, &pks, false).await.expect("mget");
                uow.close().await.expect("close");
                (first, second)
            });

            let expected: Vec<User> = pks
                .iter()
                .filter(|id| stored.contains(*id))
                .map(|id| User::new(*id, &format!("u{}", id)))
                .collect();
            prop_assert_eq!(&first, &expected);
            prop_assert_eq!(&second, &expected);
        }
    }
}
