//! End-to-end scenarios: unit of work, hook, event bus and entity cache wired
//! together over the in-memory backend and store.

use entity_cache::backend::InMemoryBackend;
use entity_cache::serialization::decode_snapshot;
use entity_cache::{
    CacheBackend, CacheEntity, EntityCache, EntityKind, Error, EventBus, EventKind,
    LifecycleHook, MemoryConnection, MemoryStore, Origin, Result, RouterConfig, StoreRouter,
    UnitOfWork, UowState,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    id: u64,
    name: String,
}

impl Account {
    fn new(id: u64, name: &str) -> Self {
        Account {
            id,
            name: name.to_string(),
        }
    }
}

impl CacheEntity for Account {
    type Key = u64;

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn kind_name() -> &'static str {
        "account"
    }
}

/// Backend that can be switched off to simulate a lost cache connection.
#[derive(Clone, Default)]
struct SwitchableBackend {
    inner: InMemoryBackend,
    down: Arc<AtomicBool>,
}

impl SwitchableBackend {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("connection reset".into()));
        }
        Ok(())
    }
}

impl CacheBackend for SwitchableBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }
}

struct App<B: CacheBackend> {
    store: MemoryStore,
    router: Arc<StoreRouter<MemoryConnection>>,
    hook: Arc<LifecycleHook>,
    accounts: Arc<EntityCache<Account, B>>,
}

impl<B: CacheBackend> App<B> {
    fn new(backend: B) -> Self {
        Self::with_kind(EntityKind::of::<Account>().primary_key("id"), backend)
    }

    fn with_kind(kind: EntityKind, backend: B) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let store = MemoryStore::new();
        let mut router = StoreRouter::new(RouterConfig::default());
        router
            .register_primary("primary", store.connection("primary"))
            .expect("register primary");
        router
            .register_replica("replica", store.connection("replica"), 1)
            .expect("register replica");

        let hook = Arc::new(LifecycleHook::new(Arc::new(EventBus::new())));
        let accounts = Arc::new(EntityCache::new(kind, backend).expect("cache"));
        accounts.attach(&hook).expect("attach");

        App {
            store,
            router: Arc::new(router),
            hook,
            accounts,
        }
    }

    fn uow(&self) -> UnitOfWork<MemoryConnection> {
        UnitOfWork::new(self.router.clone(), self.hook.clone())
    }

    async fn read(&self, id: u64) -> Option<Account> {
        let mut uow = self.uow();
        let found = self.accounts.get(&mut uow, &id, false).await.expect("get");
        uow.close().await.expect("close");
        found
    }
}

#[tokio::test]
async fn test_insert_update_delete_lifecycle() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());

    let mut uow = app.uow();
    uow.add(&Account::new(1, "a")).expect("add");
    uow.commit().await.expect("commit");
    uow.close().await.expect("close");
    assert_eq!(backend.keys(), vec!["account|1".to_string()]);
    assert_eq!(app.read(1).await, Some(Account::new(1, "a")));

    let mut uow = app.uow();
    uow.add(&Account::new(1, "b")).expect("add");
    uow.commit().await.expect("commit");
    uow.close().await.expect("close");
    assert_eq!(app.read(1).await, Some(Account::new(1, "b")));

    let mut uow = app.uow();
    uow.delete_by_pk::<Account>(&1).expect("delete");
    uow.commit().await.expect("commit");
    uow.close().await.expect("close");
    assert!(backend.is_empty().await);
    assert_eq!(app.read(1).await, None);
    assert_eq!(app.store.get::<Account>(&1).expect("store"), None);
}

#[tokio::test]
async fn test_committed_snapshot_is_what_gets_cached() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());

    let mut uow = app.uow();
    uow.add(&Account::new(1, "a")).expect("add");
    uow.commit().await.expect("commit");
    uow.close().await.expect("close");

    let bytes = backend
        .get("account|1")
        .await
        .expect("get")
        .expect("cached");
    let snapshot = decode_snapshot(&bytes).expect("decode");
    assert_eq!(
        snapshot,
        Account::new(1, "a").to_snapshot().expect("snapshot")
    );
}

#[tokio::test]
async fn test_mget_with_store_hit_and_absent_row() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());
    app.store.insert(&Account::new(1, "one")).expect("insert");
    app.store.insert(&Account::new(2, "two")).expect("insert");
    app.accounts
        .set(&Account::new(1, "one"), None)
        .await
        .expect("set");

    let mut uow = app.uow();
    let rows = app
        .accounts
        .mget(&mut uow, &[1, 2, 3], false)
        .await
        .expect("mget");
    uow.close().await.expect("close");

    assert_eq!(rows, vec![Account::new(1, "one"), Account::new(2, "two")]);
    assert_eq!(
        backend.keys(),
        vec!["account|1".to_string(), "account|2".to_string()]
    );
}

#[tokio::test]
async fn test_rollback_leaves_no_cache_entry() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());

    let mut uow = app.uow();
    uow.add(&Account::new(5, "ghost")).expect("add");
    uow.rollback().await.expect("rollback");
    assert_eq!(uow.state(), UowState::RolledBack);
    uow.close().await.expect("close");

    assert!(backend.is_empty().await);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_rejected_commit_leaves_no_cache_entry() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());
    app.router
        .connection("primary")
        .expect("primary")
        .fail_commits(true);

    let mut uow = app.uow();
    uow.add(&Account::new(5, "ghost")).expect("add");
    assert!(uow.commit().await.is_err());
    uow.close().await.expect("close");

    assert!(backend.is_empty().await);
}

#[tokio::test]
async fn test_flush_then_get_reads_store() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());
    app.store.insert(&Account::new(1, "truth")).expect("insert");
    app.accounts
        .set(&Account::new(1, "stale"), None)
        .await
        .expect("set");
    assert_eq!(app.read(1).await, Some(Account::new(1, "stale")));

    app.accounts.flush(&[1]).await.expect("flush");
    assert_eq!(app.read(1).await, Some(Account::new(1, "truth")));
}

#[tokio::test]
async fn test_cache_outage_is_invisible_to_readers() {
    let backend = SwitchableBackend::default();
    let app = App::new(backend.clone());
    app.store.insert(&Account::new(1, "a")).expect("insert");
    backend.down.store(true, Ordering::SeqCst);

    assert_eq!(app.read(1).await, Some(Account::new(1, "a")));

    let mut uow = app.uow();
    uow.add(&Account::new(2, "b")).expect("add");
    uow.commit().await.expect("commit survives cache outage");
    uow.close().await.expect("close");
    assert_eq!(app.store.get::<Account>(&2).expect("store"), Some(Account::new(2, "b")));

    backend.down.store(false, Ordering::SeqCst);
    assert_eq!(app.read(2).await, Some(Account::new(2, "b")));
}

#[tokio::test]
async fn test_version_bump_orphans_old_entries() {
    let backend = InMemoryBackend::new();
    let v1 = App::with_kind(
        EntityKind::of::<Account>().primary_key("id").version("v1"),
        backend.clone(),
    );
    v1.accounts
        .set(&Account::new(1, "old shape"), None)
        .await
        .expect("set");

    let v2 = EntityCache::<Account, _>::new(
        EntityKind::of::<Account>().primary_key("id").version("v2"),
        backend.clone(),
    )
    .expect("cache");
    v1.store.insert(&Account::new(1, "current")).expect("insert");

    let mut uow = v1.uow();
    let got = v2.get(&mut uow, &1, false).await.expect("get");
    uow.close().await.expect("close");

    assert_eq!(got, Some(Account::new(1, "current")));
    assert_eq!(
        backend.keys(),
        vec!["account|1|v1".to_string(), "account|1|v2".to_string()]
    );
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_cache() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    app.hook
        .bus()
        .subscribe_fn("account", EventKind::RawUpsert, |_| {
            Err(Error::Callback("audit sink offline".into()))
        })
        .expect("subscribe");
    let counter = calls.clone();
    app.hook
        .bus()
        .subscribe_fn("account", EventKind::RawUpsert, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("subscribe");

    let mut uow = app.uow();
    uow.add(&Account::new(1, "a")).expect("add");
    uow.commit().await.expect("commit");
    uow.close().await.expect("close");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.keys(), vec!["account|1".to_string()]);
}

#[tokio::test]
async fn test_identity_map_serves_repeat_reads() {
    let backend = InMemoryBackend::new();
    let app = App::new(backend.clone());
    app.store.insert(&Account::new(1, "a")).expect("insert");

    let mut uow = app.uow();
    app.accounts.get(&mut uow, &1, false).await.expect("get");
    assert_eq!(uow.origin::<Account>(&1), Some(Origin::Store));

    backend.clear_all().await.expect("clear");
    let again = app.accounts.get(&mut uow, &1, false).await.expect("get");
    assert_eq!(again, Some(Account::new(1, "a")));
    assert!(backend.is_empty().await);
    uow.close().await.expect("close");
}
