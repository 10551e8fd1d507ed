//! Wire a router, hook and cache together and walk one entity through its
//! lifecycle.
//!
//! Run with `RUST_LOG=debug cargo run --example basic_usage`.

use entity_cache::backend::InMemoryBackend;
use entity_cache::{
    CacheEntity, EntityCache, EntityKind, EventBus, LifecycleHook, MemoryStore, Result,
    RouterConfig, StoreRouter, UnitOfWork,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
    email: String,
}

impl CacheEntity for User {
    type Key = u64;

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn kind_name() -> &'static str {
        "user"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let store = MemoryStore::new();
    let mut router = StoreRouter::new(RouterConfig::from_env());
    router.register_primary("primary", store.connection("primary"))?;
    router.register_replica("replica-1", store.connection("replica-1"), 2)?;
    router.register_replica("replica-2", store.connection("replica-2"), 1)?;
    let router = Arc::new(router);

    let hook = Arc::new(LifecycleHook::new(Arc::new(EventBus::new())));
    let backend = InMemoryBackend::new();
    let users = Arc::new(EntityCache::<User, _>::new(
        EntityKind::of::<User>()
            .primary_key("id")
            .ttl(Duration::from_secs(600)),
        backend.clone(),
    )?);
    users.attach(&hook)?;

    // Write path: the cache is populated by the commit event.
    let mut uow = UnitOfWork::new(router.clone(), hook.clone());
    uow.add(&User {
        id: 1,
        name: "Ada".into(),
        email: "ada@example.com".into(),
    })?;
    uow.commit().await?;
    uow.close().await?;
    println!("cached keys after commit: {:?}", backend.keys());

    // Read path: served from the KV cache.
    let mut uow = UnitOfWork::new(router.clone(), hook.clone());
    let user = users.get(&mut uow, &1, false).await?;
    println!("read {:?} (origin {:?})", user, uow.origin::<User>(&1));

    // Batched read: 1 from the identity map, 2 from the store, 3 absent.
    store.insert(&User {
        id: 2,
        name: "Grace".into(),
        email: "grace@example.com".into(),
    })?;
    let batch = users.mget(&mut uow, &[1, 2, 3], false).await?;
    println!("mget returned {} rows", batch.len());
    uow.close().await?;

    // Delete path: the commit event flushes the entry.
    let mut uow = UnitOfWork::new(router.clone(), hook.clone());
    uow.delete_by_pk::<User>(&1)?;
    uow.commit().await?;
    uow.close().await?;
    println!("cached keys after delete: {:?}", backend.keys());

    router.shutdown(router.config().close_timeout()).await
}
