//! # entity-cache
//!
//! Entity caching kept consistent with a transactional store.
//!
//! ## Features
//!
//! - **Commit-driven:** cache entries are written only after the store reports a
//!   durable commit, never for rolled-back work
//! - **Layered reads:** identity map, then KV cache, then store, with
//!   repopulation on a miss
//! - **Batched:** `mget` resolves any pk set with one KV round trip and one
//!   store query
//! - **Backend Agnostic:** in-memory, Redis and Memcached backends
//! - **Routed:** one primary and any number of replicas, with pinning, pluggable
//!   load balancing and deadline-bounded rollback/close
//!
//! ## Quick Start
//!
//! ```ignore
//! use entity_cache::{
//!     backend::InMemoryBackend, EntityCache, EntityKind, EventBus, LifecycleHook,
//!     MemoryStore, RouterConfig, StoreRouter, UnitOfWork,
//! };
//! use std::sync::Arc;
//!
//! // 1. Route a store
//! let store = MemoryStore::new();
//! let mut router = StoreRouter::new(RouterConfig::from_env());
//! router.register_primary("primary", store.connection("primary"))?;
//! let router = Arc::new(router);
//!
//! // 2. Wire the hook and a cache for each entity kind
//! let hook = Arc::new(LifecycleHook::new(Arc::new(EventBus::new())));
//! let users = Arc::new(EntityCache::<User, _>::new(
//!     EntityKind::of::<User>().primary_key("id"),
//!     InMemoryBackend::new(),
//! )?);
//! users.attach(&hook)?;
//!
//! // 3. Work inside a unit of work
//! let mut uow = UnitOfWork::new(router.clone(), hook.clone());
//! uow.add(&User { id: 1, name: "a".into() })?;
//! uow.commit().await?;
//! let user = users.get(&mut uow, &1, false).await?;
//! uow.close().await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod cache;
pub mod callbacks;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod hook;
pub mod key;
pub mod observability;
pub mod repository;
pub mod serialization;
pub mod snapshot;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use builder::CacheWriteBuilder;
pub use cache::{EntityCache, Page};
pub use callbacks::FailureCallbacks;
pub use config::RouterConfig;
pub use entity::{CacheEntity, EntityKind};
pub use error::{Error, Result};
pub use events::{CacheEvent, EventBus, EventKind, EventPayload, EventSubscriber};
pub use hook::LifecycleHook;
pub use key::CacheKey;
pub use observability::{CacheMetrics, NoOpMetrics};
pub use repository::DataRepository;
pub use snapshot::{FieldValue, RawSnapshot};
pub use store::{
    LoadBalanceStrategy, MemoryConnection, MemoryStore, Role, RoutedConnection, StoreConnection,
    StoreRouter,
};
pub use unit_of_work::{Origin, UnitOfWork, UowState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
