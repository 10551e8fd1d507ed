//! Entity trait and the per-kind cache descriptor.

use crate::error::{Error, Result};
use crate::snapshot::RawSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;

/// Trait that every cached record type implements.
///
/// The entity is stored in the KV cache as a [`RawSnapshot`] of its serde
/// fields, so the only hand-written parts are the primary key and the kind name.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use entity_cache::CacheEntity;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct User {
///     pub id: u64,
///     pub name: String,
/// }
///
/// impl CacheEntity for User {
///     type Key = u64;
///
///     fn primary_key(&self) -> Self::Key {
///         self.id
///     }
///
///     fn kind_name() -> &'static str {
///         "user"
///     }
/// }
/// ```
pub trait CacheEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Type of the entity's primary key.
    ///
    /// Its `Display` form is the pk segment of the cache key, so it must match
    /// how the pk field renders in a snapshot (integers and plain strings do).
    type Key: Display + Clone + Eq + Hash + Send + Sync + 'static;

    /// Primary key of this row.
    fn primary_key(&self) -> Self::Key;

    /// Name of the entity kind (table name). First segment of every cache key.
    fn kind_name() -> &'static str;

    /// Capture the current field values.
    fn to_snapshot(&self) -> Result<RawSnapshot> {
        RawSnapshot::capture(self)
    }

    /// Rebuild an entity from a snapshot.
    fn from_snapshot(snapshot: &RawSnapshot) -> Result<Self> {
        snapshot.materialize()
    }
}

/// Schema descriptor for one category of cached record.
///
/// ```
/// # use entity_cache::EntityKind;
/// # use std::time::Duration;
/// let kind = EntityKind::new("user")
///     .primary_key("id")
///     .version("v2")
///     .ttl(Duration::from_secs(900));
///
/// assert_eq!(kind.name(), "user");
/// assert_eq!(kind.version_tag(), Some("v2"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKind {
    name: String,
    pk_field: Option<String>,
    version: Option<String>,
    default_ttl: Option<Duration>,
}

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Self {
        EntityKind {
            name: name.into(),
            pk_field: None,
            version: None,
            default_ttl: None,
        }
    }

    /// Descriptor named after `T::kind_name()`.
    pub fn of<T: CacheEntity>() -> Self {
        Self::new(T::kind_name())
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.pk_field = Some(field.into());
        self
    }

    /// Set the raw-data version tag.
    ///
    /// Changing the tag makes every key written under the previous tag
    /// unreachable; those entries expire through their TTL.
    pub fn version(mut self, tag: impl Into<String>) -> Self {
        self.version = Some(tag.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pk_field(&self) -> Option<&str> {
        self.pk_field.as_deref().filter(|f| !f.is_empty())
    }

    pub fn version_tag(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.is_empty())
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Resolve the TTL for a write: explicit override, then kind default, then none.
    pub fn resolve_ttl(&self, explicit: Option<Duration>) -> Option<Duration> {
        explicit.or(self.default_ttl)
    }

    /// Fail with `MissingPrimaryKey` when no pk field is configured.
    pub fn require_primary_key(&self) -> Result<&str> {
        self.pk_field()
            .ok_or_else(|| Error::MissingPrimaryKey(self.name.clone()))
    }

    /// Extract the pk segment from a snapshot using the configured pk field.
    pub fn pk_of(&self, snapshot: &RawSnapshot) -> Result<String> {
        let field = self.require_primary_key()?;
        snapshot
            .get(field)
            .and_then(|v| v.as_key_segment())
            .ok_or_else(|| {
                Error::MissingPrimaryKey(format!(
                    "{} (field '{}' absent or not scalar)",
                    self.name, field
                ))
            })
    }
}
