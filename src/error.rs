//! Error types for cache and store operations.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the cache layer, the lifecycle hook and the store router.
///
/// Cache-side failures (`BackendUnavailable`, `MalformedCachedValue`) are never
/// fatal to a business transaction; the entity cache logs them and falls back to
/// the store. Store-side failures are returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The KV cache could not be reached or rejected the command.
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A cached payload failed envelope validation or decoding.
    #[error("malformed cached value: {0}")]
    MalformedCachedValue(String),

    /// A rollback or close exceeded its deadline; the connection was invalidated.
    #[error("store {operation} on connection '{connection}' exceeded deadline of {deadline:?}")]
    StoreTimeout {
        operation: &'static str,
        connection: String,
        deadline: Duration,
    },

    /// A named connection, channel or entity kind was registered twice.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// The entity kind has no identifiable primary key.
    #[error("entity kind '{0}' has no primary key")]
    MissingPrimaryKey(String),

    /// An entity could not be turned into a snapshot or back.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The persistent store failed a lookup or a commit.
    #[error("repository error: {0}")]
    Repository(String),

    /// Invalid configuration (unknown connection name, missing primary, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// The unit of work is not in a state that allows the operation.
    #[error("invalid unit of work state: {0}")]
    InvalidState(String),

    /// A failure callback registered with `raise_on_error` returned an error.
    #[error("failure callback error: {0}")]
    Callback(String),
}

impl Error {
    /// True for failures of the KV cache itself, which trigger store fallback.
    pub fn is_cache_failure(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::MalformedCachedValue(_)
        )
    }

    /// True for failures that originate in the persistent store or the router.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::StoreTimeout { .. } | Error::Repository(_))
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::MalformedCachedValue(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        assert!(Error::BackendUnavailable("down".into()).is_cache_failure());
        assert!(Error::MalformedCachedValue("bad".into()).is_cache_failure());
        assert!(!Error::Repository("x".into()).is_cache_failure());

        let timeout = Error::StoreTimeout {
            operation: "close",
            connection: "primary".into(),
            deadline: Duration::from_millis(50),
        };
        assert!(timeout.is_store_failure());
        assert!(timeout.to_string().contains("primary"));
    }
}
