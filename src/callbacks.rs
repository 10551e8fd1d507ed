//! Registry of callbacks fired when a cache mutation fails.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback invoked with the primary key and the failure.
pub type FailureCallback = Arc<dyn Fn(&str, &Error) -> Result<()> + Send + Sync>;

/// Per-cache set of failure callbacks.
///
/// Every registered callback runs for every failure. A callback registered with
/// `raise_on_error` has its own error returned once all callbacks have run;
/// errors from the others are only logged.
#[derive(Default)]
pub struct FailureCallbacks {
    entries: RwLock<Vec<(FailureCallback, bool)>>,
}

impl FailureCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F, raise_on_error: bool)
    where
        F: Fn(&str, &Error) -> Result<()> + Send + Sync + 'static,
    {
        self.entries.write().push((Arc::new(callback), raise_on_error));
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run every callback for one failed pk.
    ///
    /// Returns the first error raised by a `raise_on_error` callback.
    pub fn notify(&self, pk: &str, error: &Error) -> Result<()> {
        // snapshot so a callback may register or clear without deadlocking
        let entries: Vec<(FailureCallback, bool)> = self.entries.read().clone();

        let mut raised = None;
        for (callback, raise_on_error) in entries {
            if let Err(e) = callback(pk, error) {
                if raise_on_error {
                    if raised.is_none() {
                        raised = Some(e);
                    }
                } else {
                    error!("cache failure callback for pk {} failed: {}", pk, e);
                }
            }
        }

        match raised {
            Some(e) => Err(Error::Callback(e.to_string())),
            None => Ok(()),
        }
    }

    /// Run every callback for each pk of a failed batch.
    pub fn notify_all<'a, I>(&self, pks: I, error: &Error) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut first = Ok(());
        for pk in pks {
            let result = self.notify(pk, error);
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}
