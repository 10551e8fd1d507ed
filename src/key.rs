//! Cache key construction.

use crate::entity::EntityKind;
use std::fmt;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '|';

/// A fully formed KV cache key.
///
/// Format: `{kind}|{pk}`, or `{kind}|{pk}|{version}` when the kind carries a
/// version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &EntityKind, pk: &str) -> Self {
        match kind.version_tag() {
            Some(version) => CacheKey(format!(
                "{}{sep}{}{sep}{}",
                kind.name(),
                pk,
                version,
                sep = KEY_SEPARATOR
            )),
            None => CacheKey(format!("{}{sep}{}", kind.name(), pk, sep = KEY_SEPARATOR)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
