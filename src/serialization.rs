//! Versioned cache envelope for snapshots.
//!
//! Every cached value has the layout
//!
//! ```text
//! [MAGIC: 4 bytes] [SCHEMA: u32 little-endian] [POSTCARD PAYLOAD]
//! ```
//!
//! The schema number covers the envelope and the [`RawSnapshot`] encoding. It
//! is unrelated to an entity kind's version tag, which lives in the cache key.

use crate::error::{Error, Result};
use crate::snapshot::RawSnapshot;

pub const CACHE_MAGIC: [u8; 4] = *b"ECSN";
pub const CACHE_SCHEMA_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Encode a snapshot for storage in the KV cache.
pub fn encode_snapshot(snapshot: &RawSnapshot) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(snapshot).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&CACHE_MAGIC);
    bytes.extend_from_slice(&CACHE_SCHEMA_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a cached value.
///
/// # Errors
///
/// Every failure is `Error::MalformedCachedValue`; callers treat it as a miss.
pub fn decode_snapshot(bytes: &[u8]) -> Result<RawSnapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedCachedValue(format!(
            "envelope too short: {} bytes",
            bytes.len()
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != CACHE_MAGIC {
        return Err(Error::MalformedCachedValue(format!(
            "bad magic {:?}",
            &header[..4]
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..]);
    let version = u32::from_le_bytes(version);
    if version != CACHE_SCHEMA_VERSION {
        return Err(Error::MalformedCachedValue(format!(
            "schema version {} (expected {})",
            version, CACHE_SCHEMA_VERSION
        )));
    }

    let snapshot: RawSnapshot = postcard::from_bytes(payload)?;
    Ok(snapshot)
}
