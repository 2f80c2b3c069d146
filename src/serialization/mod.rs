//! Postcard-based entry serialization with versioned envelopes.
//!
//! Every entry written by [`crate::cache::Cache`] has this layout:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │ POSTCARD StoredEntry             │
//! └─────────────────┴─────────────────┴──────────────────────────────────┘
//!   "QKIT"                                value_json, last_modified, source
//! ```
//!
//! The cached value itself is untyped (it is whatever the data source
//! returned) so it travels as JSON text inside the envelope. Anything that
//! fails to unwrap is reported as an error and treated by queries as a corrupt
//! entry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Magic header for query-kit entries: b"QKIT"
pub const CACHE_MAGIC: [u8; 4] = *b"QKIT";

/// Current envelope schema version.
///
/// Increment when [`StoredEntry`] changes shape. Entries written by an older
/// version then fail with [`Error::VersionMismatch`] and get refetched.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope for cache entries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEnvelope<T> {
    /// Magic header: must be b"QKIT"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    pub payload: T,
}

impl<T> CacheEnvelope<T> {
    /// Create a new envelope with current magic and version.
    pub fn new(payload: T) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// On-the-wire form of a cache entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// The cached value as JSON text.
    pub value_json: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub source: String,
}

/// Wrap a value in an envelope and encode it with postcard.
///
/// # Errors
///
/// Returns `Error::SerializationError` if postcard encoding fails.
pub fn serialize_for_cache<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = CacheEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        log::error!("Cache serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Decode an envelope, checking magic and version before returning the
/// payload.
///
/// # Errors
///
/// - `Error::DeserializationError`: bytes are not a postcard envelope
/// - `Error::InvalidCacheEntry`: magic mismatch
/// - `Error::VersionMismatch`: schema version mismatch
pub fn deserialize_from_cache<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: CacheEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        log::warn!("Cache deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != CACHE_MAGIC {
        log::warn!(
            "Invalid cache entry: expected magic {:?}, got {:?}",
            CACHE_MAGIC,
            envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        log::warn!(
            "Cache version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION,
            envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}
