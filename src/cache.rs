//! Entry-level cache store.
//!
//! [`Cache`] turns a byte [`CacheBackend`] into the store queries talk to:
//! each key holds a [`CacheEntry`] with the value, the time it was written and
//! a label saying who wrote it.

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::serialization::{deserialize_from_cache, serialize_for_cache, StoredEntry};
use crate::time::{as_millis, SystemTimer, Timer};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Written by a query after fetching from its data source.
pub const SOURCE_FRESH_FETCH: &str = "API: From a call to a data source";
/// Written by `set_cache` after a mutation.
pub const SOURCE_MUTATION: &str = "API: Cache update function after a mutation";
/// Written by the SWR queue after a background refresh.
pub const SOURCE_SWR: &str = "SWR queue: background refresh";
/// Written by admin tooling (`QueryRegistry::update_cache`).
pub const SOURCE_ADMIN: &str = "API: Forced update by admin tooling";

/// A stored value together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub source: String,
}

impl CacheEntry {
    /// Age of the entry at `now` (never negative).
    pub fn age(&self, now: i64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_modified).max(0) as u64)
    }

    /// `last_modified` as an RFC 3339 timestamp, for diagnostics.
    pub fn last_modified_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.last_modified)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| self.last_modified.to_string())
    }
}

/// Cache store shared by all queries and the SWR queue.
///
/// Writes are last-write-wins per key; nothing here coordinates concurrent
/// writers.
#[derive(Clone)]
pub struct Cache<B: CacheBackend> {
    backend: B,
    timer: Arc<dyn Timer>,
    ttl: Option<Duration>,
}

impl<B: CacheBackend> Cache<B> {
    /// Create a cache over `backend` using the system clock.
    pub fn new(backend: B) -> Self {
        Cache {
            backend,
            timer: Arc::new(SystemTimer),
            ttl: None,
        }
    }

    /// Use a different clock for `last_modified` stamps and max-age checks.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Storage TTL handed to the backend on every write. Independent of the
    /// per-query `max_age`, which is checked on read.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Read an entry.
    ///
    /// Entries older than `max_age` are reported as absent.
    ///
    /// # Errors
    ///
    /// - `Error::BackendError` if the store is unreachable
    /// - `Error::InvalidCacheEntry`, `Error::VersionMismatch`,
    ///   `Error::DeserializationError` if the stored bytes cannot be decoded
    ///   (see [`crate::Error::is_corrupt_entry`])
    pub async fn get(&self, key: &str, max_age: Option<Duration>) -> Result<Option<CacheEntry>> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };

        let stored: StoredEntry = deserialize_from_cache(&bytes)?;
        let entry = CacheEntry {
            value: serde_json::from_str(&stored.value_json)?,
            last_modified: stored.last_modified,
            source: stored.source,
        };

        if let Some(max_age) = max_age {
            let age = self.timer.now().saturating_sub(entry.last_modified);
            if age > as_millis(max_age) {
                debug!("Cache entry {} older than max age ({}ms)", key, age);
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    /// Write `value` under `key`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `Err` if encoding fails or the store is unreachable.
    pub async fn set(&self, key: &str, value: &Value, source: &str) -> Result<()> {
        let stored = StoredEntry {
            value_json: serde_json::to_string(value)?,
            last_modified: self.timer.now(),
            source: source.to_string(),
        };
        let bytes = serialize_for_cache(&stored)?;
        self.backend.set(key, bytes, self.ttl).await
    }

    /// Delete an entry.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the store is unreachable.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    /// Delete several entries at once.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the store is unreachable.
    pub async fn remove_many(&self, keys: &[String]) -> Result<()> {
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.backend.mdelete(&keys).await
    }

    /// Current time according to this cache's clock.
    pub fn now(&self) -> i64 {
        self.timer.now()
    }

    /// The underlying byte store.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
