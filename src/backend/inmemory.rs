//! In-memory cache backend (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding.
//! Storage TTLs are checked lazily on access.

use super::CacheBackend;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Slot {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        Slot { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Thread-safe in-memory cache backend.
///
/// Clones share the same store, so a gateway can hand one instance to its
/// queries and keep another for inspection.
///
/// # Example
///
/// ```no_run
/// use query_kit::backend::{CacheBackend, InMemoryBackend};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///     backend.set("license/1", b"bytes".to_vec(), None).await?;
///     assert!(backend.get("license/1").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, Slot>>,
}

impl InMemoryBackend {
    /// Create a new in-memory cache backend.
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Live keys, sorted. Used by admin tooling to list what is cached.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .iter()
            .filter(|slot| !slot.is_expired())
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.store.clear();
        warn!("InMemory CLEAR executed - all cache entries dropped");
    }

    /// Memory statistics.
    pub fn stats(&self) -> CacheStats {
        let total_bytes: usize = self.store.iter().map(|slot| slot.data.len()).sum();
        let expired_count = self.store.iter().filter(|slot| slot.is_expired()).count();

        CacheStats {
            total_entries: self.store.len(),
            expired_entries: expired_count,
            total_bytes,
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(slot) = self.store.get(key) {
            if !slot.is_expired() {
                debug!("InMemory GET {} -> HIT", key);
                return Ok(Some(slot.data.clone()));
            }
        }

        // A writer may have replaced the expired slot since the check above.
        self.store.remove_if(key, |_, slot| slot.is_expired());
        debug!("InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store.insert(key.to_string(), Slot::new(value, ttl));

        match ttl {
            Some(d) => debug!("InMemory SET {} (TTL: {:?})", key, d),
            None => debug!("InMemory SET {}", key),
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("InMemory DELETE {}", key);
        Ok(())
    }
}

/// Cache statistics.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}
