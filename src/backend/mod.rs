//! Cache store backends.
//!
//! A backend is a plain byte store. Entry framing, timestamps and max-age
//! handling live one layer up in [`crate::cache::Cache`].

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis::{RedisBackend, RedisConfig};

/// Trait for cache backend implementations.
///
/// All methods take `&self`; implementations use interior mutability or an
/// external store. The returned futures are `Send` because queries await them
/// from SWR worker tasks.
pub trait CacheBackend: Send + Sync + Clone + 'static {
    /// Retrieve raw bytes by key.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store raw bytes. `ttl = None` keeps the entry until it is overwritten
    /// or removed.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a key. Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Bulk delete.
    ///
    /// Default implementation calls `delete()` for each key.
    ///
    /// # Errors
    /// Returns `Err` on the first failing delete.
    fn mdelete(&self, keys: &[&str]) -> impl Future<Output = Result<()>> + Send {
        async move {
            for key in keys {
                self.delete(key).await?;
            }
            Ok(())
        }
    }

    /// Health check used by readiness checks and the dashboard.
    ///
    /// # Errors
    /// Returns `Err` if the backend is not accessible.
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}
