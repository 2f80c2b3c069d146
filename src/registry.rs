//! Type-erased queries and admin tooling.
//!
//! [`AnyQuery`] lets the SWR queue and the registry hold queries of
//! different payload and result types side by side. [`QueryRegistry`] maps
//! raw cache keys back to the query that owns them, which is what the admin
//! operations (inspect, force update, remove by key) need.

use crate::backend::CacheBackend;
use crate::cache::{CacheEntry, SOURCE_ADMIN, SOURCE_SWR};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::query_spec::QuerySpec;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a background revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidation {
    /// A fresh value was fetched and written.
    Refreshed,
    /// The key does not map to a payload of this query.
    UnknownKey,
}

/// Object-safe view of a [`Query`].
pub trait AnyQuery: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// See [`crate::CachePolicy::stale_after`].
    fn stale_after(&self) -> Option<Duration>;

    /// Current time on the clock of the query's cache, in milliseconds.
    /// Staleness is measured against it so that it matches `last_modified`.
    fn now(&self) -> i64;

    /// Key of the query's example payload.
    fn example_key(&self) -> String;

    /// Whether `key` maps to a payload of this query.
    fn owns_key(&self, key: &str) -> bool;

    /// The payload behind `key` as JSON.
    fn describe_key(&self, key: &str) -> Option<Value>;

    /// Refetch `key` in the background, starting from the served `entry`.
    fn revalidate<'a>(
        &'a self,
        key: &'a str,
        entry: &'a CacheEntry,
    ) -> BoxFuture<'a, Result<Revalidation>>;

    /// Refetch `key` unconditionally. `Ok(false)` if the key is not ours.
    fn update_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Delete the entry for `key`. `Ok(false)` if the key is not ours.
    fn remove_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn AnyQuery {
    /// Whether this is a `Query<S, B>`.
    pub fn is<S: QuerySpec, B: CacheBackend>(&self) -> bool {
        self.as_any().is::<Query<S, B>>()
    }

    pub fn downcast_ref<S: QuerySpec, B: CacheBackend>(&self) -> Option<&Query<S, B>> {
        self.as_any().downcast_ref::<Query<S, B>>()
    }
}

impl<S: QuerySpec, B: CacheBackend> AnyQuery for Query<S, B> {
    fn name(&self) -> &str {
        self.spec().name()
    }

    fn stale_after(&self) -> Option<Duration> {
        self.policy().stale_after
    }

    fn now(&self) -> i64 {
        self.environment().cache.now()
    }

    fn example_key(&self) -> String {
        self.key(&self.spec().example_payload())
    }

    fn owns_key(&self, key: &str) -> bool {
        self.spec().get_payload(key).is_some()
    }

    fn describe_key(&self, key: &str) -> Option<Value> {
        let payload = self.spec().get_payload(key)?;
        serde_json::to_value(payload).ok()
    }

    fn revalidate<'a>(
        &'a self,
        key: &'a str,
        entry: &'a CacheEntry,
    ) -> BoxFuture<'a, Result<Revalidation>> {
        Box::pin(async move {
            let Some(payload) = self.spec().get_payload(key) else {
                return Ok(Revalidation::UnknownKey);
            };
            let previous = self.spec().decoder().decode(&entry.value).ok();

            match self.refresh(key, &payload, previous.as_ref(), SOURCE_SWR).await {
                Ok(_) => Ok(Revalidation::Refreshed),
                Err(Error::InvalidCurrentValue(mut e)) => {
                    e.invalid_cached_value = Some(entry.value.clone());
                    Err(Error::InvalidCurrentValue(e))
                }
                Err(e) => Err(e),
            }
        })
    }

    fn update_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(payload) = self.spec().get_payload(key) else {
                return Ok(false);
            };
            self.refresh(key, &payload, None, SOURCE_ADMIN).await?;
            Ok(true)
        })
    }

    fn remove_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if !self.owns_key(key) {
                return Ok(false);
            }
            self.environment().cache.remove(key).await?;
            Ok(true)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Something that owns queries, e.g. one data source of the gateway.
pub trait QuerySource {
    fn queries(&self) -> Vec<Arc<dyn AnyQuery>>;
}

/// Query behind a cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyDescription {
    pub key: String,
    pub query: String,
    pub payload: Value,
}

/// Per-key outcome of a bulk admin operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub succeeded: Vec<String>,
    /// Keys no registered query owns.
    pub unknown: Vec<String>,
    /// Keys whose operation failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl UpdateReport {
    pub fn is_complete(&self) -> bool {
        self.unknown.is_empty() && self.failed.is_empty()
    }

    fn record(&mut self, key: &str, outcome: Result<bool>) {
        match outcome {
            Ok(true) => self.succeeded.push(key.to_string()),
            Ok(false) => self.unknown.push(key.to_string()),
            Err(e) => self.failed.push((key.to_string(), e.to_string())),
        }
    }
}

/// All queries of a gateway, looked up by cache key.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    queries: Vec<Arc<dyn AnyQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the query's example key does not map
    /// back to a payload, or if its keys overlap with a registered query.
    pub fn register(&mut self, query: Arc<dyn AnyQuery>) -> Result<()> {
        let key = query.example_key();
        if !query.owns_key(&key) {
            return Err(Error::ConfigError(format!(
                "query {}: example key {} does not map back to a payload",
                query.name(),
                key
            )));
        }

        for other in &self.queries {
            if other.owns_key(&key) || query.owns_key(&other.example_key()) {
                return Err(Error::ConfigError(format!(
                    "queries {} and {} claim the same keys",
                    other.name(),
                    query.name()
                )));
            }
        }

        info!("Registered query {} (e.g. {})", query.name(), key);
        self.queries.push(query);
        Ok(())
    }

    /// Register every query of `source`.
    ///
    /// # Errors
    ///
    /// Stops at the first query [`QueryRegistry::register`] rejects.
    pub fn register_all(&mut self, source: &dyn QuerySource) -> Result<()> {
        source
            .queries()
            .into_iter()
            .try_for_each(|query| self.register(query))
    }

    pub fn queries(&self) -> impl Iterator<Item = &Arc<dyn AnyQuery>> {
        self.queries.iter()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Query owning `key`.
    pub fn find(&self, key: &str) -> Option<&Arc<dyn AnyQuery>> {
        self.queries.iter().find(|q| q.owns_key(key))
    }

    pub fn describe(&self, key: &str) -> Option<KeyDescription> {
        let query = self.find(key)?;
        Some(KeyDescription {
            key: key.to_string(),
            query: query.name().to_string(),
            payload: query.describe_key(key)?,
        })
    }

    /// Refetch every key from its data source, concurrently.
    pub async fn update_cache(&self, keys: &[String]) -> UpdateReport {
        let outcomes = join_all(keys.iter().map(|key| async move {
            match self.find(key) {
                Some(query) => query.update_key(key).await,
                None => Ok(false),
            }
        }))
        .await;

        let mut report = UpdateReport::default();
        for (key, outcome) in keys.iter().zip(outcomes) {
            report.record(key, outcome);
        }
        if !report.is_complete() {
            warn!(
                "Cache update incomplete: {} unknown, {} failed",
                report.unknown.len(),
                report.failed.len()
            );
        }
        report
    }

    /// Delete every key, concurrently.
    pub async fn remove_cache(&self, keys: &[String]) -> UpdateReport {
        let outcomes = join_all(keys.iter().map(|key| async move {
            match self.find(key) {
                Some(query) => query.remove_key(key).await,
                None => Ok(false),
            }
        }))
        .await;

        let mut report = UpdateReport::default();
        for (key, outcome) in keys.iter().zip(outcomes) {
            report.record(key, outcome);
        }
        report
    }
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.queries.iter().map(|q| q.name()))
            .finish()
    }
}
