//! Cached, validated queries.
//!
//! A [`Query`] wraps a [`QuerySpec`] with the cache-first read algorithm:
//!
//! ```text
//! key = spec.get_key(payload)
//! cache.get(key, max_age)
//!     ├─ hit, decodes      → return it, maybe enqueue an SWR refresh
//!     ├─ hit, fails decode → remember diagnostics, fall through  (corrupt)
//!     └─ miss              → fall through
//! value = spec.get_current_value(payload)
//!     ├─ decodes           → cache.set(key, value), report repaired corruption, return
//!     └─ fails decode      → Err(InvalidCurrentValue)                         (fatal)
//! ```
//!
//! Corrupt cache entries (schema drift, manual edits, foreign writers) heal
//! themselves on the next read; a data source that returns malformed data is
//! an error for the caller.

use crate::backend::CacheBackend;
use crate::cache::{Cache, CacheEntry, SOURCE_FRESH_FETCH, SOURCE_MUTATION};
use crate::decoder::{report, Decoder, ValidationError};
use crate::error::{Error, InvalidCurrentValueError, Result};
use crate::observability::{CacheMetrics, ErrorEvent, ErrorReporter, LogReporter, NoOpMetrics};
use crate::query_spec::{CachePolicy, QuerySpec};
use crate::random::{RandomSource, ThreadRandom};
use crate::registry::AnyQuery;
use crate::swr::{SwrJob, SwrQueue};
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

/// Collaborators shared by every query of a gateway.
///
/// Cloning is cheap; all members are handles.
#[derive(Clone)]
pub struct Environment<B: CacheBackend> {
    pub cache: Cache<B>,
    pub swr_queue: SwrQueue,
    pub random: Arc<dyn RandomSource>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub metrics: Arc<dyn CacheMetrics>,
}

impl<B: CacheBackend> Environment<B> {
    pub fn new(cache: Cache<B>, swr_queue: SwrQueue) -> Self {
        Environment {
            cache,
            swr_queue,
            random: Arc::new(ThreadRandom),
            reporter: Arc::new(LogReporter),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// One payload or many, for the cache helpers.
#[derive(Clone, Debug, PartialEq)]
pub enum Payloads<P> {
    One(P),
    Many(Vec<P>),
}

impl<P> Payloads<P> {
    pub fn one(payload: P) -> Self {
        Payloads::One(payload)
    }

    pub fn many(payloads: impl IntoIterator<Item = P>) -> Self {
        Payloads::Many(payloads.into_iter().collect())
    }

    fn into_vec(self) -> Vec<P> {
        match self {
            Payloads::One(p) => vec![p],
            Payloads::Many(ps) => ps,
        }
    }
}

type UpdateFn<P, R> = Box<dyn Fn(&P, Option<R>) -> Option<R> + Send + Sync>;

enum NewValue<P, R> {
    Value(R),
    Update(UpdateFn<P, R>),
}

/// Arguments of [`Query::set_cache`].
pub struct SetCache<P, R> {
    payloads: Payloads<P>,
    value: NewValue<P, R>,
}

impl<P, R> SetCache<P, R> {
    /// Store the same value for every payload.
    pub fn value(payloads: Payloads<P>, value: R) -> Self {
        SetCache {
            payloads,
            value: NewValue::Value(value),
        }
    }

    /// Compute the value per payload from the currently cached one.
    ///
    /// The function receives `None` when nothing valid is cached. Returning
    /// `None` leaves that entry untouched.
    pub fn with<F>(payloads: Payloads<P>, update: F) -> Self
    where
        F: Fn(&P, Option<R>) -> Option<R> + Send + Sync + 'static,
    {
        SetCache {
            payloads,
            value: NewValue::Update(Box::new(update)),
        }
    }
}

struct QueryInner<S: QuerySpec, B: CacheBackend> {
    spec: S,
    policy: CachePolicy,
    env: Environment<B>,
}

/// A cached read bound to one [`QuerySpec`].
///
/// Created once at start-up and shared; clones point to the same query.
pub struct Query<S: QuerySpec, B: CacheBackend> {
    inner: Arc<QueryInner<S, B>>,
}

impl<S: QuerySpec, B: CacheBackend> Clone for Query<S, B> {
    fn clone(&self) -> Self {
        Query {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QuerySpec, B: CacheBackend> Query<S, B> {
    /// Bind `spec` to the gateway's collaborators.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the policy of `spec` is invalid.
    pub fn new(spec: S, env: Environment<B>) -> Result<Self> {
        let policy = spec.policy();
        policy
            .validate()
            .map_err(|e| Error::ConfigError(format!("query {}: {}", spec.name(), e)))?;

        Ok(Query {
            inner: Arc::new(QueryInner { spec, policy, env }),
        })
    }

    pub fn spec(&self) -> &S {
        &self.inner.spec
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    pub fn environment(&self) -> &Environment<B> {
        &self.inner.env
    }

    /// Cache key for `payload`.
    pub fn key(&self, payload: &S::Payload) -> String {
        self.inner.spec.get_key(payload)
    }

    /// Resolve `payload` through the cache using the decoder of the `QuerySpec`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCurrentValue` if the data source returns a value the
    ///   decoder rejects
    /// - whatever `get_current_value` returns on transport failure
    /// - `Error::BackendError` if the cache store is unreachable
    pub async fn query(&self, payload: &S::Payload) -> Result<S::Result> {
        self.query_with_decoder(payload, self.inner.spec.decoder())
            .await
    }

    /// Same as [`Query::query`] with a different decoder, for callers that
    /// need a narrower view of the same cache entry.
    ///
    /// # Errors
    ///
    /// Same as [`Query::query`].
    pub async fn query_with_decoder<T: Send>(
        &self,
        payload: &S::Payload,
        decoder: &dyn Decoder<T>,
    ) -> Result<T> {
        let key = self.key(payload);
        let result = self.resolve(&key, payload, decoder).await;
        if let Err(e) = &result {
            self.inner.env.metrics.record_error(&key, &e.to_string());
        }
        result
    }

    async fn resolve<T: Send>(
        &self,
        key: &str,
        payload: &S::Payload,
        decoder: &dyn Decoder<T>,
    ) -> Result<T> {
        let inner = &self.inner;
        let timer = Instant::now();
        let mut invalid_cache: Option<Map<String, Value>> = None;
        let mut invalid_cached_value: Option<Value> = None;

        match inner.env.cache.get(key, inner.policy.max_age).await {
            Ok(Some(entry)) => match decoder.decode(&entry.value) {
                Ok(value) => {
                    self.maybe_enqueue_swr(key, entry).await;
                    inner.env.metrics.record_hit(key, timer.elapsed());
                    return Ok(value);
                }
                Err(errors) => {
                    debug!("Cached value for {} failed {}", key, decoder.name());
                    invalid_cache = Some(invalid_entry_context(&entry, &errors));
                    invalid_cached_value = Some(entry.value);
                }
            },
            Ok(None) => {}
            Err(e) if e.is_corrupt_entry() => {
                debug!("Cache entry {} is unreadable: {}", key, e);
                invalid_cache = Some(unreadable_entry_context(&e));
            }
            Err(e) => return Err(e),
        }

        let value = inner.spec.get_current_value(payload, None).await?;

        let decoded = match decoder.decode(&value) {
            Ok(decoded) => decoded,
            Err(errors) => {
                return Err(InvalidCurrentValueError {
                    key: key.to_string(),
                    invalid_current_value: value,
                    invalid_cached_value,
                    decoder: decoder.name(),
                    validation_errors: report(&errors),
                }
                .into());
            }
        };

        if let Err(e) = inner.env.cache.set(key, &value, SOURCE_FRESH_FETCH).await {
            // The fresh value is valid; a failed write only costs a refetch.
            warn!("Failed to cache fresh value for {}: {}", key, e);
        }

        match invalid_cache {
            Some(mut context) => {
                warn!("Repaired invalid cache entry {}", key);
                context.insert("key".to_string(), json!(key));
                context.insert("currentValue".to_string(), value);
                context.insert("decoder".to_string(), json!(decoder.name()));
                inner.env.reporter.capture_error_event(ErrorEvent {
                    error: "Invalid cached value received that could be repaired automatically by data source.".to_string(),
                    fingerprint: vec![
                        "invalid-value".to_string(),
                        "cache".to_string(),
                        key.to_string(),
                    ],
                    context,
                });
                inner.env.metrics.record_repair(key, timer.elapsed());
            }
            None => inner.env.metrics.record_miss(key, timer.elapsed()),
        }

        Ok(decoded)
    }

    async fn maybe_enqueue_swr(&self, key: &str, entry: CacheEntry) {
        let inner = &self.inner;
        if !inner.policy.enable_swr {
            return;
        }
        if let Some(frequency) = inner.policy.swr_frequency {
            if inner.env.random.next_f64() >= frequency {
                return;
            }
        }

        let job = SwrJob {
            key: key.to_string(),
            entry,
            query: self.erased(),
        };
        if let Err(e) = inner.env.swr_queue.queue(job).await {
            warn!("Could not enqueue SWR refresh for {}: {}", key, e);
        }
    }

    /// Write cache entries directly, e.g. after a mutation made the new value
    /// known without another round trip.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a value cannot be serialized or the store fails.
    pub async fn set_cache(&self, args: SetCache<S::Payload, S::Result>) -> Result<()> {
        let SetCache { payloads, value } = args;
        let value = &value;

        try_join_all(payloads.into_vec().into_iter().map(|payload| async move {
            let key = self.key(&payload);
            let new_value = match value {
                NewValue::Value(v) => Some(v.clone()),
                NewValue::Update(update) => update(&payload, self.cached(&key).await?),
            };

            match new_value {
                Some(v) => {
                    let raw = serde_json::to_value(&v)?;
                    self.inner.env.cache.set(&key, &raw, SOURCE_MUTATION).await
                }
                None => {
                    debug!("set_cache left {} untouched", key);
                    Ok(())
                }
            }
        }))
        .await?;

        Ok(())
    }

    /// Delete cache entries, e.g. after the upstream record was deleted.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the store fails.
    pub async fn remove_cache(&self, payloads: Payloads<S::Payload>) -> Result<()> {
        let keys: Vec<String> = payloads.into_vec().iter().map(|p| self.key(p)).collect();
        self.inner.env.cache.remove_many(&keys).await
    }

    /// Currently cached value if it is present and valid. Corrupt entries
    /// read as absent; store failures propagate.
    async fn cached(&self, key: &str) -> Result<Option<S::Result>> {
        match self.inner.env.cache.get(key, self.inner.policy.max_age).await {
            Ok(Some(entry)) => Ok(self.inner.spec.decoder().decode(&entry.value).ok()),
            Ok(None) => Ok(None),
            Err(e) if e.is_corrupt_entry() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch, validate and store without looking at the cache first.
    pub(crate) async fn refresh(
        &self,
        key: &str,
        payload: &S::Payload,
        previous: Option<&S::Result>,
        source: &str,
    ) -> Result<S::Result> {
        let spec = &self.inner.spec;
        let value = spec.get_current_value(payload, previous).await?;
        let decoded = spec.decoder().decode(&value).map_err(|errors| {
            Error::from(InvalidCurrentValueError {
                key: key.to_string(),
                invalid_current_value: value.clone(),
                invalid_cached_value: None,
                decoder: spec.decoder().name(),
                validation_errors: report(&errors),
            })
        })?;
        self.inner.env.cache.set(key, &value, source).await?;
        Ok(decoded)
    }

    /// Type-erased handle for the SWR queue and the registry.
    pub fn erased(&self) -> Arc<dyn AnyQuery> {
        Arc::new(self.clone())
    }
}

fn invalid_entry_context(entry: &CacheEntry, errors: &[ValidationError]) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert(
        "timeInvalidCacheSaved".to_string(),
        json!(entry.last_modified_rfc3339()),
    );
    context.insert("invalidCacheValue".to_string(), entry.value.clone());
    context.insert("source".to_string(), json!(entry.source));
    context.insert("validationErrors".to_string(), json!(report(errors)));
    context
}

fn unreadable_entry_context(error: &Error) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("timeInvalidCacheSaved".to_string(), Value::Null);
    context.insert("invalidCacheValue".to_string(), Value::Null);
    context.insert("source".to_string(), Value::Null);
    context.insert("validationErrors".to_string(), json!([error.to_string()]));
    context
}
