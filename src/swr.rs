//! Stale-while-revalidate background refresh queue.
//!
//! Cache hits hand their entry to the queue and return immediately; workers
//! refetch stale entries from the data source and overwrite the cache.
//!
//! # Guarantees
//!
//! - At most one job per key is queued or running at any time. A job for a
//!   key that is already `Queued` or `Refreshing` is a no-op.
//! - The queue is bounded. When it is full, new jobs are rejected and counted.
//! - A failing refresh never reaches the request that triggered it. It is
//!   reported, counted, and the stale entry stays in place until the next
//!   trigger. There is no retry.
//!
//! Jobs live in process memory and are lost on restart.

use crate::cache::CacheEntry;
use crate::error::{Error, Result};
use crate::observability::{ErrorEvent, ErrorReporter, LogReporter};
use crate::registry::{AnyQuery, Revalidation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// A request to refresh one cache entry.
#[derive(Clone)]
pub struct SwrJob {
    pub key: String,
    /// The entry as it was served.
    pub entry: CacheEntry,
    /// Query owning `key`.
    pub query: Arc<dyn AnyQuery>,
}

/// Per-key state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Queued,
    Refreshing,
}

/// Sizing of the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwrQueueConfig {
    /// Concurrent refreshes.
    pub workers: usize,
    /// Jobs that may wait before new ones are rejected.
    pub capacity: usize,
}

impl Default for SwrQueueConfig {
    fn default() -> Self {
        SwrQueueConfig {
            workers: 4,
            capacity: 1024,
        }
    }
}

impl SwrQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Counters and current load, e.g. for a dashboard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SwrQueueStats {
    /// Jobs waiting for a worker.
    pub depth: usize,
    /// Jobs being refreshed right now.
    pub in_flight: usize,
    /// Jobs finished, whatever the outcome.
    pub processed: u64,
    /// Jobs that wrote a fresh value.
    pub refreshed: u64,
    pub failed: u64,
    /// Jobs dropped because the entry was still fresh or the key is unknown.
    pub skipped: u64,
    /// Jobs refused because the queue was full.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    refreshed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

/// State shared between handles and workers. Workers must not hold the
/// sender, so that dropping every handle closes the channel.
struct State {
    status: DashMap<String, JobStatus>,
    counters: Counters,
    idle: Notify,
    reporter: Arc<dyn ErrorReporter>,
}

impl State {
    fn finish(&self, key: &str) {
        self.status.remove(key);
        if self.status.is_empty() {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, job: SwrJob) {
        let SwrJob { key, entry, query } = job;
        self.status.insert(key.clone(), JobStatus::Refreshing);

        let outcome = AssertUnwindSafe(self.refresh(&key, &entry, query.as_ref()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Other("refresh panicked".to_string())));

        match outcome {
            Ok(Some(Revalidation::Refreshed)) => {
                debug!("SWR refreshed {}", key);
                self.counters.refreshed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(Revalidation::UnknownKey)) => {
                warn!("SWR job for {} dropped: {} cannot map the key", key, query.name());
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                debug!("SWR skipped {}: still fresh", key);
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let mut event = ErrorEvent::new(format!("SWR refresh failed: {}", e))
                    .with_fingerprint(["swr-queue", "refresh", key.as_str()])
                    .with_context("key", key.as_str())
                    .with_context("query", query.name())
                    .with_context("staleValue", entry.value.clone())
                    .with_context("source", entry.source.as_str())
                    .with_context("timeCacheSaved", json!(entry.last_modified_rfc3339()));
                if let Error::InvalidCurrentValue(invalid) = &e {
                    event = event
                        .with_context("invalidCurrentValue", invalid.invalid_current_value.clone())
                        .with_context("decoder", invalid.decoder.as_str())
                        .with_context("validationErrors", json!(invalid.validation_errors));
                    if let Some(cached) = &invalid.invalid_cached_value {
                        event = event.with_context("invalidCachedValue", cached.clone());
                    }
                }
                self.reporter.capture_error_event(event);
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.finish(&key);
    }

    /// `Ok(None)` if the entry is younger than the query's `stale_after`,
    /// measured on the clock of the query's cache.
    async fn refresh(
        &self,
        key: &str,
        entry: &CacheEntry,
        query: &dyn AnyQuery,
    ) -> Result<Option<Revalidation>> {
        if let Some(stale_after) = query.stale_after() {
            if entry.age(query.now()) < stale_after {
                return Ok(None);
            }
        }
        query.revalidate(key, entry).await.map(Some)
    }
}

/// Builder for [`SwrQueue`].
pub struct SwrQueueBuilder {
    config: SwrQueueConfig,
    reporter: Arc<dyn ErrorReporter>,
}

impl SwrQueueBuilder {
    pub fn with_config(mut self, config: SwrQueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Spawn the workers on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> SwrQueue {
        let workers = self.config.workers.max(1);
        let (sender, receiver) = mpsc::channel(self.config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let state = Arc::new(State {
            status: DashMap::new(),
            counters: Counters::default(),
            idle: Notify::new(),
            reporter: self.reporter,
        });

        let handles = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&receiver), Arc::clone(&state))))
            .collect();

        info!(
            "SWR queue started with {} workers, capacity {}",
            workers, self.config.capacity
        );

        SwrQueue {
            sender: Arc::new(RwLock::new(Some(sender))),
            state,
            workers: Arc::new(Mutex::new(handles)),
        }
    }
}

async fn run_worker(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<SwrJob>>>,
    state: Arc<State>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        match job {
            Some(job) => state.process(job).await,
            None => break,
        }
    }
    debug!("SWR worker {} stopped", id);
}

/// Handle to the background refresh queue.
#[derive(Clone)]
pub struct SwrQueue {
    sender: Arc<RwLock<Option<mpsc::Sender<SwrJob>>>>,
    state: Arc<State>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SwrQueue {
    /// Default configuration, errors logged.
    pub fn builder() -> SwrQueueBuilder {
        SwrQueueBuilder {
            config: SwrQueueConfig::default(),
            reporter: Arc::new(LogReporter),
        }
    }

    /// Submit a refresh.
    ///
    /// Resolves once the job is accepted, not when it has run. Returns
    /// `Ok(false)` if a job for the key is already pending or the queue is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueClosed` after [`SwrQueue::shutdown`].
    pub async fn queue(&self, job: SwrJob) -> Result<bool> {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::QueueClosed)?;

        match self.state.status.entry(job.key.clone()) {
            Entry::Occupied(existing) => {
                debug!("SWR job for {} already {:?}", job.key, existing.get());
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(JobStatus::Queued);
            }
        }

        match sender.try_send(job) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(job)) => {
                warn!("SWR queue full, rejected refresh of {}", job.key);
                self.state.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.state.finish(&job.key);
                Ok(false)
            }
            Err(TrySendError::Closed(job)) => {
                self.state.finish(&job.key);
                Err(Error::QueueClosed)
            }
        }
    }

    /// State of `key`.
    pub fn status(&self, key: &str) -> JobStatus {
        self.state
            .status
            .get(key)
            .map(|s| *s)
            .unwrap_or(JobStatus::Idle)
    }

    /// All keys that are queued or refreshing, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, JobStatus)> {
        let mut jobs: Vec<(String, JobStatus)> = self
            .state
            .status
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));
        jobs
    }

    pub fn stats(&self) -> SwrQueueStats {
        let (mut depth, mut in_flight) = (0, 0);
        for status in self.state.status.iter() {
            match *status.value() {
                JobStatus::Queued => depth += 1,
                JobStatus::Refreshing => in_flight += 1,
                JobStatus::Idle => {}
            }
        }

        let counters = &self.state.counters;
        SwrQueueStats {
            depth,
            in_flight,
            processed: counters.processed.load(Ordering::Relaxed),
            refreshed: counters.refreshed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.state.status.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let the workers drain the queue and wait for them.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("SWR worker terminated abnormally: {}", e);
            }
        }
        info!("SWR queue shut down");
    }
}

impl std::fmt::Debug for SwrQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrQueue")
            .field("stats", &self.stats())
            .finish()
    }
}
