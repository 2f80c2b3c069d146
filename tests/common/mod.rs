//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use query_kit::backend::InMemoryBackend;
use query_kit::decoder::{Decoder, Json};
use query_kit::key::CacheKeyBuilder;
use query_kit::observability::{ErrorEvent, ErrorReporter};
use query_kit::random::FixedRandom;
use query_kit::time::MockTimer;
use query_kit::{Cache, CachePolicy, Environment, Error, Query, QuerySpec, Result, SwrQueue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const START: i64 = 1_600_000_000_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: u32,
    pub title: String,
}

pub fn license(id: u32, title: &str) -> Value {
    json!({"id": id, "title": title})
}

/// `license/{id}` backed by a scripted data source.
pub struct LicenseQuery {
    decoder: Json<License>,
    response: Mutex<Value>,
    pub fetches: AtomicUsize,
    pub previous: Mutex<Vec<Option<License>>>,
    pub gate: Option<Arc<Notify>>,
    pub failing: AtomicBool,
    pub policy: CachePolicy,
}

impl LicenseQuery {
    pub fn new(response: Value) -> Self {
        LicenseQuery {
            decoder: Json::named("License"),
            response: Mutex::new(response),
            fetches: AtomicUsize::new(0),
            previous: Mutex::new(Vec::new()),
            gate: None,
            failing: AtomicBool::new(false),
            policy: CachePolicy::cache_only(),
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetches block until the gate is notified.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn respond_with(&self, value: Value) {
        *self.response.lock().expect("lock") = value;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl QuerySpec for LicenseQuery {
    type Payload = u32;
    type Result = License;

    fn name(&self) -> &str {
        "LicenseQuery"
    }

    fn get_key(&self, id: &u32) -> String {
        CacheKeyBuilder::build("license", id)
    }

    fn get_payload(&self, key: &str) -> Option<u32> {
        CacheKeyBuilder::parse_id(key, "license")
    }

    async fn get_current_value(&self, _id: &u32, previous: Option<&License>) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.previous
            .lock()
            .expect("lock")
            .push(previous.cloned());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::fetch("legacy API returned 503"));
        }
        let response = self.response.lock().expect("lock").clone();
        Ok(response)
    }

    fn decoder(&self) -> &dyn Decoder<License> {
        &self.decoder
    }

    fn policy(&self) -> CachePolicy {
        self.policy.clone()
    }

    fn example_payload(&self) -> u32 {
        1
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub events: Mutex<Vec<ErrorEvent>>,
}

impl RecordingReporter {
    pub fn fingerprints(&self) -> Vec<Vec<String>> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|e| e.fingerprint.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn capture_error_event(&self, event: ErrorEvent) {
        self.events.lock().expect("lock").push(event);
    }
}

/// Cache on a mock clock, queue and reporter wired together. Random draws are 0.0,
/// so every SWR check with a positive frequency fires.
pub struct Harness {
    pub timer: MockTimer,
    pub reporter: Arc<RecordingReporter>,
    pub env: Environment<InMemoryBackend>,
}

impl Harness {
    pub fn new() -> Self {
        let timer = MockTimer::new(START);
        let reporter = Arc::new(RecordingReporter::default());
        let cache = Cache::new(InMemoryBackend::new()).with_timer(Arc::new(timer.clone()));
        let queue = SwrQueue::builder()
            .with_reporter(reporter.clone())
            .start();
        let env = Environment::new(cache, queue)
            .with_random(Arc::new(FixedRandom(0.0)))
            .with_reporter(reporter.clone());

        Harness {
            timer,
            reporter,
            env,
        }
    }

    pub fn query(&self, spec: LicenseQuery) -> Query<LicenseQuery, InMemoryBackend> {
        Query::new(spec, self.env.clone()).expect("valid query")
    }

    pub async fn seed(&self, key: &str, value: Value) {
        self.env
            .cache
            .set(key, &value, "seed")
            .await
            .expect("Failed to seed cache");
    }

    pub async fn stored(&self, key: &str) -> Option<Value> {
        self.env
            .cache
            .get(key, None)
            .await
            .expect("Failed to read cache")
            .map(|entry| entry.value)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
