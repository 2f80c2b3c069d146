//! Error reporting and metrics hooks.
//!
//! Two concerns are kept apart:
//!
//! - **Error events (`ErrorReporter`)**: failures that must not be raised to
//!   a caller but still need a human to look at them: self-healed cache
//!   corruption, failed background refreshes. Plug in Sentry or similar.
//! - **Metrics (`CacheMetrics`)**: per-key hit/miss/repair timings.
//!
//! Default implementations of both log through the `log` crate.

use serde_json::{Map, Value};
use std::time::Duration;

/// Structured report of a non-fatal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    /// Short description of what went wrong.
    pub error: String,
    /// Grouping key for the error tracker, e.g.
    /// `["invalid-value", "cache", "license/1"]`.
    pub fingerprint: Vec<String>,
    /// Everything needed to diagnose the event.
    pub context: Map<String, Value>,
}

impl ErrorEvent {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorEvent {
            error: error.into(),
            fingerprint: Vec::new(),
            context: Map::new(),
        }
    }

    pub fn with_fingerprint<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fingerprint = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// Receiver of error events.
pub trait ErrorReporter: Send + Sync {
    fn capture_error_event(&self, event: ErrorEvent) {
        error!(
            "{} [{}] {}",
            event.error,
            event.fingerprint.join(", "),
            Value::Object(event.context)
        );
    }
}

/// Logs every event at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {}

/// Discards events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpReporter;

impl ErrorReporter for NoOpReporter {
    fn capture_error_event(&self, _event: ErrorEvent) {}
}

/// Trait for query cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Valid cached value served.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Nothing usable cached; value fetched from the data source.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Corrupt cached value replaced by a fresh one.
    fn record_repair(&self, key: &str, duration: Duration) {
        debug!("Cache REPAIR: {} took {:?}", key, duration);
    }

    /// Query failed.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_repair(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Logs through the trait's default bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_event_builder() {
        let event = ErrorEvent::new("boom")
            .with_fingerprint(["invalid-value", "cache", "license/1"])
            .with_context("key", "license/1")
            .with_context("validationErrors", json!(["missing title"]));

        assert_eq!(event.error, "boom");
        assert_eq!(event.fingerprint, vec!["invalid-value", "cache", "license/1"]);
        assert_eq!(event.context["key"], json!("license/1"));
        assert_eq!(event.context.len(), 2);
    }

    #[test]
    fn test_default_reporters_do_not_panic() {
        LogReporter.capture_error_event(ErrorEvent::new("logged"));
        NoOpReporter.capture_error_event(ErrorEvent::new("dropped"));
        LogMetrics.record_hit("key", Duration::from_millis(1));
        NoOpMetrics.record_miss("key", Duration::from_millis(2));
    }
}
