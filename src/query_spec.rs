//! Declarative description of one kind of cached read.

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Freshness policy of a query.
///
/// # Example
///
/// ```
/// use query_kit::CachePolicy;
/// use std::time::Duration;
///
/// let policy = CachePolicy::swr()
///     .with_frequency(0.05)
///     .with_stale_after(Duration::from_secs(3600))
///     .with_max_age(Duration::from_secs(86_400));
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachePolicy {
    /// Refresh cache hits in the background.
    pub enable_swr: bool,
    /// Probability in `[0, 1]` that a hit enqueues a refresh. `None` means
    /// every hit does.
    pub swr_frequency: Option<f64>,
    /// Age after which the SWR queue refetches an entry. `None` means any
    /// entry handed to the queue is refetched.
    pub stale_after: Option<Duration>,
    /// Entries older than this are ignored and fetched in the foreground.
    pub max_age: Option<Duration>,
}

impl CachePolicy {
    /// Cache without background refresh.
    pub fn cache_only() -> Self {
        CachePolicy::default()
    }

    /// Cache with background refresh on every hit.
    pub fn swr() -> Self {
        CachePolicy {
            enable_swr: true,
            ..CachePolicy::default()
        }
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.swr_frequency = Some(frequency);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Check the policy for contradictions.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the frequency is outside `[0, 1]` or
    /// `stale_after` exceeds `max_age` (such entries would never be served
    /// stale).
    pub fn validate(&self) -> Result<()> {
        if let Some(freq) = self.swr_frequency {
            if !(0.0..=1.0).contains(&freq) {
                return Err(Error::ConfigError(format!(
                    "swr_frequency must be within [0, 1], got {}",
                    freq
                )));
            }
        }

        if let (Some(stale), Some(max)) = (self.stale_after, self.max_age) {
            if stale > max {
                return Err(Error::ConfigError(format!(
                    "stale_after ({:?}) exceeds max_age ({:?})",
                    stale, max
                )));
            }
        }

        Ok(())
    }
}

/// Everything a [`crate::Query`] needs to know about one kind of read.
///
/// # Example
///
/// ```
/// use query_kit::decoder::{Decoder, Json};
/// use query_kit::key::CacheKeyBuilder;
/// use query_kit::{CachePolicy, QuerySpec, Result};
/// use serde::{Deserialize, Serialize};
/// use serde_json::{json, Value};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct License {
///     id: u32,
///     title: String,
/// }
///
/// struct LicenseQuery {
///     decoder: Json<License>,
/// }
///
/// impl QuerySpec for LicenseQuery {
///     type Payload = u32;
///     type Result = License;
///
///     fn name(&self) -> &str {
///         "LicenseQuery"
///     }
///
///     fn get_key(&self, id: &u32) -> String {
///         CacheKeyBuilder::build("license", id)
///     }
///
///     fn get_payload(&self, key: &str) -> Option<u32> {
///         CacheKeyBuilder::parse_id(key, "license")
///     }
///
///     async fn get_current_value(&self, id: &u32, _previous: Option<&License>) -> Result<Value> {
///         // An HTTP call to the legacy backend goes here.
///         Ok(json!({"id": id, "title": "title"}))
///     }
///
///     fn decoder(&self) -> &dyn Decoder<License> {
///         &self.decoder
///     }
///
///     fn policy(&self) -> CachePolicy {
///         CachePolicy::swr().with_frequency(0.1)
///     }
///
///     fn example_payload(&self) -> u32 {
///         1
///     }
/// }
/// ```
pub trait QuerySpec: Send + Sync + 'static {
    /// Input identifying one instance of the read, e.g. an id.
    type Payload: Clone + Serialize + Send + Sync + 'static;

    /// Typed result produced by [`QuerySpec::decoder`].
    type Result: Clone + Serialize + Send + Sync + 'static;

    /// Name shown in diagnostics and the dashboard.
    fn name(&self) -> &str;

    /// Cache key for a payload. Must be deterministic and must not collide
    /// with keys of any other query.
    fn get_key(&self, payload: &Self::Payload) -> String;

    /// Inverse of [`QuerySpec::get_key`]; `None` for keys of other queries.
    fn get_payload(&self, key: &str) -> Option<Self::Payload>;

    /// Fetch the current value from the data source.
    ///
    /// `previous` is the last cached value when refreshing in the background,
    /// so implementations can do conditional requests.
    ///
    /// # Errors
    ///
    /// Transport failures, typically `Error::FetchError`.
    fn get_current_value(
        &self,
        payload: &Self::Payload,
        previous: Option<&Self::Result>,
    ) -> impl Future<Output = Result<Value>> + Send;

    /// Validator for cached and fetched values. Untyped queries use
    /// `type Result = Value` with [`crate::decoder::Unknown`].
    fn decoder(&self) -> &dyn Decoder<Self::Result>;

    fn policy(&self) -> CachePolicy {
        CachePolicy::default()
    }

    /// A payload used by tooling and registry consistency checks.
    fn example_payload(&self) -> Self::Payload;
}
