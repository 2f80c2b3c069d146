//! Error types for cached queries.

use serde_json::Value;
use std::fmt;

/// Result type for query and cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A freshly fetched value did not pass the query's decoder.
///
/// This is the "broken source of truth" failure: the legacy backend itself
/// returned data of the wrong shape, so no cache repair is possible and the
/// request must fail.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidCurrentValueError {
    /// Cache key of the failed read.
    pub key: String,
    /// The value returned by the data source.
    pub invalid_current_value: Value,
    /// The cached value that was present (and also rejected), if any.
    pub invalid_cached_value: Option<Value>,
    /// Name of the decoder that rejected the value.
    pub decoder: String,
    /// Human readable validation failures.
    pub validation_errors: Vec<String>,
}

impl fmt::Display for InvalidCurrentValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid current value for {} (decoder {}): {}",
            self.key,
            self.decoder,
            self.validation_errors.join("; ")
        )
    }
}

/// Error types for the query framework.
///
/// Foreground operations (`Query::query`, `set_cache`, `remove_cache`) return
/// these to the caller. Background refreshes never surface them to a request;
/// the SWR queue reports them instead.
#[derive(Debug, Clone)]
pub enum Error {
    /// Serialization failed when encoding an entry for the cache store.
    SerializationError(String),

    /// Deserialization failed when decoding bytes read from the cache store.
    ///
    /// Treated as a corrupt entry by queries: the value is refetched and the
    /// entry overwritten.
    DeserializationError(String),

    /// Cache store error (Redis unavailable, protocol error, ...).
    BackendError(String),

    /// The data source (legacy REST backend) failed to deliver a value.
    ///
    /// Transport failures are passed through unchanged; this subsystem adds no
    /// retry or timeout of its own.
    FetchError(String),

    /// The data source returned a value that fails the query's decoder.
    InvalidCurrentValue(Box<InvalidCurrentValueError>),

    /// Stored bytes are not a query-kit envelope (bad magic, garbage).
    InvalidCacheEntry(String),

    /// Stored envelope was written with a different schema version.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// Invalid configuration (query policy, registry conflicts, pools).
    ConfigError(String),

    /// The SWR queue has been shut down.
    QueueClosed,

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether this error describes an unreadable cache entry rather than an
    /// unavailable store.
    ///
    /// Queries self-heal from these by refetching.
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }

    /// Create an [`Error::FetchError`] from any displayable transport error.
    pub fn fetch(err: impl fmt::Display) -> Self {
        Error::FetchError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::FetchError(msg) => write!(f, "Fetch error: {}", msg),
            Error::InvalidCurrentValue(inner) => write!(f, "{}", inner),
            Error::InvalidCacheEntry(msg) => {
                write!(f, "Invalid cache entry: {}", msg)
            }
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::QueueClosed => write!(f, "SWR queue is closed"),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<InvalidCurrentValueError> for Error {
    fn from(e: InvalidCurrentValueError) -> Self {
        Error::InvalidCurrentValue(Box::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
