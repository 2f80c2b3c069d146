//! # query-kit
//!
//! Cached, validated reads for a GraphQL gateway in front of slow data
//! sources.
//!
//! ## Features
//!
//! - **Cache first:** every read goes through a shared cache store keyed by a
//!   per-query key function
//! - **Validated:** cached and fetched values are checked by a [`decoder::Decoder`];
//!   corrupt cache entries repair themselves and are reported
//! - **Stale-while-revalidate:** cache hits can enqueue a background refresh,
//!   at most one per key at a time
//! - **Backend agnostic:** in-memory and Redis stores behind [`CacheBackend`]
//! - **Admin tooling:** [`QueryRegistry`] maps raw keys back to queries
//!
//! ## Quick Start
//!
//! ```
//! use query_kit::backend::InMemoryBackend;
//! use query_kit::decoder::{Decoder, Json};
//! use query_kit::key::CacheKeyBuilder;
//! use query_kit::{Cache, CachePolicy, Environment, Query, QuerySpec, Result, SwrQueue};
//! use serde::{Deserialize, Serialize};
//! use serde_json::{json, Value};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct License {
//!     id: u32,
//!     title: String,
//! }
//!
//! struct LicenseQuery {
//!     decoder: Json<License>,
//! }
//!
//! impl QuerySpec for LicenseQuery {
//!     type Payload = u32;
//!     type Result = License;
//!
//!     fn name(&self) -> &str {
//!         "LicenseQuery"
//!     }
//!
//!     fn get_key(&self, id: &u32) -> String {
//!         CacheKeyBuilder::build("license", id)
//!     }
//!
//!     fn get_payload(&self, key: &str) -> Option<u32> {
//!         CacheKeyBuilder::parse_id(key, "license")
//!     }
//!
//!     async fn get_current_value(&self, id: &u32, _previous: Option<&License>) -> Result<Value> {
//!         Ok(json!({"id": id, "title": "title"}))
//!     }
//!
//!     fn decoder(&self) -> &dyn Decoder<License> {
//!         &self.decoder
//!     }
//!
//!     fn policy(&self) -> CachePolicy {
//!         CachePolicy::swr().with_frequency(0.1)
//!     }
//!
//!     fn example_payload(&self) -> u32 {
//!         1
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let env = Environment::new(Cache::new(InMemoryBackend::new()), SwrQueue::builder().start());
//! let licenses = Query::new(LicenseQuery { decoder: Json::named("License") }, env)?;
//!
//! let license = licenses.query(&1).await?; // fetched and cached
//! let again = licenses.query(&1).await?; // served from cache
//! assert_eq!(license.title, again.title);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod cache;
pub mod decoder;
pub mod error;
pub mod key;
pub mod observability;
pub mod query;
pub mod query_spec;
pub mod random;
pub mod registry;
pub mod serialization;
pub mod swr;
pub mod time;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use cache::{Cache, CacheEntry};
pub use error::{Error, InvalidCurrentValueError, Result};
pub use query::{Environment, Payloads, Query, SetCache};
pub use query_spec::{CachePolicy, QuerySpec};
pub use registry::{AnyQuery, QueryRegistry, QuerySource};
pub use swr::{JobStatus, SwrQueue, SwrQueueConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
