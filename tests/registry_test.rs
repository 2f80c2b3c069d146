//! Registry and admin tooling tests.

mod common;

use common::{license, Harness, LicenseQuery};
use query_kit::backend::InMemoryBackend;
use query_kit::cache::SOURCE_ADMIN;
use query_kit::decoder::{Decoder, Unknown};
use query_kit::key::CacheKeyBuilder;
use query_kit::{AnyQuery, Error, Query, QueryRegistry, QuerySource, QuerySpec, Result};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Untyped query over `uuid/{id}`, or any other prefix.
struct UuidQuery {
    prefix: &'static str,
}

impl QuerySpec for UuidQuery {
    type Payload = u64;
    type Result = Value;

    fn name(&self) -> &str {
        "UuidQuery"
    }

    fn get_key(&self, id: &u64) -> String {
        CacheKeyBuilder::build(self.prefix, id)
    }

    fn get_payload(&self, key: &str) -> Option<u64> {
        CacheKeyBuilder::parse_id(key, self.prefix)
    }

    async fn get_current_value(&self, id: &u64, _previous: Option<&Value>) -> Result<Value> {
        Ok(json!({"id": id, "__typename": "Article"}))
    }

    fn decoder(&self) -> &dyn Decoder<Value> {
        &Unknown
    }

    fn example_payload(&self) -> u64 {
        1855
    }
}

/// Query whose keys do not round-trip.
struct BrokenQuery;

impl QuerySpec for BrokenQuery {
    type Payload = u32;
    type Result = Value;

    fn name(&self) -> &str {
        "BrokenQuery"
    }

    fn get_key(&self, id: &u32) -> String {
        format!("broken:{}", id)
    }

    fn get_payload(&self, key: &str) -> Option<u32> {
        CacheKeyBuilder::parse_id(key, "broken")
    }

    async fn get_current_value(&self, _id: &u32, _previous: Option<&Value>) -> Result<Value> {
        Ok(Value::Null)
    }

    fn decoder(&self) -> &dyn Decoder<Value> {
        &Unknown
    }

    fn example_payload(&self) -> u32 {
        1
    }
}

struct Setup {
    harness: Harness,
    licenses: Query<LicenseQuery, InMemoryBackend>,
    uuids: Query<UuidQuery, InMemoryBackend>,
    registry: QueryRegistry,
}

fn setup() -> Setup {
    let harness = Harness::new();
    let licenses = harness.query(LicenseQuery::new(license(1, "title")));
    let uuids = Query::new(UuidQuery { prefix: "uuid" }, harness.env.clone()).expect("valid query");

    let mut registry = QueryRegistry::new();
    registry.register(licenses.erased()).expect("register licenses");
    registry.register(uuids.erased()).expect("register uuids");

    Setup {
        harness,
        licenses,
        uuids,
        registry,
    }
}

#[tokio::test]
async fn test_find_and_describe() {
    let s = setup();

    assert_eq!(s.registry.len(), 2);
    assert_eq!(s.registry.find("license/1").map(|q| q.name()), Some("LicenseQuery"));
    assert_eq!(s.registry.find("uuid/1855").map(|q| q.name()), Some("UuidQuery"));
    assert!(s.registry.find("user/1").is_none());

    let description = s.registry.describe("uuid/1855").expect("describe");
    assert_eq!(description.query, "UuidQuery");
    assert_eq!(description.payload, json!(1855));
    assert!(s.registry.describe("license/x").is_none());
}

#[tokio::test]
async fn test_register_rejects_overlapping_keys() {
    let s = setup();
    let mut registry = s.registry.clone();
    let duplicate = Query::new(UuidQuery { prefix: "license" }, s.harness.env.clone())
        .expect("valid query");

    let err = registry
        .register(duplicate.erased())
        .expect_err("must fail");

    assert!(matches!(err, Error::ConfigError(_)));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_register_rejects_keys_that_do_not_round_trip() {
    let h = Harness::new();
    let broken = Query::new(BrokenQuery, h.env.clone()).expect("valid query");

    let err = QueryRegistry::new()
        .register(broken.erased())
        .expect_err("must fail");

    assert!(err.to_string().contains("BrokenQuery"), "{}", err);
}

#[tokio::test]
async fn test_register_all_from_source() {
    struct Serlo {
        licenses: Query<LicenseQuery, InMemoryBackend>,
        uuids: Query<UuidQuery, InMemoryBackend>,
    }

    impl QuerySource for Serlo {
        fn queries(&self) -> Vec<Arc<dyn AnyQuery>> {
            vec![self.licenses.erased(), self.uuids.erased()]
        }
    }

    let s = setup();
    let source = Serlo {
        licenses: s.licenses.clone(),
        uuids: s.uuids.clone(),
    };

    let mut registry = QueryRegistry::new();
    registry.register_all(&source).expect("register_all");
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_type_guard() {
    let s = setup();
    let erased = s.registry.find("license/1").expect("registered");

    assert!(erased.is::<LicenseQuery, InMemoryBackend>());
    assert!(!erased.is::<UuidQuery, InMemoryBackend>());

    let licenses = erased
        .downcast_ref::<LicenseQuery, InMemoryBackend>()
        .expect("downcast");
    assert_eq!(licenses.key(&3), "license/3");
}

#[tokio::test]
async fn test_update_cache_refetches_and_reports() {
    let s = setup();
    s.harness.seed("license/1", license(1, "old")).await;

    let keys = vec![
        "license/1".to_string(),
        "uuid/7".to_string(),
        "user/1".to_string(),
    ];
    let report = s.registry.update_cache(&keys).await;

    assert_eq!(report.succeeded, vec!["license/1", "uuid/7"]);
    assert_eq!(report.unknown, vec!["user/1"]);
    assert!(report.failed.is_empty());
    assert_eq!(s.licenses.spec().fetch_count(), 1);

    let entry = s
        .harness
        .env
        .cache
        .get("license/1", None)
        .await
        .expect("get")
        .expect("entry missing");
    assert_eq!(entry.value, license(1, "title"));
    assert_eq!(entry.source, SOURCE_ADMIN);
    assert_eq!(
        s.harness.stored("uuid/7").await,
        Some(json!({"id": 7, "__typename": "Article"}))
    );
}

#[tokio::test]
async fn test_update_cache_collects_failures() {
    let s = setup();
    s.licenses.spec().failing.store(true, Ordering::SeqCst);

    let report = s.registry.update_cache(&["license/2".to_string()]).await;

    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "license/2");
    assert!(!report.is_complete());
}

#[tokio::test]
async fn test_remove_cache_by_key() {
    let s = setup();
    s.harness.seed("license/1", license(1, "title")).await;
    s.harness.seed("uuid/1", json!({})).await;
    s.harness.seed("user/1", json!({})).await;

    let keys = vec![
        "license/1".to_string(),
        "uuid/1".to_string(),
        "user/1".to_string(),
    ];
    let report = s.registry.remove_cache(&keys).await;

    assert_eq!(report.succeeded, vec!["license/1", "uuid/1"]);
    assert_eq!(report.unknown, vec!["user/1"]);
    assert_eq!(s.harness.stored("license/1").await, None);
    assert_eq!(s.harness.stored("uuid/1").await, None);
    // Keys nobody owns are left alone.
    assert!(s.harness.stored("user/1").await.is_some());
}
