//! Transformation & Registry Tests
//!
//! Versioned reads through `FactStore`:
//! - fetch and subscribe at a requested version
//! - cache hits after the first transformation
//! - registry conflicts are never resolved silently
//! - schema validation on publish

mod common;

use std::sync::Arc;

use factdb::metrics::{TRANSFORMATION_CACHE_HIT, TRANSFORMATION_CACHE_MISS, VALIDATION_FAILED};
use factdb::{
    CounterMetrics, Error, Fact, FactSpec, FactStore, RhaiEngine, SchemaSource, StoreConfig,
    SubscriptionEvent, SubscriptionRequest, TransformationSource,
};
use serde_json::json;

use common::{collect_catchup, facts, next_event, test_config};

fn upcast() -> TransformationSource {
    TransformationSource::new("orders", "OrderPlaced", 1, 2, "event.currency = \"EUR\";")
}

fn downcast() -> TransformationSource {
    TransformationSource::new("orders", "OrderPlaced", 2, 1, "event.remove(\"currency\");")
}

fn placed_v1(total: u64) -> Fact {
    Fact::builder("orders", "OrderPlaced")
        .version(1)
        .payload(json!({ "total": total }))
        .build()
        .unwrap()
}

async fn store_with_metrics(
    name: &str,
    config: StoreConfig,
) -> (FactStore, Arc<CounterMetrics>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let metrics = Arc::new(CounterMetrics::new());
    let store = FactStore::open_with(
        dir.path().join(name),
        config,
        Arc::new(RhaiEngine::new()),
        metrics.clone(),
    )
    .await
    .unwrap();
    (store, metrics, dir)
}

#[tokio::test]
async fn fetch_by_id_transforms_and_caches() {
    let (store, metrics, _dir) = store_with_metrics("fetch.db", test_config()).await;
    store.register_transformation(upcast()).await.unwrap();

    let fact = placed_v1(10);
    let id = fact.id();
    store.publish_one(fact).await.unwrap();

    let stored = store.fetch_by_id(id, None).await.unwrap().unwrap();
    assert_eq!(stored.version(), 1);
    assert_eq!(stored.payload(), &json!({"total": 10}));

    let first = store.fetch_by_id(id, Some(2)).await.unwrap().unwrap();
    let second = store.fetch_by_id(id, Some(2)).await.unwrap().unwrap();
    assert_eq!(first.version(), 2);
    assert_eq!(first.payload(), &json!({"total": 10, "currency": "EUR"}));
    assert_eq!(first, second);

    assert_eq!(metrics.get(TRANSFORMATION_CACHE_MISS), 1);
    assert_eq!(metrics.get(TRANSFORMATION_CACHE_HIT), 1);

    store.shutdown().await;
}

#[tokio::test]
async fn downcast_satisfies_older_schema() {
    let config = StoreConfig {
        allow_unvalidated_publish: false,
        ..test_config()
    };
    let (store, _metrics, _dir) = store_with_metrics("roundtrip.db", config).await;

    let v1_schema = json!({
        "type": "object",
        "properties": { "total": { "type": "integer" } },
        "required": ["total"],
        "additionalProperties": false
    });
    let v2_schema = json!({
        "type": "object",
        "properties": {
            "total": { "type": "integer" },
            "currency": { "type": "string" }
        },
        "required": ["total", "currency"]
    });
    store
        .register_schema(SchemaSource::new("orders", "OrderPlaced", 1, v1_schema))
        .await
        .unwrap();
    store
        .register_schema(SchemaSource::new("orders", "OrderPlaced", 2, v2_schema))
        .await
        .unwrap();
    store.register_transformation(upcast()).await.unwrap();
    store.register_transformation(downcast()).await.unwrap();

    let v2 = Fact::builder("orders", "OrderPlaced")
        .version(2)
        .payload(json!({"total": 7, "currency": "USD"}))
        .build()
        .unwrap();
    let id = v2.id();
    store.publish_one(v2).await.unwrap();

    let down = store.fetch_by_id(id, Some(1)).await.unwrap().unwrap();
    assert_eq!(down.payload(), &json!({"total": 7}));

    // The downcast payload is accepted by the v1 schema.
    let republished = Fact::builder("orders", "OrderPlaced")
        .version(1)
        .payload(down.payload().clone())
        .build()
        .unwrap();
    store.publish_one(republished).await.unwrap();

    store.shutdown().await;
}

#[tokio::test]
async fn subscription_delivers_requested_version() {
    let (store, _metrics, _dir) = store_with_metrics("subscribe.db", test_config()).await;
    store.register_transformation(upcast()).await.unwrap();
    store
        .publish(vec![placed_v1(1), placed_v1(2)])
        .await
        .unwrap();

    let spec = FactSpec::ns("orders").fact_type("OrderPlaced").version(2);
    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![spec]))
        .unwrap();

    let delivered = facts(&collect_catchup(&mut sub).await);
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|f| f.version() == 2));
    assert!(delivered.iter().all(|f| f.payload()["currency"] == "EUR"));

    sub.close().await;
    store.shutdown().await;
}

#[tokio::test]
async fn missing_transformation_fails_subscription() {
    let (store, _metrics, _dir) = store_with_metrics("missing.db", test_config()).await;
    store.publish_one(placed_v1(1)).await.unwrap();

    let spec = FactSpec::ns("orders").fact_type("OrderPlaced").version(3);
    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![spec]))
        .unwrap();

    let item = tokio::time::timeout(common::WAIT, sub.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        item,
        Err(Error::MissingTransformationInformation { from: 1, to: 3, .. })
    ));
    assert!(sub.next().await.is_none());

    assert!(matches!(
        store.fetch_by_id(uuid::Uuid::nil(), Some(3)).await,
        Ok(None)
    ));

    store.shutdown().await;
}

#[tokio::test]
async fn missing_transformation_can_be_skipped() {
    let config = StoreConfig {
        skip_missing_transformation: true,
        ..test_config()
    };
    let (store, _metrics, _dir) = store_with_metrics("skip.db", config).await;
    store.register_transformation(upcast()).await.unwrap();

    // Version 5 has no path, version 1 does.
    let stranded = Fact::builder("orders", "OrderPlaced")
        .version(5)
        .payload(json!({"total": 0}))
        .build()
        .unwrap();
    store.publish(vec![stranded, placed_v1(3)]).await.unwrap();

    let spec = FactSpec::ns("orders").fact_type("OrderPlaced").version(2);
    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![spec]))
        .unwrap();

    let delivered = facts(&collect_catchup(&mut sub).await);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload(), &json!({"total": 3, "currency": "EUR"}));
    assert_eq!(next_event(&mut sub).await, SubscriptionEvent::Complete);

    store.shutdown().await;
}

#[tokio::test]
async fn registry_conflicts_are_reported() {
    let (store, _metrics, _dir) = store_with_metrics("conflict.db", test_config()).await;

    store.register_transformation(upcast()).await.unwrap();
    // Same id, same hash: silently accepted.
    store.register_transformation(upcast()).await.unwrap();
    assert!(store.contains_transformation(upcast()).await.unwrap());

    let changed = TransformationSource::new(
        "orders",
        "OrderPlaced",
        1,
        2,
        "event.currency = \"USD\";",
    );
    assert!(matches!(
        store.register_transformation(changed.clone()).await,
        Err(Error::TransformationConflict { .. })
    ));
    assert!(matches!(
        store.contains_transformation(changed).await,
        Err(Error::TransformationConflict { .. })
    ));

    let schema = SchemaSource::new("orders", "OrderPlaced", 1, json!({"type": "object"}));
    store.register_schema(schema.clone()).await.unwrap();
    assert!(store.contains_schema(schema).await.unwrap());
    let other = SchemaSource::new("orders", "OrderPlaced", 1, json!({"type": "array"}));
    assert!(matches!(
        store.register_schema(other).await,
        Err(Error::SchemaConflict { .. })
    ));

    store.shutdown().await;
}

#[tokio::test]
async fn validation_rejects_whole_batch() {
    let config = StoreConfig {
        allow_unvalidated_publish: false,
        ..test_config()
    };
    let (store, metrics, _dir) = store_with_metrics("validation.db", config).await;
    store
        .register_schema(SchemaSource::new(
            "orders",
            "OrderPlaced",
            1,
            json!({
                "type": "object",
                "properties": { "total": { "type": "integer", "minimum": 0 } },
                "required": ["total"]
            }),
        ))
        .await
        .unwrap();

    let bad = Fact::builder("orders", "OrderPlaced")
        .payload(json!({"total": "ten"}))
        .build()
        .unwrap();
    let bad_id = bad.id();
    let result = store.publish(vec![placed_v1(1), bad]).await;
    assert!(matches!(result, Err(Error::Validation { fact_id, .. }) if fact_id == bad_id));
    assert_eq!(store.latest_serial().await.unwrap(), None);
    assert_eq!(metrics.get(VALIDATION_FAILED), 1);

    // No schema registered for this type.
    let unknown = Fact::builder("orders", "OrderCancelled").build().unwrap();
    assert!(matches!(
        store.publish_one(unknown).await,
        Err(Error::Validation { .. })
    ));

    store.publish_one(placed_v1(5)).await.unwrap();
    store.shutdown().await;
}
