mod common;

use factdb::{
    Error, FactSpec, FactStore, SchemaSource, Serial, StoreConfig, SubscriptionRequest,
    TransformationSource,
};
use serde_json::json;

use common::{collect_catchup, facts, numbered, test_config};

#[tokio::test]
async fn restart_preserves_serials_registry_and_blacklist() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("restart.db");

    let store = FactStore::open_with_config(&path, test_config()).await.unwrap();
    let first = store
        .publish(vec![numbered("orders", 1), numbered("orders", 2)])
        .await
        .unwrap();
    assert_eq!(first.last_serial.as_raw(), 2);

    let transformation =
        TransformationSource::new("orders", "Numbered", 1, 2, "event.doubled = event.n * 2;");
    store
        .register_transformation(transformation.clone())
        .await
        .unwrap();
    let schema = SchemaSource::new("orders", "Numbered", 1, json!({"type": "object"}));
    store.register_schema(schema.clone()).await.unwrap();

    let blocked = numbered("orders", 3);
    let blocked_id = blocked.id();
    store.publish_one(blocked).await.unwrap();
    store.blacklist_add(blocked_id, "bad").await.unwrap();
    store.shutdown().await;

    // Simulates a process restart.
    let store = FactStore::open_with_config(&path, test_config()).await.unwrap();

    let next = store.publish_one(numbered("orders", 4)).await.unwrap();
    assert_eq!(next.first_serial, Serial::from_raw(4));
    assert_eq!(store.latest_serial().await.unwrap(), Some(Serial::from_raw(4)));

    assert!(store.contains_transformation(transformation).await.unwrap());
    assert!(store.contains_schema(schema).await.unwrap());
    assert!(store.is_blacklisted(&blocked_id));

    let spec = FactSpec::ns("orders").fact_type("Numbered").version(2);
    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![spec]))
        .unwrap();
    let delivered = facts(&collect_catchup(&mut sub).await);
    let doubled: Vec<i64> = delivered
        .iter()
        .map(|f| f.payload()["doubled"].as_i64().unwrap())
        .collect();
    assert_eq!(doubled, vec![2, 4, 8]);
    sub.close().await;

    store.shutdown().await;
}

#[tokio::test]
async fn consumed_token_stays_consumed_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tokens.db");

    let store = FactStore::open_with_config(&path, test_config()).await.unwrap();
    let aggregate = uuid::Uuid::new_v4();
    let (token, _) = store.acquire_lock("orders", [aggregate]).await.unwrap();
    let (unused, _) = store.acquire_lock("orders", [aggregate]).await.unwrap();
    assert!(store
        .publish_if_unchanged(token, vec![common::fact_on("orders", "Numbered", aggregate, json!({"n": 1}))])
        .await
        .unwrap());
    store.shutdown().await;

    let store = FactStore::open_with_config(&path, test_config()).await.unwrap();
    assert!(matches!(
        store.publish_if_unchanged(token, vec![numbered("orders", 2)]).await,
        Err(Error::InvalidStateToken(_))
    ));
    // Tokens are stored durably, so the untouched one survives but is stale now.
    assert!(!store
        .publish_if_unchanged(unused, vec![numbered("orders", 3)])
        .await
        .unwrap());
    store.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = StoreConfig {
        catchup_chunk_size: 0,
        ..test_config()
    };
    assert!(matches!(
        FactStore::open_with_config(dir.path().join("bad.db"), config).await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn zero_compaction_interval_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = StoreConfig {
        cache_compaction_interval: std::time::Duration::ZERO,
        ..test_config()
    };
    assert!(matches!(
        FactStore::open_with_config(dir.path().join("zero.db"), config).await,
        Err(Error::Config(_))
    ));
}
