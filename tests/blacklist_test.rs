//! Blacklist Tests
//!
//! Blacklisted facts stay stored but disappear from every delivery path:
//! point lookups, catchup and follow. Removing the entry makes them visible
//! again.

mod common;

use factdb::{FactSpec, SubscriptionRequest};

use common::{collect_catchup, facts, next_facts, numbered, open_store};

#[tokio::test]
async fn blacklisted_fact_hidden_from_reads_and_catchup() {
    let (store, _dir, _) = open_store("blacklist.db").await;

    let poisoned = numbered("orders", 2);
    let poisoned_id = poisoned.id();
    store
        .publish(vec![numbered("orders", 1), poisoned, numbered("orders", 3)])
        .await
        .unwrap();

    store.blacklist_add(poisoned_id, "corrupt payload").await.unwrap();
    assert!(store.is_blacklisted(&poisoned_id));
    assert!(store.fetch_by_id(poisoned_id, None).await.unwrap().is_none());
    // Still stored.
    assert!(store.serial_of(poisoned_id).await.unwrap().is_some());

    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![FactSpec::ns("orders")]))
        .unwrap();
    let delivered = facts(&collect_catchup(&mut sub).await);
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|f| f.id() != poisoned_id));
    sub.close().await;

    assert!(store.blacklist_remove(poisoned_id).await.unwrap());
    assert!(!store.blacklist_remove(poisoned_id).await.unwrap());
    assert!(!store.is_blacklisted(&poisoned_id));
    assert!(store.fetch_by_id(poisoned_id, None).await.unwrap().is_some());

    let mut sub = store
        .subscribe(SubscriptionRequest::catchup(vec![FactSpec::ns("orders")]))
        .unwrap();
    assert_eq!(facts(&collect_catchup(&mut sub).await).len(), 3);
    sub.close().await;

    store.shutdown().await;
}

#[tokio::test]
async fn blacklisted_fact_skipped_by_follow() {
    let (store, _dir, _) = open_store("blacklist_follow.db").await;

    let mut sub = store
        .subscribe(SubscriptionRequest::follow(vec![FactSpec::ns("orders")]))
        .unwrap();
    collect_catchup(&mut sub).await;

    let poisoned = numbered("orders", 1);
    store.blacklist_add(poisoned.id(), "known bad").await.unwrap();
    store
        .publish(vec![poisoned, numbered("orders", 2)])
        .await
        .unwrap();

    let delivered = next_facts(&mut sub, 1).await;
    assert_eq!(delivered[0].payload()["n"], 2);

    sub.close().await;
    store.shutdown().await;
}
