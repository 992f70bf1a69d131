//! Group Commit Tests
//!
//! Concurrent publishes share writer batches, but each publish runs in its own
//! SAVEPOINT: a rejected publish never affects the others in its batch.

mod common;

use std::collections::HashSet;

use factdb::Error;

use common::{numbered, open_store};

#[tokio::test]
async fn concurrent_publishes_get_unique_serials() {
    let (store, _dir, _) = open_store("group_commit.db").await;

    let mut tasks = Vec::new();
    for n in 0..50 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.publish_one(numbered("orders", n)).await.unwrap()
        }));
    }

    let mut serials = HashSet::new();
    for task in tasks {
        let result = task.await.unwrap();
        assert!(serials.insert(result.first_serial));
    }
    assert_eq!(serials.len(), 50);
    assert_eq!(store.latest_serial().await.unwrap().unwrap().as_raw(), 50);

    store.shutdown().await;
}

#[tokio::test]
async fn duplicate_in_batch_does_not_affect_neighbours() {
    let (store, _dir, _) = open_store("isolation.db").await;

    let existing = numbered("orders", 0);
    store.publish_one(existing.clone()).await.unwrap();

    let before = {
        let store = store.clone();
        tokio::spawn(async move { store.publish_one(numbered("orders", 1)).await })
    };
    let duplicate = {
        let store = store.clone();
        let again = existing.clone();
        tokio::spawn(async move {
            store
                .publish(vec![numbered("orders", 2), again])
                .await
        })
    };
    let after = {
        let store = store.clone();
        tokio::spawn(async move { store.publish_one(numbered("orders", 3)).await })
    };

    assert!(before.await.unwrap().is_ok());
    assert!(matches!(
        duplicate.await.unwrap(),
        Err(Error::DuplicateFactId(id)) if id == existing.id()
    ));
    assert!(after.await.unwrap().is_ok());

    // Only the three single publishes are stored; the failed batch left nothing.
    assert_eq!(store.latest_serial().await.unwrap().unwrap().as_raw(), 3);
    let namespaces = store.enumerate_namespaces().await.unwrap();
    assert_eq!(namespaces, vec!["orders"]);

    store.shutdown().await;
}
