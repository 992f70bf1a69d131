#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use factdb::{Fact, FactStore, StoreConfig, Subscription, SubscriptionEvent};
use serde_json::{json, Value};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config() -> StoreConfig {
    StoreConfig {
        allow_unvalidated_publish: true,
        reader_threads: Some(2),
        default_max_latency: Duration::from_millis(50),
        ..StoreConfig::default()
    }
}

pub async fn open_store(name: &str) -> (FactStore, tempfile::TempDir, PathBuf) {
    open_store_with(name, test_config()).await
}

pub async fn open_store_with(
    name: &str,
    config: StoreConfig,
) -> (FactStore, tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let store = FactStore::open_with_config(&path, config)
        .await
        .expect("open store");
    (store, dir, path)
}

pub fn fact(ns: &str, fact_type: &str, payload: Value) -> Fact {
    Fact::builder(ns, fact_type)
        .payload(payload)
        .build()
        .expect("build fact")
}

pub fn fact_on(ns: &str, fact_type: &str, aggregate: Uuid, payload: Value) -> Fact {
    Fact::builder(ns, fact_type)
        .aggregate_id(aggregate)
        .payload(payload)
        .build()
        .expect("build fact")
}

pub fn numbered(ns: &str, n: u64) -> Fact {
    fact(ns, "Numbered", json!({ "n": n }))
}

/// Receives the next event, failing the test after `WAIT`.
pub async fn next_event(sub: &mut Subscription) -> SubscriptionEvent {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("subscription stalled")
        .expect("subscription ended")
        .expect("subscription failed")
}

/// Collects events up to and including `CatchupComplete`.
pub async fn collect_catchup(sub: &mut Subscription) -> Vec<SubscriptionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(sub).await;
        let done = event == SubscriptionEvent::CatchupComplete;
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Facts among the events, in order.
pub fn facts(events: &[SubscriptionEvent]) -> Vec<Fact> {
    events
        .iter()
        .filter_map(|e| match e {
            SubscriptionEvent::Fact(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

/// Receives `n` facts, skipping non-fact events.
pub async fn next_facts(sub: &mut Subscription, n: usize) -> Vec<Fact> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        if let SubscriptionEvent::Fact(f) = next_event(sub).await {
            out.push(f);
        }
    }
    out
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
