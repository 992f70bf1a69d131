//! # Async API for FactDB
//!
//! [`FactStore`] is the entry point. It owns the worker threads and tasks and
//! routes every call to the component responsible for it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              FactStore                                   │
//! │                                                                          │
//! │  publish / lock ──► FactValidator ──► WriterHandle ──► writer thread     │
//! │                                                     │   (R/W conn)       │
//! │                                                     │                    │
//! │                                           broadcast │ FactsCommitted     │
//! │                                                     ▼ BlacklistChanged   │
//! │  subscribe ──► Subscription ─── register ──►  FollowHub ──► Blacklist    │
//! │                   │ catchup: own session                                 │
//! │                   │ follow:  ReaderPool ◄── fetch / state / enumerate    │
//! │                   ▼                                                      │
//! │             DeliveryPipeline ──► Transformer ──► Registry (R/W conn)     │
//! │                                      │                                   │
//! │                                      └──► DurableCache (R/W conn)        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Blocking Work
//!
//! SQLite connections are `!Sync`, so they live on dedicated threads (writer,
//! readers) or behind a mutex (registry, durable cache). Calls that touch the
//! mutex-guarded connections, or run scripts, go through
//! `tokio::task::spawn_blocking` so they never stall the async runtime.
//!
//! ## Background Work
//!
//! A compaction task sweeps the transformation cache and purges abandoned
//! state tokens every `cache_compaction_interval`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blacklist::Blacklist;
use crate::codec::current_time_ms;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::follow::{refresh_blacklist, FollowHub};
use crate::lock::LockBuilder;
use crate::metrics::{CounterMetrics, MetricsSink};
use crate::reader::ReaderPool;
use crate::registry::{Registry, SchemaSource, TransformationSource};
use crate::schema::Database;
use crate::script::{PredicateCache, RhaiEngine, ScriptEngine};
use crate::subscription::{FactObserver, ObservedSubscription, Subscription, SubscriptionContext};
use crate::transform::{DurableCache, Transformer};
use crate::types::{AggregateState, Fact, PublishResult, Serial, StateToken, SubscriptionRequest};
use crate::validation::FactValidator;
use crate::writer::{spawn_fact_writer, WriterHandle};

// =============================================================================
// FactStore
// =============================================================================

/// Handle to an open fact store.
///
/// `FactStore` is `Clone`, `Send` and `Sync`; all clones share the same
/// threads and caches.
///
/// # Example
///
/// ```rust,ignore
/// use factdb::{Fact, FactSpec, FactStore, SubscriptionEvent, SubscriptionRequest};
///
/// #[tokio::main]
/// async fn main() -> factdb::Result<()> {
///     let store = FactStore::open("facts.db").await?;
///
///     let fact = Fact::builder("orders", "OrderPlaced")
///         .payload(serde_json::json!({"total": 42}))
///         .build()?;
///     store.publish_one(fact).await?;
///
///     let mut sub = store.subscribe(SubscriptionRequest::catchup(vec![FactSpec::ns("orders")]))?;
///     while let Some(event) = sub.next().await {
///         if let SubscriptionEvent::Fact(fact) = event? {
///             println!("{} {}", fact.fact_type(), fact.payload());
///         }
///     }
///
///     store.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    config: StoreConfig,
    writer: WriterHandle,
    reader: ReaderPool,
    hub: Arc<FollowHub>,
    blacklist: Arc<Blacklist>,
    registry: Arc<Registry>,
    transformer: Arc<Transformer>,
    validator: Arc<FactValidator>,
    subscriptions: Arc<SubscriptionContext>,
    metrics: Arc<dyn MetricsSink>,
    compaction: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl FactStore {
    /// Opens or creates a store with the default configuration.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default()).await
    }

    /// Opens or creates a store with an explicit configuration.
    ///
    /// Metrics go to an in-memory [`CounterMetrics`].
    pub async fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_with(
            path,
            config,
            Arc::new(RhaiEngine::new()),
            Arc::new(CounterMetrics::new()),
        )
        .await
    }

    /// Opens or creates a store with a custom script engine and metrics sink.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the configuration is out of range
    /// - `Error::Schema` if the file has an incompatible schema version
    pub async fn open_with(
        path: impl AsRef<Path>,
        config: StoreConfig,
        engine: Arc<dyn ScriptEngine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let db = Database::open(&path)?;
        let writer = spawn_fact_writer(db.into_connection(), config.writer.clone())?;
        let reader = ReaderPool::spawn(&path, config.reader_threads)?;

        let registry = Arc::new(Registry::open(&path, Arc::clone(&engine), Arc::clone(&metrics))?);
        let durable = if config.durable_transformation_cache {
            Some(DurableCache::open(&path)?)
        } else {
            None
        };
        let transformer = Arc::new(Transformer::new(
            Arc::clone(&registry),
            config.transformation_cache_capacity,
            durable,
            Arc::clone(&metrics),
        ));
        let validator = Arc::new(FactValidator::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.validation_enabled,
            config.allow_unvalidated_publish,
        ));

        // Subscribe before the initial load so no change between the two is missed.
        let notifications = writer.subscribe();
        let blacklist = Arc::new(Blacklist::new());
        refresh_blacklist(&reader, &blacklist).await?;
        let hub = Arc::new(FollowHub::spawn(
            notifications,
            reader.clone(),
            Arc::clone(&blacklist),
            config.blacklist_refresh_interval,
        ));

        let subscriptions = Arc::new(SubscriptionContext {
            path: path.clone(),
            reader: reader.clone(),
            hub: Arc::clone(&hub),
            blacklist: Arc::clone(&blacklist),
            transformer: Arc::clone(&transformer),
            predicates: PredicateCache::new(engine),
            metrics: Arc::clone(&metrics),
            config: config.clone(),
        });

        let compaction = spawn_compaction_task(
            writer.clone(),
            Arc::clone(&transformer),
            config.cache_compaction_interval,
            config.cache_max_age,
        );

        info!(
            path = %path.display(),
            readers = reader.size(),
            blacklisted = blacklist.len(),
            "fact store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                config,
                writer,
                reader,
                hub,
                blacklist,
                registry,
                transformer,
                validator,
                subscriptions,
                metrics,
                compaction: Mutex::new(Some(compaction)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The metrics sink events are reported to.
    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        Arc::clone(&self.inner.metrics)
    }

    /// Number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.inner.reader.size()
    }

    /// Number of subscriptions currently in their follow phase.
    pub fn active_followers(&self) -> usize {
        self.inner.hub.active()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("fact store has shut down".to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Validates and appends facts as one atomic batch.
    ///
    /// Facts get consecutive serials in list order. If any fact is rejected,
    /// none is written.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidFact` for an empty list
    /// - `Error::Validation` if a payload violates its schema
    /// - `Error::DuplicateFactId` if an id was published before
    pub async fn publish(&self, facts: Vec<Fact>) -> Result<PublishResult> {
        self.ensure_open()?;
        if facts.is_empty() {
            return Err(Error::InvalidFact("nothing to publish".into()));
        }
        let facts = self.validated(facts).await?;
        self.inner.writer.publish(facts).await
    }

    /// Publishes a single fact.
    pub async fn publish_one(&self, fact: Fact) -> Result<PublishResult> {
        self.publish(vec![fact]).await
    }

    /// Publishes only if the state captured by `token` is still current.
    ///
    /// Returns `false` (and writes nothing) if any guarded aggregate has
    /// advanced. The token is consumed on success and kept otherwise.
    ///
    /// # Errors
    ///
    /// `Error::InvalidStateToken` if the token is unknown or already consumed.
    pub async fn publish_if_unchanged(&self, token: StateToken, facts: Vec<Fact>) -> Result<bool> {
        Ok(self.publish_if_unchanged_result(token, facts).await?.is_some())
    }

    pub(crate) async fn publish_if_unchanged_result(
        &self,
        token: StateToken,
        facts: Vec<Fact>,
    ) -> Result<Option<PublishResult>> {
        self.ensure_open()?;
        let facts = self.validated(facts).await?;
        self.inner.writer.publish_if_unchanged(token, facts).await
    }

    async fn validated(&self, facts: Vec<Fact>) -> Result<Vec<Fact>> {
        let validator = Arc::clone(&self.inner.validator);
        blocking(move || {
            validator.validate_all(&facts)?;
            Ok(facts)
        })
        .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Starts a subscription.
    ///
    /// # Errors
    ///
    /// `Error::InvalidFact` for an empty or malformed request and
    /// `Error::Script` if a filter script does not compile. Errors during
    /// delivery arrive through the subscription itself.
    pub fn subscribe(&self, request: SubscriptionRequest) -> Result<Subscription> {
        self.ensure_open()?;
        Subscription::start(Arc::clone(&self.inner.subscriptions), request)
    }

    /// Starts a subscription that drives `observer` from a background task.
    pub fn observe<O: FactObserver>(
        &self,
        request: SubscriptionRequest,
        observer: O,
    ) -> Result<ObservedSubscription> {
        let subscription = self.subscribe(request)?;
        Ok(ObservedSubscription::start(subscription, observer))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetches a fact by id, transformed to `version` if given.
    ///
    /// Blacklisted facts are reported as absent.
    ///
    /// # Errors
    ///
    /// `Error::MissingTransformationInformation` if the fact cannot be
    /// brought to `version`.
    pub async fn fetch_by_id(&self, id: Uuid, version: Option<u32>) -> Result<Option<Fact>> {
        self.ensure_open()?;
        let Some(fact) = self.inner.reader.fetch_by_id(id).await? else {
            return Ok(None);
        };
        if self.inner.blacklist.is_blocked(&fact.id()) {
            return Ok(None);
        }
        match version {
            None => Ok(Some(fact)),
            Some(version) => {
                let transformer = Arc::clone(&self.inner.transformer);
                blocking(move || transformer.transform(fact, version).map(Some)).await
            }
        }
    }

    /// Fetches a fact by serial, as stored.
    pub async fn fetch_by_serial(&self, serial: Serial) -> Result<Option<Fact>> {
        self.ensure_open()?;
        let fact = self.inner.reader.fetch_by_serial(serial).await?;
        Ok(fact.filter(|f| !self.inner.blacklist.is_blocked(&f.id())))
    }

    /// Serial assigned to the fact with this id.
    pub async fn serial_of(&self, id: Uuid) -> Result<Option<Serial>> {
        self.ensure_open()?;
        self.inner.reader.serial_of(id).await
    }

    /// Highest serial in the store, `None` while empty.
    pub async fn latest_serial(&self) -> Result<Option<Serial>> {
        self.ensure_open()?;
        self.inner.reader.latest_serial().await
    }

    /// Distinct namespaces, sorted.
    pub async fn enumerate_namespaces(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.inner.reader.enumerate_namespaces().await
    }

    /// Distinct fact types in `ns`, sorted.
    pub async fn enumerate_types(&self, ns: impl Into<String>) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.inner.reader.enumerate_types(ns.into()).await
    }

    /// Current last fact id per aggregate, without taking a token.
    pub async fn state_for(
        &self,
        ns: impl Into<String>,
        aggregate_ids: impl IntoIterator<Item = Uuid>,
    ) -> Result<AggregateState> {
        self.ensure_open()?;
        self.inner
            .reader
            .state_for(ns.into(), aggregate_ids.into_iter().collect())
            .await
    }

    // =========================================================================
    // Optimistic Locking
    // =========================================================================

    /// Captures the state of `aggregate_ids` in `ns` and returns a token for it.
    ///
    /// An empty id set guards the namespace as a whole.
    pub async fn acquire_lock(
        &self,
        ns: impl Into<String>,
        aggregate_ids: impl IntoIterator<Item = Uuid>,
    ) -> Result<(StateToken, AggregateState)> {
        self.ensure_open()?;
        self.inner
            .writer
            .acquire_token(ns.into(), aggregate_ids.into_iter().collect())
            .await
    }

    /// Abandons a token. Unknown tokens are ignored.
    pub async fn invalidate(&self, token: StateToken) -> Result<()> {
        self.ensure_open()?;
        self.inner.writer.invalidate(token).await
    }

    /// Starts a locked operation on `ns`. See [`LockBuilder`].
    pub fn lock(&self, ns: impl Into<String>) -> LockBuilder {
        LockBuilder::new(self.clone(), ns.into(), self.inner.config.lock_retries)
    }

    // =========================================================================
    // Blacklist
    // =========================================================================

    /// Suppresses a fact on every delivery path.
    ///
    /// The in-memory set is reloaded before this returns.
    pub async fn blacklist_add(&self, id: Uuid, reason: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.inner.writer.blacklist_add(id, Some(reason.into())).await?;
        refresh_blacklist(&self.inner.reader, &self.inner.blacklist).await
    }

    /// Lifts a suppression. Returns false if the id was not blacklisted.
    pub async fn blacklist_remove(&self, id: Uuid) -> Result<bool> {
        self.ensure_open()?;
        let removed = self.inner.writer.blacklist_remove(id).await?;
        refresh_blacklist(&self.inner.reader, &self.inner.blacklist).await?;
        Ok(removed)
    }

    /// Whether `id` is currently suppressed.
    pub fn is_blacklisted(&self, id: &Uuid) -> bool {
        self.inner.blacklist.is_blocked(id)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Registers a JSON schema. Re-registering identical content is a no-op.
    ///
    /// # Errors
    ///
    /// `Error::SchemaConflict` if the id is taken by different content.
    pub async fn register_schema(&self, source: SchemaSource) -> Result<()> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.inner.registry);
        blocking(move || registry.register_schema(&source)).await
    }

    /// Whether exactly this schema is registered.
    pub async fn contains_schema(&self, source: SchemaSource) -> Result<bool> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.inner.registry);
        blocking(move || registry.contains_schema(&source)).await
    }

    /// Registers a transformation step.
    ///
    /// # Errors
    ///
    /// - `Error::TransformationConflict` if the id is taken by different code
    /// - `Error::Script` if the code does not compile
    pub async fn register_transformation(&self, source: TransformationSource) -> Result<()> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.inner.registry);
        blocking(move || registry.register_transformation(&source)).await
    }

    /// Whether exactly this transformation is registered.
    pub async fn contains_transformation(&self, source: TransformationSource) -> Result<bool> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.inner.registry);
        blocking(move || registry.contains_transformation(&source)).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sweeps transformation cache entries not accessed within `cache_max_age`.
    ///
    /// Runs periodically in the background; exposed for tests and tooling.
    pub async fn compact_transformation_cache(&self) -> Result<usize> {
        self.ensure_open()?;
        let transformer = Arc::clone(&self.inner.transformer);
        let max_age = self.inner.config.cache_max_age;
        blocking(move || transformer.compact(max_age)).await
    }

    /// Shuts the store down.
    ///
    /// Stops the compaction task and the follow hub, then the reader threads,
    /// then commits any pending batch and stops the writer. Every clone
    /// fails with `Error::Closed` afterwards; open subscriptions end.
    pub async fn shutdown(self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let compaction = self.inner.compaction.lock().take();
        if let Some(task) = compaction {
            task.abort();
        }
        self.inner.hub.shutdown().await;
        self.inner.reader.shutdown().await;
        self.inner.writer.shutdown().await;
        info!(path = %self.inner.path.display(), "fact store closed");
    }
}

/// Runs blocking work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

/// Spawns the background cache and token sweep.
fn spawn_compaction_task(
    writer: WriterHandle,
    transformer: Arc<Transformer>,
    period: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        // Skip the first immediate tick
        interval.tick().await;

        loop {
            interval.tick().await;

            let sweep = Arc::clone(&transformer);
            match blocking(move || sweep.compact(max_age)).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "transformation cache compacted"),
                Err(e) => warn!(error = %e, "transformation cache compaction failed"),
            }

            let cutoff = current_time_ms().saturating_sub(max_age.as_millis() as u64);
            match writer.purge_tokens(cutoff).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "abandoned state tokens purged"),
                Err(Error::Closed(_)) => break,
                Err(e) => warn!(error = %e, "state token purge failed"),
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FactSpec;
    use serde_json::json;

    async fn test_store() -> (FactStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            allow_unvalidated_publish: true,
            reader_threads: Some(2),
            ..StoreConfig::default()
        };
        let store = FactStore::open_with_config(dir.path().join("facts.db"), config)
            .await
            .unwrap();
        (store, dir)
    }

    fn order(total: u64) -> Fact {
        Fact::builder("orders", "OrderPlaced")
            .payload(json!({ "total": total }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_shutdown() {
        let (store, _dir) = test_store().await;
        assert_eq!(store.reader_count(), 2);
        assert_eq!(store.latest_serial().await.unwrap(), None);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_assigns_consecutive_serials() {
        let (store, _dir) = test_store().await;

        let result = store.publish(vec![order(1), order(2), order(3)]).await.unwrap();
        assert_eq!(result.first_serial, Serial::FIRST);
        assert_eq!(result.last_serial.as_raw(), 3);

        let fact = store.fetch_by_serial(result.last_serial).await.unwrap().unwrap();
        assert_eq!(fact.id(), result.last_fact_id);
        assert_eq!(fact.payload(), &json!({"total": 3}));
        assert_eq!(store.serial_of(fact.id()).await.unwrap(), Some(result.last_serial));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_batch() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.publish(Vec::new()).await,
            Err(Error::InvalidFact(_))
        ));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_enumeration() {
        let (store, _dir) = test_store().await;
        store.publish_one(order(1)).await.unwrap();
        store
            .publish_one(Fact::builder("users", "UserCreated").build().unwrap())
            .await
            .unwrap();
        store
            .publish_one(Fact::builder("orders", "OrderShipped").build().unwrap())
            .await
            .unwrap();

        assert_eq!(store.enumerate_namespaces().await.unwrap(), vec!["orders", "users"]);
        assert_eq!(
            store.enumerate_types("orders").await.unwrap(),
            vec!["OrderPlaced", "OrderShipped"]
        );

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (store, _dir) = test_store().await;
        let clone = store.clone();
        store.shutdown().await;

        assert!(matches!(clone.publish_one(order(1)).await, Err(Error::Closed(_))));
        assert!(matches!(
            clone.subscribe(SubscriptionRequest::catchup(vec![FactSpec::ns("orders")])),
            Err(Error::Closed(_))
        ));
    }
}
