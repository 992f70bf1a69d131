//! # Fact Transformation
//!
//! [`Transformer::transform`] delivers a fact stored at version W at a
//! requested version V:
//!
//! ```text
//!   V == 0 or V == W ──────────────────────────────► fact unchanged
//!   otherwise: chain(W → V) ──► key (fact id, V, chain id)
//!                                   │
//!                 memory LRU ──hit──┤
//!                 durable table ─hit┤
//!                                   └─miss─► run chain ─► store in both tiers
//! ```
//!
//! The chain id hashes every step, so registry changes make old cache keys
//! unreachable; nothing is invalidated explicitly. Stale entries are removed
//! by [`Transformer::compact`], which the store runs periodically.
//!
//! The durable tier lives in the `transformation_cache` table so several
//! store instances on one database share transformed payloads. Failing to
//! write it is logged and otherwise ignored: it is a cache.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::current_time_ms;
use crate::error::Result;
use crate::metrics::{MetricsSink, TRANSFORMATION_CACHE_HIT, TRANSFORMATION_CACHE_MISS};
use crate::registry::Registry;
use crate::schema::open_session;
use crate::types::Fact;

/// Durable hits refresh `last_access_ms` at most this often per entry.
const TOUCH_GRANULARITY_MS: u64 = 60_000;

/// Identity of one transformed payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Fact id.
    pub fact_id: Uuid,
    /// Requested version.
    pub version: u32,
    /// Id of the chain that produced the payload.
    pub chain_id: String,
}

struct CachedPayload {
    payload: Value,
    last_access: Instant,
}

// =============================================================================
// Transformer
// =============================================================================

/// Applies transformation chains with a two-tier cache.
pub struct Transformer {
    registry: Arc<Registry>,
    memory: Mutex<LruCache<CacheKey, CachedPayload>>,
    durable: Option<DurableCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl Transformer {
    /// Creates a transformer.
    ///
    /// `capacity` bounds the memory tier; `durable` enables the table tier.
    pub fn new(
        registry: Arc<Registry>,
        capacity: usize,
        durable: Option<DurableCache>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            memory: Mutex::new(LruCache::new(capacity)),
            durable,
            metrics,
        }
    }

    /// Returns `fact` shaped for `version` (0 = as stored).
    ///
    /// # Errors
    ///
    /// - `Error::MissingTransformationInformation` if no chain exists
    /// - `Error::Script` if a step fails
    pub fn transform(&self, fact: Fact, version: u32) -> Result<Fact> {
        if version == 0 || version == fact.version() {
            return Ok(fact);
        }

        let chain = self
            .registry
            .chain(fact.ns(), fact.fact_type(), fact.version(), version)?;
        let key = CacheKey {
            fact_id: fact.id(),
            version,
            chain_id: chain.id().to_string(),
        };

        if let Some(payload) = self.memory_get(&key) {
            self.metrics.count(TRANSFORMATION_CACHE_HIT, 1);
            return Ok(fact.with_version(version, payload));
        }

        if let Some(durable) = &self.durable {
            match durable.get(&key) {
                Ok(Some(payload)) => {
                    self.metrics.count(TRANSFORMATION_CACHE_HIT, 1);
                    self.memory_put(key, payload.clone());
                    return Ok(fact.with_version(version, payload));
                }
                Ok(None) => {}
                Err(e) => warn!(fact_id = %key.fact_id, error = %e, "durable transformation cache read failed"),
            }
        }

        self.metrics.count(TRANSFORMATION_CACHE_MISS, 1);
        let payload = chain.apply(fact.payload().clone())?;
        let transformed = fact.with_version(version, payload.clone());

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(&key, &payload) {
                warn!(fact_id = %key.fact_id, error = %e, "durable transformation cache write failed");
            }
        }
        self.memory_put(key, payload);

        Ok(transformed)
    }

    fn memory_get(&self, key: &CacheKey) -> Option<Value> {
        let mut memory = self.memory.lock();
        let entry = memory.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.payload.clone())
    }

    fn memory_put(&self, key: CacheKey, payload: Value) {
        self.memory.lock().put(
            key,
            CachedPayload {
                payload,
                last_access: Instant::now(),
            },
        );
    }

    /// Number of entries in the memory tier.
    pub fn memory_entries(&self) -> usize {
        self.memory.lock().len()
    }

    /// Drops entries of both tiers not accessed within `max_age`.
    ///
    /// Returns the number of entries removed.
    pub fn compact(&self, max_age: Duration) -> Result<usize> {
        let removed_memory = {
            let mut memory = self.memory.lock();
            let stale: Vec<CacheKey> = memory
                .iter()
                .filter(|(_, entry)| entry.last_access.elapsed() > max_age)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                memory.pop(key);
            }
            stale.len()
        };

        let removed_durable = match &self.durable {
            Some(durable) => {
                let cutoff = current_time_ms().saturating_sub(max_age.as_millis() as u64);
                durable.remove_older_than(cutoff)?
            }
            None => 0,
        };

        debug!(removed_memory, removed_durable, "transformation cache compacted");
        Ok(removed_memory + removed_durable)
    }
}

// =============================================================================
// Durable Tier
// =============================================================================

/// The `transformation_cache` table.
pub struct DurableCache {
    conn: Mutex<Connection>,
}

impl DurableCache {
    /// Opens a cache connection on an initialized database file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_session(path)?))
    }

    /// Wraps an existing connection (schema must be initialized).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload, last_access_ms FROM transformation_cache
                 WHERE fact_id = ? AND version = ? AND chain_id = ?",
                params![key.fact_id.to_string(), key.version, key.chain_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((payload, last_access_ms)) = row else {
            return Ok(None);
        };

        let now = current_time_ms();
        if now.saturating_sub(last_access_ms as u64) > TOUCH_GRANULARITY_MS {
            conn.execute(
                "UPDATE transformation_cache SET last_access_ms = ?
                 WHERE fact_id = ? AND version = ? AND chain_id = ?",
                params![now as i64, key.fact_id.to_string(), key.version, key.chain_id],
            )?;
        }

        Ok(Some(serde_json::from_str(&payload)?))
    }

    fn put(&self, key: &CacheKey, payload: &Value) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO transformation_cache
                 (fact_id, version, chain_id, payload, last_access_ms)
             VALUES (?, ?, ?, ?, ?)",
            params![
                key.fact_id.to_string(),
                key.version,
                key.chain_id,
                payload.to_string(),
                current_time_ms() as i64,
            ],
        )?;
        Ok(())
    }

    fn remove_older_than(&self, cutoff_ms: u64) -> Result<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM transformation_cache WHERE last_access_ms < ?",
            [cutoff_ms as i64],
        )?;
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::metrics::CounterMetrics;
    use crate::registry::TransformationSource;
    use crate::schema::Database;
    use crate::script::RhaiEngine;
    use crate::types::Serial;
    use serde_json::json;

    struct Fixture {
        transformer: Transformer,
        metrics: Arc<CounterMetrics>,
        _dir: tempfile::TempDir,
    }

    fn fixture(durable: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.db");
        let _db = Database::open(&path).unwrap();

        let metrics = Arc::new(CounterMetrics::new());
        let registry = Arc::new(
            Registry::open(&path, Arc::new(RhaiEngine::new()), metrics.clone()).unwrap(),
        );
        registry
            .register_transformation(&TransformationSource::new(
                "users",
                "UserCreated",
                1,
                2,
                r#"event.displayName = event.name; event.remove("name");"#,
            ))
            .unwrap();

        let durable = durable.then(|| DurableCache::open(&path).unwrap());
        Fixture {
            transformer: Transformer::new(registry, 16, durable, metrics.clone()),
            metrics,
            _dir: dir,
        }
    }

    fn user_v1() -> Fact {
        Fact::builder("users", "UserCreated")
            .payload(json!({"name": "ada"}))
            .build()
            .unwrap()
            .with_serial(Serial::from_raw(3))
    }

    #[test]
    fn test_same_version_is_untouched() {
        let fx = fixture(false);
        let fact = user_v1();

        assert_eq!(fx.transformer.transform(fact.clone(), 0).unwrap(), fact);
        assert_eq!(fx.transformer.transform(fact.clone(), 1).unwrap(), fact);
        assert_eq!(fx.metrics.get(TRANSFORMATION_CACHE_MISS), 0);
    }

    #[test]
    fn test_repeated_transform_hits_cache() {
        let fx = fixture(false);
        let fact = user_v1();

        let first = fx.transformer.transform(fact.clone(), 2).unwrap();
        let second = fx.transformer.transform(fact, 2).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.payload(), &json!({"displayName": "ada"}));
        assert_eq!(first.serial(), Some(Serial::from_raw(3)));
        assert_eq!(fx.metrics.get(TRANSFORMATION_CACHE_MISS), 1);
        assert_eq!(fx.metrics.get(TRANSFORMATION_CACHE_HIT), 1);
    }

    #[test]
    fn test_durable_tier_survives_memory_eviction() {
        let fx = fixture(true);
        let fact = user_v1();

        fx.transformer.transform(fact.clone(), 2).unwrap();
        fx.transformer.memory.lock().clear();

        let again = fx.transformer.transform(fact, 2).unwrap();
        assert_eq!(again.payload(), &json!({"displayName": "ada"}));
        // Only the payload is cached; the header is rebuilt from the stored fact.
        assert_eq!(again.version(), 2);
        assert_eq!(again.serial(), Some(Serial::from_raw(3)));
        assert_eq!(again.header()["version"], 2);
        assert_eq!(fx.metrics.get(TRANSFORMATION_CACHE_MISS), 1);
        assert_eq!(fx.metrics.get(TRANSFORMATION_CACHE_HIT), 1);
        assert_eq!(fx.transformer.memory_entries(), 1);
    }

    #[test]
    fn test_missing_chain_is_reported() {
        let fx = fixture(false);
        let err = fx.transformer.transform(user_v1(), 5).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingTransformationInformation { from: 1, to: 5, .. }
        ));
    }

    #[test]
    fn test_compact_drops_stale_entries() {
        let fx = fixture(false);
        fx.transformer.transform(user_v1(), 2).unwrap();
        assert_eq!(fx.transformer.memory_entries(), 1);

        assert_eq!(fx.transformer.compact(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(fx.transformer.compact(Duration::from_millis(1)).unwrap(), 1);
        assert_eq!(fx.transformer.memory_entries(), 0);
    }
}
