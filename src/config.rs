//! # Store Configuration
//!
//! [`StoreConfig`] gathers every tunable of a [`FactStore`](crate::FactStore)
//! in one plain struct. Each field has a documented default constant, so
//! `StoreConfig::default()` is always a sensible production setup and tests
//! override only what they care about:
//!
//! ```rust
//! use factdb::StoreConfig;
//!
//! let config = StoreConfig {
//!     catchup_chunk_size: 10,
//!     allow_unvalidated_publish: true,
//!     ..StoreConfig::default()
//! };
//! assert_eq!(config.lock_retries, 10);
//! ```
//!
//! Deployments can overlay `FACTDB_*` environment variables with
//! [`StoreConfig::from_env`].

use std::time::Duration;

use crate::error::{Error, Result};
use crate::writer::WriterConfig;

// =============================================================================
// Defaults
// =============================================================================

/// Serials drained from the catchup snapshot per round trip.
pub const DEFAULT_CATCHUP_CHUNK_SIZE: usize = 1000;

/// Upper bound for the chunk size (SQLite host parameter limit).
pub const MAX_CATCHUP_CHUNK_SIZE: usize = 10_000;

/// Follow latency used when a request does not declare one.
pub const DEFAULT_MAX_LATENCY_MS: u64 = 1000;

/// Smallest safety-net timer period the follow hub will run at.
pub const MIN_LATENCY_MS: u64 = 10;

/// Maximum facts fetched by a single follow re-query.
pub const DEFAULT_FOLLOW_BATCH_LIMIT: usize = 500;

/// Consecutive failed follow re-queries tolerated before the subscription fails.
pub const DEFAULT_FOLLOW_MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Entries kept in the in-memory transformation cache.
pub const DEFAULT_TRANSFORMATION_CACHE_CAPACITY: usize = 10_000;

/// How often stale transformation cache entries and state tokens are swept.
pub const DEFAULT_CACHE_COMPACTION_INTERVAL_SECS: u64 = 60 * 60;

/// Cache entries not accessed for this long are removed by the sweep.
pub const DEFAULT_CACHE_MAX_AGE_DAYS: u64 = 30;

/// Safety-net period for re-reading the blacklist from disk.
pub const DEFAULT_BLACKLIST_REFRESH_SECS: u64 = 5 * 60;

/// Retries the lock DSL performs before giving up.
pub const DEFAULT_LOCK_RETRIES: u32 = 10;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

// =============================================================================
// StoreConfig
// =============================================================================

/// Configuration for a [`FactStore`](crate::FactStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Serials drained from the catchup snapshot per chunk.
    pub catchup_chunk_size: usize,

    /// Follow latency for requests without an explicit `max_latency`.
    pub default_max_latency: Duration,

    /// Floor applied to every requested latency.
    pub min_latency: Duration,

    /// Maximum facts returned by one follow re-query.
    pub follow_batch_limit: usize,

    /// Failed follow re-queries in a row before the subscription errors out.
    pub follow_max_consecutive_errors: u32,

    /// Capacity of the in-memory transformation cache tier.
    pub transformation_cache_capacity: usize,

    /// Persist transformed facts in the `transformation_cache` table.
    pub durable_transformation_cache: bool,

    /// Interval of the background cache sweep.
    pub cache_compaction_interval: Duration,

    /// Last-access age after which cache entries and unused tokens are dropped.
    pub cache_max_age: Duration,

    /// Validate payloads against registered schemas on publish.
    pub validation_enabled: bool,

    /// Accept facts for which no schema is registered.
    pub allow_unvalidated_publish: bool,

    /// During catchup, skip (and log) facts that cannot be transformed to the
    /// requested version instead of failing the subscription.
    pub skip_missing_transformation: bool,

    /// Safety-net period for re-reading the blacklist.
    pub blacklist_refresh_interval: Duration,

    /// Reader pool size. `None` sizes the pool from the CPU count.
    pub reader_threads: Option<usize>,

    /// Retries used by [`LockBuilder`](crate::LockBuilder) unless overridden.
    pub lock_retries: u32,

    /// Group commit settings for the writer thread.
    pub writer: WriterConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            catchup_chunk_size: DEFAULT_CATCHUP_CHUNK_SIZE,
            default_max_latency: Duration::from_millis(DEFAULT_MAX_LATENCY_MS),
            min_latency: Duration::from_millis(MIN_LATENCY_MS),
            follow_batch_limit: DEFAULT_FOLLOW_BATCH_LIMIT,
            follow_max_consecutive_errors: DEFAULT_FOLLOW_MAX_CONSECUTIVE_ERRORS,
            transformation_cache_capacity: DEFAULT_TRANSFORMATION_CACHE_CAPACITY,
            durable_transformation_cache: true,
            cache_compaction_interval: Duration::from_secs(DEFAULT_CACHE_COMPACTION_INTERVAL_SECS),
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_DAYS * SECONDS_PER_DAY),
            validation_enabled: true,
            allow_unvalidated_publish: false,
            skip_missing_transformation: false,
            blacklist_refresh_interval: Duration::from_secs(DEFAULT_BLACKLIST_REFRESH_SECS),
            reader_threads: None,
            lock_retries: DEFAULT_LOCK_RETRIES,
            writer: WriterConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Builds a config from defaults overlaid with `FACTDB_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FACTDB_CATCHUP_CHUNK_SIZE` | `catchup_chunk_size` |
    /// | `FACTDB_MAX_LATENCY_MS` | `default_max_latency` |
    /// | `FACTDB_FOLLOW_BATCH_LIMIT` | `follow_batch_limit` |
    /// | `FACTDB_FOLLOW_MAX_ERRORS` | `follow_max_consecutive_errors` |
    /// | `FACTDB_TRANSFORMATION_CACHE_CAPACITY` | `transformation_cache_capacity` |
    /// | `FACTDB_DURABLE_TRANSFORMATION_CACHE` | `durable_transformation_cache` |
    /// | `FACTDB_CACHE_MAX_AGE_DAYS` | `cache_max_age` |
    /// | `FACTDB_VALIDATION` | `validation_enabled` |
    /// | `FACTDB_ALLOW_UNVALIDATED_PUBLISH` | `allow_unvalidated_publish` |
    /// | `FACTDB_SKIP_MISSING_TRANSFORMATION` | `skip_missing_transformation` |
    /// | `FACTDB_READER_THREADS` | `reader_threads` |
    /// | `FACTDB_LOCK_RETRIES` | `lock_retries` |
    /// | `FACTDB_BATCH_TIMEOUT_MS` | `writer.batch_timeout` |
    ///
    /// # Errors
    ///
    /// `Error::Config` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse::<usize>(&lookup, "FACTDB_CATCHUP_CHUNK_SIZE")? {
            config.catchup_chunk_size = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTDB_MAX_LATENCY_MS")? {
            config.default_max_latency = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "FACTDB_FOLLOW_BATCH_LIMIT")? {
            config.follow_batch_limit = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "FACTDB_FOLLOW_MAX_ERRORS")? {
            config.follow_max_consecutive_errors = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "FACTDB_TRANSFORMATION_CACHE_CAPACITY")? {
            config.transformation_cache_capacity = v;
        }
        if let Some(v) = parse_bool(&lookup, "FACTDB_DURABLE_TRANSFORMATION_CACHE")? {
            config.durable_transformation_cache = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTDB_CACHE_MAX_AGE_DAYS")? {
            let secs = v.checked_mul(SECONDS_PER_DAY).ok_or_else(|| {
                Error::Config(format!("FACTDB_CACHE_MAX_AGE_DAYS: {v} days is out of range"))
            })?;
            config.cache_max_age = Duration::from_secs(secs);
        }
        if let Some(v) = parse_bool(&lookup, "FACTDB_VALIDATION")? {
            config.validation_enabled = v;
        }
        if let Some(v) = parse_bool(&lookup, "FACTDB_ALLOW_UNVALIDATED_PUBLISH")? {
            config.allow_unvalidated_publish = v;
        }
        if let Some(v) = parse_bool(&lookup, "FACTDB_SKIP_MISSING_TRANSFORMATION")? {
            config.skip_missing_transformation = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "FACTDB_READER_THREADS")? {
            config.reader_threads = Some(v);
        }
        if let Some(v) = parse::<u32>(&lookup, "FACTDB_LOCK_RETRIES")? {
            config.lock_retries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTDB_BATCH_TIMEOUT_MS")? {
            config.writer.batch_timeout = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.catchup_chunk_size == 0 || self.catchup_chunk_size > MAX_CATCHUP_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "catchup_chunk_size must be in 1..={MAX_CATCHUP_CHUNK_SIZE}, got {}",
                self.catchup_chunk_size
            )));
        }
        if self.follow_batch_limit == 0 {
            return Err(Error::Config("follow_batch_limit must be positive".into()));
        }
        if self.transformation_cache_capacity == 0 {
            return Err(Error::Config(
                "transformation_cache_capacity must be positive".into(),
            ));
        }
        if self.reader_threads == Some(0) {
            return Err(Error::Config("reader_threads must be positive".into()));
        }
        for (name, value) in [
            ("min_latency", self.min_latency),
            ("blacklist_refresh_interval", self.blacklist_refresh_interval),
            ("cache_compaction_interval", self.cache_compaction_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Clamps a requested follow latency to the configured floor.
    pub(crate) fn effective_latency(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_max_latency)
            .max(self.min_latency)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.catchup_chunk_size, DEFAULT_CATCHUP_CHUNK_SIZE);
        assert!(!config.allow_unvalidated_publish);
    }

    #[test]
    fn test_env_overlay() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("FACTDB_CATCHUP_CHUNK_SIZE", "25"),
            ("FACTDB_ALLOW_UNVALIDATED_PUBLISH", "true"),
            ("FACTDB_MAX_LATENCY_MS", "250"),
            ("FACTDB_READER_THREADS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.catchup_chunk_size, 25);
        assert!(config.allow_unvalidated_publish);
        assert_eq!(config.default_max_latency, Duration::from_millis(250));
        assert_eq!(config.reader_threads, Some(2));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = StoreConfig::from_lookup(lookup(&[("FACTDB_LOCK_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = StoreConfig::from_lookup(lookup(&[("FACTDB_VALIDATION", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err =
            StoreConfig::from_lookup(lookup(&[("FACTDB_CATCHUP_CHUNK_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let max = u64::MAX.to_string();
        let err = StoreConfig::from_lookup(lookup(&[("FACTDB_CACHE_MAX_AGE_DAYS", max.as_str())]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config =
            StoreConfig::from_lookup(lookup(&[("FACTDB_CACHE_MAX_AGE_DAYS", "2")])).unwrap();
        assert_eq!(config.cache_max_age, Duration::from_secs(2 * SECONDS_PER_DAY));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let zeroed = [
            StoreConfig {
                cache_compaction_interval: Duration::ZERO,
                ..StoreConfig::default()
            },
            StoreConfig {
                blacklist_refresh_interval: Duration::ZERO,
                ..StoreConfig::default()
            },
            StoreConfig {
                min_latency: Duration::ZERO,
                default_max_latency: Duration::ZERO,
                ..StoreConfig::default()
            },
        ];
        for config in zeroed {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_effective_latency_floor() {
        let config = StoreConfig::default();
        assert_eq!(
            config.effective_latency(Some(Duration::from_millis(1))),
            config.min_latency
        );
        assert_eq!(config.effective_latency(None), config.default_max_latency);
    }
}
