//! # Catchup Engine
//!
//! Replays history for one subscription from a dedicated SQLite session.
//!
//! ## Temp-Table Snapshot
//!
//! ```text
//!   1. CREATE TEMP TABLE catchup_serials (serial PRIMARY KEY)
//!   2. one read transaction:
//!        high_water = MAX(serial)
//!        INSERT INTO catchup_serials SELECT serial FROM facts
//!          WHERE serial > start AND serial <= high_water AND <pushed-down specs>
//!   3. loop: DELETE smallest N serials ... RETURNING serial
//!            fetch rows ─► blacklist ─► matcher ─► transform ─► deliver
//!   4. DROP TABLE catchup_serials
//! ```
//!
//! The result set is fixed in step 2, so facts committed while the scan runs
//! never show up in it; they are picked up by the follow phase, which starts
//! strictly after `high_water`. Draining by `DELETE ... RETURNING` keeps each
//! chunk cheap regardless of how far the scan has progressed.
//!
//! ## Cancellation
//!
//! A shared flag is checked before every chunk and before every delivery.
//! Cancelling ends the scan without an error and without further deliveries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};
use tracing::debug;

use crate::error::Result;
use crate::matcher::SqlFilter;
use crate::metrics::{MetricsSink, CATCHUP_DURATION};
use crate::pipeline::DeliveryPipeline;
use crate::reader::fetch_serials;
use crate::schema::open_session;
use crate::types::{Fact, Serial};

/// How a catchup scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CatchupOutcome {
    /// Highest serial in the store when the snapshot was taken.
    pub(crate) high_water: Serial,
    /// Serial of the last delivered fact.
    pub(crate) last_delivered: Option<Serial>,
    /// Number of facts delivered.
    pub(crate) delivered: usize,
    /// True if the scan stopped early (flag set or consumer gone).
    pub(crate) cancelled: bool,
}

/// One catchup scan.
pub(crate) struct CatchupScan<'a> {
    pub(crate) filter: &'a SqlFilter,
    pub(crate) after: Serial,
    pub(crate) chunk_size: usize,
    pub(crate) pipeline: &'a DeliveryPipeline,
    pub(crate) cancel: &'a AtomicBool,
    pub(crate) metrics: &'a dyn MetricsSink,
    pub(crate) label: &'a str,
}

impl CatchupScan<'_> {
    /// Runs the scan on a new session for the database at `path`.
    ///
    /// `deliver` returns false when the consumer is gone, which ends the scan
    /// like a cancellation.
    pub(crate) fn run(&self, path: &Path, deliver: impl FnMut(Fact) -> bool) -> Result<CatchupOutcome> {
        let started = Instant::now();
        let mut conn = open_session(path)?;
        conn.execute_batch("CREATE TEMP TABLE catchup_serials (serial INTEGER PRIMARY KEY)")?;

        let outcome = self.scan(&mut conn, deliver);

        let _ = conn.execute_batch("DROP TABLE IF EXISTS temp.catchup_serials");
        drop(conn);

        let elapsed = started.elapsed();
        self.metrics.timer(CATCHUP_DURATION, elapsed);
        if let Ok(outcome) = &outcome {
            debug!(
                subscription = %self.label,
                after = %self.after,
                high_water = %outcome.high_water,
                delivered = outcome.delivered,
                cancelled = outcome.cancelled,
                elapsed_ms = elapsed.as_millis() as u64,
                "catchup finished"
            );
        }
        outcome
    }

    fn scan(&self, conn: &mut Connection, mut deliver: impl FnMut(Fact) -> bool) -> Result<CatchupOutcome> {
        let (high_water, snapshot) = self.snapshot(conn)?;
        let conn: &Connection = conn;
        debug!(subscription = %self.label, %high_water, snapshot, "catchup snapshot taken");

        let mut outcome = CatchupOutcome {
            high_water,
            last_delivered: None,
            delivered: 0,
            cancelled: false,
        };

        let mut take = conn.prepare(
            "DELETE FROM temp.catchup_serials
             WHERE serial IN (SELECT serial FROM temp.catchup_serials ORDER BY serial LIMIT ?)
             RETURNING serial",
        )?;

        'chunks: loop {
            if self.cancel.load(Ordering::Acquire) {
                outcome.cancelled = true;
                break;
            }

            let mut serials = take
                .query_map([self.chunk_size as i64], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if serials.is_empty() {
                break;
            }
            // RETURNING does not guarantee any order.
            serials.sort_unstable();

            for fact in fetch_serials(conn, &serials)? {
                if self.cancel.load(Ordering::Acquire) {
                    outcome.cancelled = true;
                    break 'chunks;
                }
                let serial = fact.serial();
                let Some(fact) = self.pipeline.process(fact)? else {
                    continue;
                };
                if !deliver(fact) {
                    outcome.cancelled = true;
                    break 'chunks;
                }
                outcome.last_delivered = serial;
                outcome.delivered += 1;
            }
        }

        Ok(outcome)
    }

    /// Fixes the result set. Returns the high-water serial and the number of
    /// candidate rows.
    fn snapshot(&self, conn: &mut Connection) -> Result<(Serial, usize)> {
        let tx = conn.transaction()?;

        let high_water: i64 =
            tx.query_row("SELECT COALESCE(MAX(serial), 0) FROM facts", [], |row| row.get(0))?;

        let mut values = Vec::with_capacity(self.filter.params.len() + 2);
        values.push(SqlValue::Integer(self.after.as_sql()));
        values.push(SqlValue::Integer(high_water));
        values.extend(self.filter.params.iter().cloned());

        let inserted = tx.execute(
            &format!(
                "INSERT INTO temp.catchup_serials (serial)
                 SELECT f.serial FROM facts f
                 WHERE f.serial > ? AND f.serial <= ? AND {}",
                self.filter.clause
            ),
            params_from_iter(values),
        )?;
        tx.commit()?;

        Ok((Serial::from_raw(high_water as u64), inserted))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::matcher::SpecMatcher;
    use crate::metrics::{CounterMetrics, NoopMetrics};
    use crate::registry::Registry;
    use crate::schema::Database;
    use crate::script::RhaiEngine;
    use crate::transform::Transformer;
    use crate::types::FactSpec;
    use crate::writer::insert_fact;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        dir: tempfile::TempDir,
        blacklist: Arc<Blacklist>,
        transformer: Arc<Transformer>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("facts.db");
            let _db = Database::open(&path).unwrap();
            let registry = Arc::new(
                Registry::open(&path, Arc::new(RhaiEngine::new()), Arc::new(NoopMetrics)).unwrap(),
            );
            Self {
                dir,
                blacklist: Arc::new(Blacklist::new()),
                transformer: Arc::new(Transformer::new(registry, 16, None, Arc::new(NoopMetrics))),
            }
        }

        fn path(&self) -> std::path::PathBuf {
            self.dir.path().join("facts.db")
        }

        fn insert(&self, ns: &str, n: usize) -> Vec<Fact> {
            let conn = open_session(&self.path()).unwrap();
            (0..n)
                .map(|i| {
                    let fact = Fact::builder(ns, "Happened")
                        .payload(json!({"i": i}))
                        .build()
                        .unwrap();
                    let serial = insert_fact(&conn, &fact, 0).unwrap();
                    fact.with_serial(serial)
                })
                .collect()
        }

        fn pipeline(&self, specs: &[FactSpec]) -> DeliveryPipeline {
            let matcher = SpecMatcher::new(specs, &RhaiEngine::new()).unwrap();
            DeliveryPipeline::new(matcher, self.blacklist.clone(), self.transformer.clone(), false, "test")
        }
    }

    fn serials(facts: &[Fact]) -> Vec<u64> {
        facts.iter().map(|f| f.serial().unwrap().as_raw()).collect()
    }

    #[test]
    fn test_chunked_scan_is_ordered_and_filtered() {
        let fx = Fixture::new();
        fx.insert("orders", 3);
        fx.insert("users", 1);
        fx.insert("orders", 2);

        let specs = [FactSpec::ns("orders")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);
        let metrics = CounterMetrics::new();

        let mut delivered = Vec::new();
        let outcome = CatchupScan {
            filter: &filter,
            after: Serial::ZERO,
            chunk_size: 2,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &metrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            delivered.push(fact);
            true
        })
        .unwrap();

        assert_eq!(serials(&delivered), vec![1, 2, 3, 5, 6]);
        assert_eq!(outcome.high_water, Serial::from_raw(6));
        assert_eq!(outcome.last_delivered, Some(Serial::from_raw(6)));
        assert!(!outcome.cancelled);
        assert_eq!(metrics.snapshot()[CATCHUP_DURATION].count, 1);
    }

    #[test]
    fn test_start_position_is_exclusive() {
        let fx = Fixture::new();
        fx.insert("orders", 4);

        let specs = [FactSpec::ns("orders")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);

        let mut delivered = Vec::new();
        CatchupScan {
            filter: &filter,
            after: Serial::from_raw(2),
            chunk_size: 10,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &NoopMetrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            delivered.push(fact);
            true
        })
        .unwrap();

        assert_eq!(serials(&delivered), vec![3, 4]);
    }

    #[test]
    fn test_snapshot_ignores_concurrent_writes() {
        let fx = Fixture::new();
        fx.insert("orders", 3);

        let specs = [FactSpec::ns("orders")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);

        let mut delivered = Vec::new();
        let outcome = CatchupScan {
            filter: &filter,
            after: Serial::ZERO,
            chunk_size: 1,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &NoopMetrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            if delivered.is_empty() {
                fx.insert("orders", 1);
            }
            delivered.push(fact);
            true
        })
        .unwrap();

        assert_eq!(serials(&delivered), vec![1, 2, 3]);
        assert_eq!(outcome.high_water, Serial::from_raw(3));
    }

    #[test]
    fn test_blacklist_refresh_applies_mid_scan() {
        let fx = Fixture::new();
        let facts = fx.insert("orders", 3);

        let specs = [FactSpec::ns("orders")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);

        let mut delivered = Vec::new();
        CatchupScan {
            filter: &filter,
            after: Serial::ZERO,
            chunk_size: 1,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &NoopMetrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            fx.blacklist.replace([facts[2].id()].into_iter().collect());
            delivered.push(fact);
            true
        })
        .unwrap();

        assert_eq!(serials(&delivered), vec![1, 2]);
    }

    #[test]
    fn test_cancellation_stops_delivery() {
        let fx = Fixture::new();
        fx.insert("orders", 5);

        let specs = [FactSpec::ns("orders")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);

        let mut delivered = Vec::new();
        let outcome = CatchupScan {
            filter: &filter,
            after: Serial::ZERO,
            chunk_size: 2,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &NoopMetrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            delivered.push(fact);
            cancel.store(true, Ordering::Release);
            true
        })
        .unwrap();

        assert_eq!(delivered.len(), 1);
        assert!(outcome.cancelled);
        assert_eq!(outcome.last_delivered, Some(Serial::FIRST));
    }

    #[test]
    fn test_script_predicates_filter_after_pushdown() {
        let fx = Fixture::new();
        fx.insert("orders", 4);

        let specs = [FactSpec::ns("orders").filter_script("payload.i % 2 == 1")];
        let filter = SqlFilter::from_specs(&specs);
        let pipeline = fx.pipeline(&specs);
        let cancel = AtomicBool::new(false);

        let mut delivered = Vec::new();
        let outcome = CatchupScan {
            filter: &filter,
            after: Serial::ZERO,
            chunk_size: 3,
            pipeline: &pipeline,
            cancel: &cancel,
            metrics: &NoopMetrics,
            label: "test",
        }
        .run(&fx.path(), |fact| {
            delivered.push(fact);
            true
        })
        .unwrap();

        assert_eq!(serials(&delivered), vec![2, 4]);
        assert_eq!(outcome.high_water, Serial::from_raw(4));
    }
}
