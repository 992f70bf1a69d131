//! # Fact Reader
//!
//! Point lookups, follow re-queries and state snapshots run on a pool of
//! reader threads, each owning a read-only SQLite connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                 shared request channel                           │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! Threads compete for the shared receiver; whichever is idle takes the next
//! request. Every query goes straight to SQL, so readers always see the
//! latest commit of the writer thread.
//!
//! The query functions are plain `fn(&Connection, ..)` so the writer and the
//! catchup sessions reuse them on their own connections.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use crate::blacklist::load_blacklist;
use crate::codec::{fact_from_row, parse_uuid, FACT_COLUMNS};
use crate::error::{Error, Result};
use crate::matcher::SqlFilter;
use crate::schema::open_read_only;
use crate::types::{AggregateState, Fact, Serial};

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

// =============================================================================
// Query Functions
// =============================================================================

/// Loads a fact by id.
pub(crate) fn fetch_by_id(conn: &Connection, id: Uuid) -> Result<Option<Fact>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {FACT_COLUMNS} FROM facts f WHERE f.id = ?"
    ))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(fact_from_row(row)?)),
        None => Ok(None),
    }
}

/// Loads a fact by serial.
pub(crate) fn fetch_by_serial(conn: &Connection, serial: Serial) -> Result<Option<Fact>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {FACT_COLUMNS} FROM facts f WHERE f.serial = ?"
    ))?;
    let mut rows = stmt.query([serial.as_sql()])?;
    match rows.next()? {
        Some(row) => Ok(Some(fact_from_row(row)?)),
        None => Ok(None),
    }
}

/// Loads facts by serial, ascending. Serials without a row are skipped.
pub(crate) fn fetch_serials(conn: &Connection, serials: &[i64]) -> Result<Vec<Fact>> {
    if serials.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; serials.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM facts f WHERE f.serial IN ({placeholders}) ORDER BY f.serial"
    ))?;
    let mut rows = stmt.query(params_from_iter(serials.iter()))?;

    let mut facts = Vec::with_capacity(serials.len());
    while let Some(row) = rows.next()? {
        facts.push(fact_from_row(row)?);
    }
    Ok(facts)
}

/// Returns the serial of a fact id.
pub(crate) fn serial_of(conn: &Connection, id: Uuid) -> Result<Option<Serial>> {
    let serial: Option<i64> = conn
        .query_row(
            "SELECT serial FROM facts WHERE id = ?",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(serial.map(|s| Serial::from_raw(s as u64)))
}

/// Returns the highest serial, `None` for an empty store.
pub(crate) fn latest_serial(conn: &Connection) -> Result<Option<Serial>> {
    let serial: Option<i64> = conn.query_row("SELECT MAX(serial) FROM facts", [], |row| row.get(0))?;
    Ok(serial.map(|s| Serial::from_raw(s as u64)))
}

/// Distinct namespaces, sorted.
pub(crate) fn enumerate_namespaces(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT ns FROM facts ORDER BY ns")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// Distinct types in a namespace, sorted.
pub(crate) fn enumerate_types(conn: &Connection, ns: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT type FROM facts WHERE ns = ? ORDER BY type")?;
    let rows = stmt.query_map([ns], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// Facts with `serial > after` matching `filter`, ascending, at most `limit`.
pub(crate) fn facts_after(
    conn: &Connection,
    filter: &SqlFilter,
    after: Serial,
    limit: usize,
) -> Result<Vec<Fact>> {
    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM facts f WHERE f.serial > ? AND {} ORDER BY f.serial LIMIT ?",
        filter.clause
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let mut values = Vec::with_capacity(filter.params.len() + 2);
    values.push(rusqlite::types::Value::Integer(after.as_sql()));
    values.extend(filter.params.iter().cloned());
    values.push(rusqlite::types::Value::Integer(limit as i64));

    let mut rows = stmt.query(params_from_iter(values))?;
    let mut facts = Vec::new();
    while let Some(row) = rows.next()? {
        facts.push(fact_from_row(row)?);
    }
    Ok(facts)
}

/// Captures the last fact id per aggregate in `ns`.
///
/// With no aggregate ids the snapshot is the last fact id of the namespace.
pub(crate) fn load_state(
    conn: &Connection,
    ns: &str,
    aggregate_ids: &[Uuid],
) -> Result<AggregateState> {
    let mut state = AggregateState {
        ns: ns.to_string(),
        heads: Default::default(),
        namespace_head: None,
    };

    if aggregate_ids.is_empty() {
        let head: Option<String> = conn
            .query_row(
                "SELECT id FROM facts WHERE ns = ? ORDER BY serial DESC LIMIT 1",
                [ns],
                |row| row.get(0),
            )
            .optional()?;
        state.namespace_head = head.as_deref().map(parse_uuid).transpose()?;
        return Ok(state);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT f.id FROM fact_aggregates a
         JOIN facts f ON f.serial = a.serial
         WHERE a.aggregate_id = ? AND f.ns = ?
         ORDER BY a.serial DESC
         LIMIT 1",
    )?;
    for aggregate_id in aggregate_ids {
        let head: Option<String> = stmt
            .query_row(params![aggregate_id.to_string(), ns], |row| row.get(0))
            .optional()?;
        state
            .heads
            .insert(*aggregate_id, head.as_deref().map(parse_uuid).transpose()?);
    }
    Ok(state)
}

// =============================================================================
// Request Types
// =============================================================================

/// Request handled by a pooled reader thread.
pub(crate) enum ReadRequest {
    FetchById {
        id: Uuid,
        response: oneshot::Sender<Result<Option<Fact>>>,
    },
    FetchBySerial {
        serial: Serial,
        response: oneshot::Sender<Result<Option<Fact>>>,
    },
    SerialOf {
        id: Uuid,
        response: oneshot::Sender<Result<Option<Serial>>>,
    },
    LatestSerial {
        response: oneshot::Sender<Result<Option<Serial>>>,
    },
    EnumerateNamespaces {
        response: oneshot::Sender<Result<Vec<String>>>,
    },
    EnumerateTypes {
        ns: String,
        response: oneshot::Sender<Result<Vec<String>>>,
    },
    FactsAfter {
        filter: Arc<SqlFilter>,
        after: Serial,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Fact>>>,
    },
    StateFor {
        ns: String,
        aggregate_ids: Vec<Uuid>,
        response: oneshot::Sender<Result<AggregateState>>,
    },
    LoadBlacklist {
        response: oneshot::Sender<Result<std::collections::HashSet<Uuid>>>,
    },
    Shutdown,
}

/// Executes one request. Returns false on shutdown.
fn handle_request(conn: &Connection, request: ReadRequest) -> bool {
    match request {
        ReadRequest::FetchById { id, response } => {
            let _ = response.send(fetch_by_id(conn, id));
        }
        ReadRequest::FetchBySerial { serial, response } => {
            let _ = response.send(fetch_by_serial(conn, serial));
        }
        ReadRequest::SerialOf { id, response } => {
            let _ = response.send(serial_of(conn, id));
        }
        ReadRequest::LatestSerial { response } => {
            let _ = response.send(latest_serial(conn));
        }
        ReadRequest::EnumerateNamespaces { response } => {
            let _ = response.send(enumerate_namespaces(conn));
        }
        ReadRequest::EnumerateTypes { ns, response } => {
            let _ = response.send(enumerate_types(conn, &ns));
        }
        ReadRequest::FactsAfter {
            filter,
            after,
            limit,
            response,
        } => {
            let _ = response.send(facts_after(conn, &filter, after, limit));
        }
        ReadRequest::StateFor {
            ns,
            aggregate_ids,
            response,
        } => {
            let _ = response.send(load_state(conn, &ns, &aggregate_ids));
        }
        ReadRequest::LoadBlacklist { response } => {
            let _ = response.send(load_blacklist(conn));
        }
        ReadRequest::Shutdown => return false,
    }
    true
}

/// Pooled reader loop.
///
/// Threads compete to acquire the receiver lock; the winner blocks on the
/// channel, the others wait for the lock.
fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = rx.lock().blocking_recv();
        match request {
            Some(request) => {
                if !handle_request(&conn, request) {
                    break;
                }
            }
            None => break,
        }
    }
}

// =============================================================================
// Reader Pool
// =============================================================================

/// Async handle to the reader threads.
#[derive(Clone)]
pub(crate) struct ReaderPool {
    tx: mpsc::Sender<ReadRequest>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    size: usize,
}

impl ReaderPool {
    /// Spawns `threads` readers (CPU count clamped to 1..=16 if `None`).
    pub(crate) fn spawn(path: &Path, threads: Option<usize>) -> Result<Self> {
        let size = threads
            .unwrap_or_else(|| available_parallelism().map(|n| n.get()).unwrap_or(MIN_READ_THREADS))
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            // Open in the caller so a broken file fails `open` instead of a thread.
            let conn = open_read_only(path)?;
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("factdb-reader-{i}"))
                .spawn(move || run_reader_pooled(conn, rx))
                .map_err(|e| Error::Internal(format!("failed to spawn reader thread: {e}")))?;
            handles.push(handle);
        }
        debug!(threads = size, "reader pool started");

        Ok(Self {
            tx,
            handles: Arc::new(Mutex::new(handles)),
            size,
        })
    }

    /// Number of reader threads.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Closed("reader pool has shut down".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Closed("reader dropped response channel".to_string()))?
    }

    pub(crate) async fn fetch_by_id(&self, id: Uuid) -> Result<Option<Fact>> {
        self.call(|response| ReadRequest::FetchById { id, response }).await
    }

    pub(crate) async fn fetch_by_serial(&self, serial: Serial) -> Result<Option<Fact>> {
        self.call(|response| ReadRequest::FetchBySerial { serial, response })
            .await
    }

    pub(crate) async fn serial_of(&self, id: Uuid) -> Result<Option<Serial>> {
        self.call(|response| ReadRequest::SerialOf { id, response }).await
    }

    pub(crate) async fn latest_serial(&self) -> Result<Option<Serial>> {
        self.call(|response| ReadRequest::LatestSerial { response })
            .await
    }

    pub(crate) async fn enumerate_namespaces(&self) -> Result<Vec<String>> {
        self.call(|response| ReadRequest::EnumerateNamespaces { response })
            .await
    }

    pub(crate) async fn enumerate_types(&self, ns: String) -> Result<Vec<String>> {
        self.call(|response| ReadRequest::EnumerateTypes { ns, response })
            .await
    }

    pub(crate) async fn facts_after(
        &self,
        filter: Arc<SqlFilter>,
        after: Serial,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        self.call(|response| ReadRequest::FactsAfter {
            filter,
            after,
            limit,
            response,
        })
        .await
    }

    pub(crate) async fn state_for(
        &self,
        ns: String,
        aggregate_ids: Vec<Uuid>,
    ) -> Result<AggregateState> {
        self.call(|response| ReadRequest::StateFor {
            ns,
            aggregate_ids,
            response,
        })
        .await
    }

    pub(crate) async fn load_blacklist(&self) -> Result<std::collections::HashSet<Uuid>> {
        self.call(|response| ReadRequest::LoadBlacklist { response })
            .await
    }

    /// Stops every reader thread and waits for them.
    pub(crate) async fn shutdown(&self) {
        for _ in 0..self.size {
            let _ = self.tx.send(ReadRequest::Shutdown).await;
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    error!("reader thread panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            error!("failed to join reader threads");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
