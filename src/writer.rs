//! # Fact Writer with Group Commit
//!
//! Every write goes through one dedicated thread that owns the only
//! read-write fact connection. Publish requests arriving within a short
//! window are committed together in a single SQLite transaction, each inside
//! its own SAVEPOINT:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ pub1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ pub2 → BEGIN → COMMIT    │     │   SAVEPOINT item_0       │
//! │ pub3 → BEGIN → COMMIT    │     │   SAVEPOINT item_1       │
//! │ ...                      │     │   SAVEPOINT item_2       │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! - A publish request is atomic: all of its facts are written or none are
//! - A failing request (duplicate fact id, consumed token) is rolled back to
//!   its savepoint; the other requests of the batch are unaffected
//! - A conditional publish compares the captured aggregate state with the
//!   current one and writes inside the same savepoint, so nothing can slip in
//!   between check and write
//!
//! ## Serials
//!
//! `facts.serial` is an AUTOINCREMENT rowid, so serials follow commit order
//! and are never reused. A single writer thread means serial order equals
//! publish order.
//!
//! ## Notifications
//!
//! After a successful COMMIT the writer broadcasts
//! [`Notification::FactsCommitted`]. Follow subscriptions treat it as a
//! wake-up signal only and always re-query the database. Blacklist changes
//! broadcast [`Notification::BlacklistChanged`].

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::{build_header, current_time_ms, encode_meta};
use crate::error::{Error, Result};
use crate::reader::load_state;
use crate::types::{AggregateState, Fact, PublishResult, Serial, StateToken};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Publish requests are collected for up to this duration before being
/// committed. Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum publish requests per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Size of the request channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Capacity of the notification channel. Lagging receivers only lose
/// wake-ups, never facts.
const NOTIFICATION_CAPACITY: usize = 1024;

/// Configuration for the writer thread.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for more requests before committing a batch.
    pub batch_timeout: Duration,

    /// Maximum publish requests per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Change signal broadcast by the writer after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    /// Facts up to `last_serial` are durable.
    FactsCommitted { last_serial: Serial },
    /// The blacklist table changed.
    BlacklistChanged,
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer thread.
pub(crate) enum WriteRequest {
    /// Unconditional publish (batched).
    Publish {
        facts: Vec<Fact>,
        response: oneshot::Sender<Result<PublishResult>>,
    },

    /// Publish only if the token's aggregates are unchanged (batched).
    ///
    /// Responds `Ok(None)` when the state moved on; the token is kept.
    PublishIfUnchanged {
        token: StateToken,
        facts: Vec<Fact>,
        response: oneshot::Sender<Result<Option<PublishResult>>>,
    },

    /// Captures the current aggregate state under a new token.
    AcquireToken {
        ns: String,
        aggregate_ids: Vec<Uuid>,
        response: oneshot::Sender<Result<(StateToken, AggregateState)>>,
    },

    /// Discards a token. Unknown tokens are ignored.
    Invalidate {
        token: StateToken,
        response: oneshot::Sender<Result<()>>,
    },

    BlacklistAdd {
        id: Uuid,
        reason: Option<String>,
        response: oneshot::Sender<Result<()>>,
    },

    BlacklistRemove {
        id: Uuid,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Deletes tokens created before `older_than_ms`.
    PurgeTokens {
        older_than_ms: u64,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Commits the pending batch and stops the thread.
    Shutdown,
}

/// Work of one batched request, without its response channel.
enum BatchWork {
    Publish(Vec<Fact>),
    Conditional { token: StateToken, facts: Vec<Fact> },
}

enum BatchResponse {
    Publish(oneshot::Sender<Result<PublishResult>>),
    Conditional(oneshot::Sender<Result<Option<PublishResult>>>),
}

/// Outcome of one batched request. `None` for a conditional publish whose
/// state moved on.
type BatchResult = Result<Option<PublishResult>>;

// =============================================================================
// Row Insertion
// =============================================================================

/// Inserts one fact with its aggregate and meta index rows.
///
/// Returns the assigned serial.
///
/// # Errors
///
/// `Error::DuplicateFactId` if the id is already stored (including earlier
/// in the current transaction).
pub(crate) fn insert_fact(conn: &Connection, fact: &Fact, created_ms: u64) -> Result<Serial> {
    let id = fact.id().to_string();
    if conn
        .prepare_cached("SELECT 1 FROM facts WHERE id = ?")?
        .exists([&id])?
    {
        return Err(Error::DuplicateFactId(fact.id()));
    }

    let header = build_header(
        fact.id(),
        fact.ns(),
        fact.fact_type(),
        fact.version(),
        fact.aggregate_ids(),
        fact.meta(),
        None,
    );
    conn.prepare_cached(
        "INSERT INTO facts (id, ns, type, version, header, meta, payload, created_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        id,
        fact.ns(),
        fact.fact_type(),
        fact.version(),
        header.to_string(),
        encode_meta(fact.meta())?,
        fact.payload().to_string(),
        created_ms as i64,
    ])?;
    let serial = conn.last_insert_rowid();

    let mut aggregates =
        conn.prepare_cached("INSERT INTO fact_aggregates (serial, aggregate_id) VALUES (?, ?)")?;
    for aggregate_id in fact.aggregate_ids() {
        aggregates.execute(params![serial, aggregate_id.to_string()])?;
    }

    let mut meta = conn
        .prepare_cached("INSERT INTO fact_meta (serial, key, value, ordinal) VALUES (?, ?, ?, ?)")?;
    for (ordinal, (key, value)) in fact.meta().iter().enumerate() {
        meta.execute(params![serial, key, value, ordinal as i64])?;
    }

    Ok(Serial::from_raw(serial as u64))
}

// =============================================================================
// Fact Writer
// =============================================================================

/// The writer state owned by the writer thread.
///
/// Use [`WriterHandle`] to interact with it from async code.
pub(crate) struct FactWriter {
    conn: Connection,
    notifications: broadcast::Sender<Notification>,
}

impl FactWriter {
    pub(crate) fn new(conn: Connection, notifications: broadcast::Sender<Notification>) -> Self {
        Self {
            conn,
            notifications,
        }
    }

    fn notify(&self, notification: Notification) {
        // No receivers is fine: nobody is following.
        let _ = self.notifications.send(notification);
    }

    // =========================================================================
    // Batched Publishing
    // =========================================================================

    /// Executes a batch of publish requests in one transaction.
    fn execute_batch(&mut self, items: Vec<(BatchWork, BatchResponse)>) {
        let size = items.len();
        let (work, responses): (Vec<_>, Vec<_>) = items.into_iter().unzip();

        match self.execute_batch_inner(work) {
            Ok(results) => {
                let last_serial = results
                    .iter()
                    .filter_map(|r| r.as_ref().ok().and_then(|p| p.as_ref()))
                    .map(|p| p.last_serial)
                    .max();

                for (response, result) in responses.into_iter().zip(results) {
                    match response {
                        BatchResponse::Publish(sender) => {
                            let result = result.and_then(|published| {
                                published.ok_or_else(|| {
                                    Error::Internal("publish produced no result".to_string())
                                })
                            });
                            let _ = sender.send(result);
                        }
                        BatchResponse::Conditional(sender) => {
                            let _ = sender.send(result);
                        }
                    }
                }

                if let Some(last_serial) = last_serial {
                    debug!(requests = size, %last_serial, "batch committed");
                    self.notify(Notification::FactsCommitted { last_serial });
                }
            }
            Err(e) => {
                error!(requests = size, error = %e, "batch commit failed");
                let message = format!("batch commit failed: {e}");
                for response in responses {
                    match response {
                        BatchResponse::Publish(sender) => {
                            let _ = sender.send(Err(Error::Internal(message.clone())));
                        }
                        BatchResponse::Conditional(sender) => {
                            let _ = sender.send(Err(Error::Internal(message.clone())));
                        }
                    }
                }
            }
        }
    }

    /// Runs every item in its own SAVEPOINT inside one outer transaction.
    fn execute_batch_inner(&mut self, work: Vec<BatchWork>) -> Result<Vec<BatchResult>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let now_ms = current_time_ms();
        let mut results = Vec::with_capacity(work.len());
        for (index, item) in work.into_iter().enumerate() {
            let savepoint = format!("item_{index}");
            let result = self.in_savepoint(&savepoint, |conn| match item {
                BatchWork::Publish(facts) => insert_facts(conn, &facts, now_ms).map(Some),
                BatchWork::Conditional { token, facts } => {
                    publish_if_unchanged(conn, token, &facts, now_ms)
                }
            });
            match result {
                Ok(result) => results.push(result),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    /// Runs `f` inside a SAVEPOINT.
    ///
    /// The outer `Result` fails only if the savepoint itself could not be
    /// managed; the inner one is the item's own outcome.
    fn in_savepoint<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<Result<T>> {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(Ok(value))
            }
            Err(e) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Ok(Err(e))
            }
        }
    }

    // =========================================================================
    // Immediate Operations
    // =========================================================================

    fn acquire_token(&mut self, ns: &str, aggregate_ids: &[Uuid]) -> Result<(StateToken, AggregateState)> {
        let state = load_state(&self.conn, ns, aggregate_ids)?;
        let token = StateToken::new();
        self.conn.execute(
            "INSERT INTO state_tokens (token, ns, state, created_ms) VALUES (?, ?, ?, ?)",
            params![
                token.to_string(),
                ns,
                serde_json::to_string(&state)?,
                current_time_ms() as i64,
            ],
        )?;
        Ok((token, state))
    }

    fn invalidate(&mut self, token: StateToken) -> Result<()> {
        self.conn.execute(
            "DELETE FROM state_tokens WHERE token = ?",
            [token.to_string()],
        )?;
        Ok(())
    }

    fn blacklist_add(&mut self, id: Uuid, reason: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO blacklist (id, reason, created_ms) VALUES (?, ?, ?)",
            params![id.to_string(), reason, current_time_ms() as i64],
        )?;
        warn!(fact_id = %id, reason = reason.unwrap_or("-"), "fact blacklisted");
        self.notify(Notification::BlacklistChanged);
        Ok(())
    }

    fn blacklist_remove(&mut self, id: Uuid) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM blacklist WHERE id = ?", [id.to_string()])?;
        if removed > 0 {
            self.notify(Notification::BlacklistChanged);
        }
        Ok(removed > 0)
    }

    fn purge_tokens(&mut self, older_than_ms: u64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM state_tokens WHERE created_ms < ?",
            [older_than_ms as i64],
        )?;
        Ok(removed)
    }
}

/// Inserts a publish request's facts in order.
fn insert_facts(conn: &Connection, facts: &[Fact], now_ms: u64) -> Result<PublishResult> {
    let (first, rest) = facts
        .split_first()
        .ok_or_else(|| Error::InvalidFact("nothing to publish".to_string()))?;

    let first_serial = insert_fact(conn, first, now_ms)?;
    let mut last_serial = first_serial;
    for fact in rest {
        last_serial = insert_fact(conn, fact, now_ms)?;
    }

    let last_fact_id = facts.last().map(Fact::id).unwrap_or_else(|| first.id());
    Ok(PublishResult {
        first_serial,
        last_serial,
        last_fact_id,
    })
}

/// Writes `facts` if the token's captured state still holds, consuming it.
fn publish_if_unchanged(
    conn: &Connection,
    token: StateToken,
    facts: &[Fact],
    now_ms: u64,
) -> Result<Option<PublishResult>> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT state FROM state_tokens WHERE token = ?",
            [token.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(stored) = stored else {
        return Err(Error::InvalidStateToken(token.as_uuid()));
    };

    let captured: AggregateState = serde_json::from_str(&stored)?;
    let aggregate_ids: Vec<Uuid> = captured.heads.keys().copied().collect();
    let current = load_state(conn, &captured.ns, &aggregate_ids)?;
    if current != captured {
        debug!(%token, ns = %captured.ns, "state changed since token was acquired");
        return Ok(None);
    }

    let published = insert_facts(conn, facts, now_ms)?;
    conn.execute(
        "DELETE FROM state_tokens WHERE token = ?",
        [token.to_string()],
    )?;
    Ok(Some(published))
}

// =============================================================================
// Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the writer thread.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
    notifications: broadcast::Sender<Notification>,
    thread: std::sync::Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WriterHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Closed("writer has shut down".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Closed("writer dropped response".to_string()))?
    }

    pub(crate) async fn publish(&self, facts: Vec<Fact>) -> Result<PublishResult> {
        self.call(|response| WriteRequest::Publish { facts, response })
            .await
    }

    pub(crate) async fn publish_if_unchanged(
        &self,
        token: StateToken,
        facts: Vec<Fact>,
    ) -> Result<Option<PublishResult>> {
        self.call(|response| WriteRequest::PublishIfUnchanged {
            token,
            facts,
            response,
        })
        .await
    }

    pub(crate) async fn acquire_token(
        &self,
        ns: String,
        aggregate_ids: Vec<Uuid>,
    ) -> Result<(StateToken, AggregateState)> {
        self.call(|response| WriteRequest::AcquireToken {
            ns,
            aggregate_ids,
            response,
        })
        .await
    }

    pub(crate) async fn invalidate(&self, token: StateToken) -> Result<()> {
        self.call(|response| WriteRequest::Invalidate { token, response })
            .await
    }

    pub(crate) async fn blacklist_add(&self, id: Uuid, reason: Option<String>) -> Result<()> {
        self.call(|response| WriteRequest::BlacklistAdd {
            id,
            reason,
            response,
        })
        .await
    }

    pub(crate) async fn blacklist_remove(&self, id: Uuid) -> Result<bool> {
        self.call(|response| WriteRequest::BlacklistRemove { id, response })
            .await
    }

    pub(crate) async fn purge_tokens(&self, older_than_ms: u64) -> Result<usize> {
        self.call(|response| WriteRequest::PurgeTokens {
            older_than_ms,
            response,
        })
        .await
    }

    /// Receiver of commit notifications.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Commits the pending batch, stops the thread and waits for it.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            error!("writer thread panicked");
        }
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop: collects publish requests into batches and executes
/// immediate requests after committing whatever is pending.
pub(crate) async fn run_fact_writer(
    mut writer: FactWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<(BatchWork, BatchResponse)> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        let request = match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
                break;
            }
            Err(_) => {
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
                batch_start = None;
                continue;
            }
        };

        let (work, response) = match request {
            WriteRequest::Publish { facts, response } => {
                (BatchWork::Publish(facts), BatchResponse::Publish(response))
            }
            WriteRequest::PublishIfUnchanged {
                token,
                facts,
                response,
            } => (
                BatchWork::Conditional { token, facts },
                BatchResponse::Conditional(response),
            ),
            WriteRequest::Shutdown => {
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
                break;
            }
            immediate => {
                // Immediate requests observe every previously accepted publish.
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                    batch_start = None;
                }
                execute_immediate(&mut writer, immediate);
                continue;
            }
        };

        if batch.is_empty() {
            batch_start = Some(Instant::now());
        }
        batch.push((work, response));
        if batch.len() >= config.batch_max_size {
            writer.execute_batch(std::mem::take(&mut batch));
            batch_start = None;
        }
    }

    debug!("writer stopped");
}

fn execute_immediate(writer: &mut FactWriter, request: WriteRequest) {
    match request {
        WriteRequest::AcquireToken {
            ns,
            aggregate_ids,
            response,
        } => {
            let _ = response.send(writer.acquire_token(&ns, &aggregate_ids));
        }
        WriteRequest::Invalidate { token, response } => {
            let _ = response.send(writer.invalidate(token));
        }
        WriteRequest::BlacklistAdd {
            id,
            reason,
            response,
        } => {
            let _ = response.send(writer.blacklist_add(id, reason.as_deref()));
        }
        WriteRequest::BlacklistRemove { id, response } => {
            let _ = response.send(writer.blacklist_remove(id));
        }
        WriteRequest::PurgeTokens {
            older_than_ms,
            response,
        } => {
            let _ = response.send(writer.purge_tokens(older_than_ms));
        }
        WriteRequest::Publish { .. }
        | WriteRequest::PublishIfUnchanged { .. }
        | WriteRequest::Shutdown => {
            unreachable!("batched requests are handled by the writer loop")
        }
    }
}

/// Spawns the writer on a dedicated thread with its own runtime.
pub(crate) fn spawn_fact_writer(conn: Connection, config: WriterConfig) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("failed to create writer runtime: {e}")))?;
    let writer = FactWriter::new(conn, notifications.clone());

    let thread = std::thread::Builder::new()
        .name("factdb-writer".to_string())
        .spawn(move || runtime.block_on(run_fact_writer(writer, rx, config)))
        .map_err(|e| Error::Internal(format!("failed to spawn writer thread: {e}")))?;

    Ok(WriterHandle {
        tx,
        notifications,
        thread: std::sync::Arc::new(Mutex::new(Some(thread))),
    })
}

// =============================================================================
// Tests
// =============================================================================
