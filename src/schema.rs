//! # SQLite Schema for FactDB
//!
//! This module defines the database schema and opens connections to it. The
//! crate owns its DDL; there are no migrations, a database written by a
//! different schema version is refused.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  facts                     fact_aggregates        fact_meta             │
//! │  ┌──────────────────┐      ┌──────────────┐       ┌──────────────┐      │
//! │  │ serial (PK)      │◄─────│ serial       │       │ serial ──────┼──┐   │
//! │  │ id (UNIQUE)      │      │ aggregate_id │       │ key, value   │  │   │
//! │  │ ns, type, version│      └──────────────┘       └──────────────┘  │   │
//! │  │ header, payload  │◄──────────────────────────────────────────────┘   │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! │  blacklist        state_tokens      schema_store    transformation_store│
//! │  ┌──────────┐     ┌───────────┐     ┌──────────┐    ┌──────────────┐    │
//! │  │ id (PK)  │     │ token (PK)│     │ id (PK)  │    │ id (PK)      │    │
//! │  │ reason   │     │ ns, state │     │ hash     │    │ hash, code   │    │
//! │  └──────────┘     └───────────┘     └──────────┘    └──────────────┘    │
//! │                                                                         │
//! │  transformation_cache (fact_id, version, chain_id) → payload            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why side tables for aggregates and meta?
//!
//! `fact_aggregates` and `fact_meta` exist only so that catchup and follow
//! can push aggregate and meta constraints into SQL (`EXISTS` subqueries on
//! indexed columns). The fact row itself keeps the full, ordered lists in its
//! `header` and `meta` columns, so reading a fact never joins.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Opening a database with another version fails.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits for a competing writer before `SQLITE_BUSY`.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The `facts` table: one row per published fact.
///
/// # Columns
///
/// - `serial`: AUTOINCREMENT so a serial is never reused, even after the
///   highest row is removed by hand
/// - `id`: fact UUID, unique across the store
/// - `header`: header JSON without the serial (the serial is added on read)
/// - `meta`: ordered `[[key, value], ...]` pairs, kept verbatim
/// - `payload`: payload JSON at the stored `version`
const CREATE_FACTS: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    serial     INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    ns         TEXT NOT NULL,
    type       TEXT NOT NULL,
    version    INTEGER NOT NULL,
    header     TEXT NOT NULL,
    meta       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_ms INTEGER NOT NULL
)
"#;

/// Namespace/type lookups for catchup snapshots and enumeration.
const CREATE_FACTS_NS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS facts_ns_type
ON facts(ns, type, serial)
"#;

/// One row per (fact, aggregate id).
const CREATE_FACT_AGGREGATES: &str = r#"
CREATE TABLE IF NOT EXISTS fact_aggregates (
    serial       INTEGER NOT NULL,
    aggregate_id TEXT NOT NULL,
    PRIMARY KEY (serial, aggregate_id)
)
"#;

/// Supports both `EXISTS` pushdown and "last fact of aggregate" lookups.
const CREATE_FACT_AGGREGATES_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS fact_aggregates_by_id
ON fact_aggregates(aggregate_id, serial)
"#;

/// One row per meta entry. `ordinal` preserves insertion order.
const CREATE_FACT_META: &str = r#"
CREATE TABLE IF NOT EXISTS fact_meta (
    serial  INTEGER NOT NULL,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (serial, ordinal)
)
"#;

const CREATE_FACT_META_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS fact_meta_by_key
ON fact_meta(key, value, serial)
"#;

/// Suppressed fact ids. Rows are never merged into memory incrementally; the
/// whole table is re-read on every change signal.
const CREATE_BLACKLIST: &str = r#"
CREATE TABLE IF NOT EXISTS blacklist (
    id         TEXT PRIMARY KEY,
    reason     TEXT,
    created_ms INTEGER NOT NULL
)
"#;

/// Outstanding optimistic-lock tokens and the state they captured (JSON).
const CREATE_STATE_TOKENS: &str = r#"
CREATE TABLE IF NOT EXISTS state_tokens (
    token      TEXT PRIMARY KEY,
    ns         TEXT NOT NULL,
    state      TEXT NOT NULL,
    created_ms INTEGER NOT NULL
)
"#;

/// Registered JSON schemas, keyed by `ns/type/version`.
const CREATE_SCHEMA_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_store (
    id      TEXT PRIMARY KEY,
    hash    TEXT NOT NULL,
    ns      TEXT NOT NULL,
    type    TEXT NOT NULL,
    version INTEGER NOT NULL,
    schema  TEXT NOT NULL,
    UNIQUE (ns, type, version)
)
"#;

/// Registered transformation scripts, one per directed version edge.
const CREATE_TRANSFORMATION_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS transformation_store (
    id           TEXT PRIMARY KEY,
    hash         TEXT NOT NULL,
    ns           TEXT NOT NULL,
    type         TEXT NOT NULL,
    from_version INTEGER NOT NULL,
    to_version   INTEGER NOT NULL,
    code         TEXT NOT NULL,
    UNIQUE (ns, type, from_version, to_version)
)
"#;

/// Durable tier of the transformation cache.
///
/// `chain_id` embeds every step hash, so re-registering a transformation makes
/// old rows unreachable instead of stale. The sweep removes them by age.
const CREATE_TRANSFORMATION_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS transformation_cache (
    fact_id        TEXT NOT NULL,
    version        INTEGER NOT NULL,
    chain_id       TEXT NOT NULL,
    payload        TEXT NOT NULL,
    last_access_ms INTEGER NOT NULL,
    PRIMARY KEY (fact_id, version, chain_id)
)
"#;

const CREATE_TRANSFORMATION_CACHE_ACCESS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS transformation_cache_access
ON transformation_cache(last_access_ms)
"#;

/// Key/value metadata, currently only the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS factdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the FactDB schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`; [`into_connection`](Self::into_connection)
/// hands it to the writer thread, which then is its only user.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use factdb::Database;
    ///
    /// let db = Database::open("facts.db")?;
    /// # Ok::<(), factdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database (unit tests of single-connection code).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL lets the reader pool and catchup sessions read while the writer commits.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_FACTS)?;
        self.conn.execute_batch(CREATE_FACTS_NS_INDEX)?;
        self.conn.execute_batch(CREATE_FACT_AGGREGATES)?;
        self.conn.execute_batch(CREATE_FACT_AGGREGATES_INDEX)?;
        self.conn.execute_batch(CREATE_FACT_META)?;
        self.conn.execute_batch(CREATE_FACT_META_INDEX)?;
        self.conn.execute_batch(CREATE_BLACKLIST)?;
        self.conn.execute_batch(CREATE_STATE_TOKENS)?;
        self.conn.execute_batch(CREATE_SCHEMA_STORE)?;
        self.conn.execute_batch(CREATE_TRANSFORMATION_STORE)?;
        self.conn.execute_batch(CREATE_TRANSFORMATION_CACHE)?;
        self.conn.execute_batch(CREATE_TRANSFORMATION_CACHE_ACCESS_INDEX)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM factdb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO factdb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, this FactDB requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Connection Helpers
// =============================================================================

/// Opens a read-only connection for a pooled reader thread.
pub(crate) fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Opens a read-write connection to an already initialized database.
///
/// Used by catchup sessions (temp tables need a writable connection) and by
/// the registry and durable cache, which write outside the fact writer.
pub(crate) fn open_session(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA temp_store = MEMORY")?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
