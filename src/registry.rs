//! # Schema & Transformation Registry
//!
//! The registry stores two kinds of sources, both identified by an `id` and
//! fingerprinted by a content `hash`:
//!
//! - [`SchemaSource`]: a JSON schema for `(ns, type, version)`
//! - [`TransformationSource`]: a script turning `(ns, type)` payloads from
//!   `from_version` into `to_version`
//!
//! ## Conflict detection
//!
//! An id must always carry the same hash. Registering the same source twice
//! is a no-op; registering the same id with different content is rejected
//! with [`Error::SchemaConflict`] / [`Error::TransformationConflict`] and
//! logged at `error`. The `contains_*` checks always read the `schema_store`
//! and `transformation_store` tables (never only the near-cache) so a
//! disagreeing deployment is caught on the very next check.
//!
//! ## Chains
//!
//! Transformations are directed edges between versions. A
//! [`TransformationChain`] is the shortest path from the stored version to
//! the requested one (breadth-first, edges visited in ascending order so the
//! result is deterministic). Chains can go up and down:
//!
//! ```text
//!   1 ──► 2 ──► 3          request 1→3: [1→2, 2→3]
//!   1 ◄── 2 ◄── 3          request 3→1: [3→2, 2→1]
//! ```
//!
//! A chain's id is a hash over its step hashes, so changed registry content
//! produces a new chain id and old cache entries simply stop being hit.
//!
//! ## Near-cache
//!
//! Compiled validators, compiled transformation steps and resolved chains are
//! memoized. Every registration bumps a generation counter and clears the
//! chain memo; a chain resolved concurrently with a registration is not
//! memoized.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jsonschema::Validator;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::codec::{composite_hash, content_hash};
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, REGISTRY_CONFLICT};
use crate::schema::open_session;
use crate::script::{CompiledTransform, ScriptEngine};

// =============================================================================
// Sources
// =============================================================================

/// A JSON schema for one fact version.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSource {
    /// Registry id, `ns/type/version` unless set explicitly.
    pub id: String,
    /// Namespace.
    pub ns: String,
    /// Fact type.
    pub fact_type: String,
    /// Schema version this schema describes.
    pub version: u32,
    /// Hex SHA-256 of the schema text.
    pub hash: String,
    /// The JSON schema document.
    pub schema: Value,
}

impl SchemaSource {
    /// Creates a source with the conventional id and a content hash.
    pub fn new(
        ns: impl Into<String>,
        fact_type: impl Into<String>,
        version: u32,
        schema: Value,
    ) -> Self {
        let ns = ns.into();
        let fact_type = fact_type.into();
        Self {
            id: format!("{ns}/{fact_type}/{version}"),
            hash: content_hash(&schema.to_string()),
            ns,
            fact_type,
            version,
            schema,
        }
    }

    /// Overrides the registry id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// A single version-to-version transformation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationSource {
    /// Registry id, `ns/type/from-to` unless set explicitly.
    pub id: String,
    /// Namespace.
    pub ns: String,
    /// Fact type.
    pub fact_type: String,
    /// Version the script reads.
    pub from_version: u32,
    /// Version the script produces.
    pub to_version: u32,
    /// Hex SHA-256 of the script.
    pub hash: String,
    /// Script source; mutates `event` in place.
    pub code: String,
}

impl TransformationSource {
    /// Creates a source with the conventional id and a content hash.
    pub fn new(
        ns: impl Into<String>,
        fact_type: impl Into<String>,
        from_version: u32,
        to_version: u32,
        code: impl Into<String>,
    ) -> Self {
        let ns = ns.into();
        let fact_type = fact_type.into();
        let code = code.into();
        Self {
            id: format!("{ns}/{fact_type}/{from_version}-{to_version}"),
            hash: content_hash(&code),
            ns,
            fact_type,
            from_version,
            to_version,
            code,
        }
    }

    /// Overrides the registry id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

// =============================================================================
// Chains
// =============================================================================

struct ChainStep {
    id: String,
    transform: Arc<dyn CompiledTransform>,
}

/// Ordered transformation steps from one version to another.
pub struct TransformationChain {
    id: String,
    from_version: u32,
    to_version: u32,
    steps: Vec<ChainStep>,
}

impl TransformationChain {
    /// Stable id derived from the step hashes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version the chain starts at.
    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    /// Version the chain produces.
    pub fn to_version(&self) -> u32 {
        self.to_version
    }

    /// Ids of the steps, in application order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Runs every step in order.
    pub fn apply(&self, payload: Value) -> Result<Value> {
        self.steps
            .iter()
            .try_fold(payload, |document, step| step.transform.run(document))
    }
}

impl std::fmt::Debug for TransformationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationChain")
            .field("id", &self.id)
            .field("steps", &self.step_ids())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChainKey {
    ns: String,
    fact_type: String,
    from: u32,
    to: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SchemaKey {
    ns: String,
    fact_type: String,
    version: u32,
}

struct Edge {
    id: String,
    hash: String,
    from: u32,
    to: u32,
    code: String,
}

// =============================================================================
// Registry
// =============================================================================

/// Authoritative store of schemas and transformations with a compiled near-cache.
pub struct Registry {
    conn: Mutex<Connection>,
    engine: Arc<dyn ScriptEngine>,
    metrics: Arc<dyn MetricsSink>,
    validators: Mutex<HashMap<SchemaKey, Arc<Validator>>>,
    compiled: Mutex<HashMap<String, Arc<dyn CompiledTransform>>>,
    chains: Mutex<HashMap<ChainKey, Arc<TransformationChain>>>,
    generation: AtomicU64,
}

impl Registry {
    /// Opens a registry connection on an initialized database file.
    pub fn open(
        path: &Path,
        engine: Arc<dyn ScriptEngine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Ok(Self::new(open_session(path)?, engine, metrics))
    }

    /// Wraps an existing connection (schema must be initialized).
    pub fn new(
        conn: Connection,
        engine: Arc<dyn ScriptEngine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            engine,
            metrics,
            validators: Mutex::new(HashMap::new()),
            compiled: Mutex::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of registrations seen by this instance.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    /// Registers a schema.
    ///
    /// # Errors
    ///
    /// - `Error::SchemaConflict` if the id (or its version slot) is taken by
    ///   a different hash
    /// - `Error::Schema` if the document is not a usable JSON schema
    pub fn register_schema(&self, source: &SchemaSource) -> Result<()> {
        compile_schema(source)?;

        let conn = self.conn.lock();
        if self.check_schema(&conn, source)? {
            return Ok(());
        }

        conn.execute(
            "INSERT INTO schema_store (id, hash, ns, type, version, schema)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                source.id,
                source.hash,
                source.ns,
                source.fact_type,
                source.version,
                source.schema.to_string(),
            ],
        )?;
        drop(conn);

        self.validators.lock().remove(&SchemaKey {
            ns: source.ns.clone(),
            fact_type: source.fact_type.clone(),
            version: source.version,
        });
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(id = %source.id, hash = %source.hash, "registered schema");
        Ok(())
    }

    /// Returns true if exactly this schema is registered.
    ///
    /// # Errors
    ///
    /// `Error::SchemaConflict` if the id is registered with another hash.
    pub fn contains_schema(&self, source: &SchemaSource) -> Result<bool> {
        let conn = self.conn.lock();
        self.check_schema(&conn, source)
    }

    fn check_schema(&self, conn: &Connection, source: &SchemaSource) -> Result<bool> {
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, hash FROM schema_store
                 WHERE id = ? OR (ns = ? AND type = ? AND version = ?)
                 ORDER BY id = ? DESC
                 LIMIT 1",
                params![
                    source.id,
                    source.ns,
                    source.fact_type,
                    source.version,
                    source.id
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => Ok(false),
            Some((_, hash)) if hash == source.hash => Ok(true),
            Some((id, hash)) => {
                self.metrics.count(REGISTRY_CONFLICT, 1);
                error!(
                    id = %id,
                    registered = %hash,
                    offered = %source.hash,
                    "schema conflict: registry deployments disagree"
                );
                Err(Error::SchemaConflict {
                    id,
                    existing: hash,
                    offered: source.hash.clone(),
                })
            }
        }
    }

    /// Returns the compiled validator for a fact version, if a schema exists.
    pub fn validator(
        &self,
        ns: &str,
        fact_type: &str,
        version: u32,
    ) -> Result<Option<Arc<Validator>>> {
        let key = SchemaKey {
            ns: ns.to_string(),
            fact_type: fact_type.to_string(),
            version,
        };
        if let Some(hit) = self.validators.lock().get(&key) {
            return Ok(Some(Arc::clone(hit)));
        }

        let row: Option<(String, String, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT id, hash, schema FROM schema_store WHERE ns = ? AND type = ? AND version = ?",
                params![ns, fact_type, version],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, hash, text)) = row else {
            return Ok(None);
        };
        let source = SchemaSource {
            id,
            ns: key.ns.clone(),
            fact_type: key.fact_type.clone(),
            version,
            hash,
            schema: serde_json::from_str(&text)?,
        };
        let validator = Arc::new(compile_schema(&source)?);
        self.validators.lock().insert(key, Arc::clone(&validator));
        Ok(Some(validator))
    }

    // =========================================================================
    // Transformations
    // =========================================================================

    /// Registers a transformation.
    ///
    /// # Errors
    ///
    /// - `Error::TransformationConflict` if the id (or its edge) is taken by
    ///   a different hash
    /// - `Error::Script` if the code does not compile
    pub fn register_transformation(&self, source: &TransformationSource) -> Result<()> {
        if source.from_version == source.to_version {
            return Err(Error::Script(format!(
                "transformation '{}' maps version {} onto itself",
                source.id, source.from_version
            )));
        }
        let transform = self.engine.compile_transform(&source.code)?;

        let conn = self.conn.lock();
        if self.check_transformation(&conn, source)? {
            return Ok(());
        }

        conn.execute(
            "INSERT INTO transformation_store (id, hash, ns, type, from_version, to_version, code)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                source.id,
                source.hash,
                source.ns,
                source.fact_type,
                source.from_version,
                source.to_version,
                source.code,
            ],
        )?;
        drop(conn);

        self.compiled.lock().insert(source.hash.clone(), transform);
        {
            let mut chains = self.chains.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            chains.clear();
        }
        info!(id = %source.id, hash = %source.hash, "registered transformation");
        Ok(())
    }

    /// Returns true if exactly this transformation is registered.
    ///
    /// # Errors
    ///
    /// `Error::TransformationConflict` if the id is registered with another hash.
    pub fn contains_transformation(&self, source: &TransformationSource) -> Result<bool> {
        let conn = self.conn.lock();
        self.check_transformation(&conn, source)
    }

    fn check_transformation(
        &self,
        conn: &Connection,
        source: &TransformationSource,
    ) -> Result<bool> {
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, hash FROM transformation_store
                 WHERE id = ? OR (ns = ? AND type = ? AND from_version = ? AND to_version = ?)
                 ORDER BY id = ? DESC
                 LIMIT 1",
                params![
                    source.id,
                    source.ns,
                    source.fact_type,
                    source.from_version,
                    source.to_version,
                    source.id
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => Ok(false),
            Some((_, hash)) if hash == source.hash => Ok(true),
            Some((id, hash)) => {
                self.metrics.count(REGISTRY_CONFLICT, 1);
                error!(
                    id = %id,
                    registered = %hash,
                    offered = %source.hash,
                    "transformation conflict: registry deployments disagree"
                );
                Err(Error::TransformationConflict {
                    id,
                    existing: hash,
                    offered: source.hash.clone(),
                })
            }
        }
    }

    /// Resolves the chain turning `(ns, fact_type)` payloads from `from` into `to`.
    ///
    /// # Errors
    ///
    /// `Error::MissingTransformationInformation` if no path exists.
    pub fn chain(
        &self,
        ns: &str,
        fact_type: &str,
        from: u32,
        to: u32,
    ) -> Result<Arc<TransformationChain>> {
        let key = ChainKey {
            ns: ns.to_string(),
            fact_type: fact_type.to_string(),
            from,
            to,
        };
        if let Some(hit) = self.chains.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let generation = self.generation();
        let edges = self.load_edges(ns, fact_type)?;
        let path = shortest_path(&edges, from, to).ok_or_else(|| {
            Error::MissingTransformationInformation {
                ns: ns.to_string(),
                fact_type: fact_type.to_string(),
                from,
                to,
            }
        })?;

        let mut steps = Vec::with_capacity(path.len());
        for edge in &path {
            steps.push(ChainStep {
                id: edge.id.clone(),
                transform: self.compiled_step(edge)?,
            });
        }
        let id = composite_hash(path.iter().map(|e| e.hash.as_str()));
        let chain = Arc::new(TransformationChain {
            id,
            from_version: from,
            to_version: to,
            steps,
        });
        debug!(ns, fact_type, from, to, chain = %chain.id, "resolved transformation chain");

        let mut chains = self.chains.lock();
        if self.generation() == generation {
            chains.insert(key, Arc::clone(&chain));
        }
        Ok(chain)
    }

    fn load_edges(&self, ns: &str, fact_type: &str) -> Result<Vec<Edge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, hash, from_version, to_version, code FROM transformation_store
             WHERE ns = ? AND type = ?
             ORDER BY from_version, to_version",
        )?;
        let rows = stmt.query_map(params![ns, fact_type], |row| {
            Ok(Edge {
                id: row.get(0)?,
                hash: row.get(1)?,
                from: row.get(2)?,
                to: row.get(3)?,
                code: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn compiled_step(&self, edge: &Edge) -> Result<Arc<dyn CompiledTransform>> {
        if let Some(hit) = self.compiled.lock().get(&edge.hash) {
            return Ok(Arc::clone(hit));
        }
        let transform = self.engine.compile_transform(&edge.code)?;
        self.compiled
            .lock()
            .insert(edge.hash.clone(), Arc::clone(&transform));
        Ok(transform)
    }
}

fn compile_schema(source: &SchemaSource) -> Result<Validator> {
    jsonschema::validator_for(&source.schema)
        .map_err(|e| Error::Schema(format!("schema '{}' is not a valid JSON schema: {e}", source.id)))
}

/// Breadth-first search over directed version edges.
fn shortest_path(edges: &[Edge], from: u32, to: u32) -> Option<Vec<&Edge>> {
    let mut previous: HashMap<u32, &Edge> = HashMap::new();
    let mut visited: HashSet<u32> = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(version) = queue.pop_front() {
        if version == to {
            let mut path = Vec::new();
            let mut cursor = to;
            while cursor != from {
                let edge = previous[&cursor];
                path.push(edge);
                cursor = edge.from;
            }
            path.reverse();
            return Some(path);
        }
        for edge in edges.iter().filter(|e| e.from == version) {
            if visited.insert(edge.to) {
                previous.insert(edge.to, edge);
                queue.push_back(edge.to);
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
