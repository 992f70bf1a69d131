//! # Domain Types for FactDB
//!
//! This module defines the core types used throughout FactDB: facts, their
//! serial positions, the filter specs subscriptions are built from, and the
//! state tokens that guard conditional publishing.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Positions and tokens are wrapped in single-field structs so a [`Serial`]
//! can never be passed where a [`StateToken`] is expected, and the raw
//! integer only leaks out at the SQLite boundary.
//!
//! ## Invariants
//!
//! - [`Serial`]: assigned at persistence time, unique, strictly increasing,
//!   never changed afterwards (not even when a fact is transformed)
//! - [`Fact`]: immutable once built; transformation produces a new value with
//!   the same id and serial
//! - [`StateToken`]: single use, consumed by a successful conditional publish

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::build_header;
use crate::error::{Error, Result};

// =============================================================================
// Serial
// =============================================================================

/// Monotonic position of a fact in the store.
///
/// Serials start at 1. They are the ordering key for catchup and follow, and
/// the cursor a consumer persists to resume a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Serial(u64);

impl Serial {
    /// The first serial ever assigned.
    pub const FIRST: Serial = Serial(1);

    /// Sentinel for "before the first fact". Never assigned to a fact.
    pub const ZERO: Serial = Serial(0);

    /// Creates a serial from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the serial directly after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) fn as_sql(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Meta
// =============================================================================

/// Ordered, multi-valued string map attached to a fact.
///
/// Keys are not unique: `meta.insert("tag", "a")` followed by
/// `meta.insert("tag", "b")` keeps both values in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta(Vec<(String, String)>);

impl Meta {
    /// Creates an empty meta map.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a key/value pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Returns the first value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if some entry has exactly this key and value.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0.iter().any(|(k, v)| k == key && v == value)
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries (counting repeated keys).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Meta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// =============================================================================
// Fact
// =============================================================================

/// An immutable fact (event record).
///
/// Facts are created with [`Fact::builder`], get their [`Serial`] when the
/// writer persists them, and are never mutated afterwards. Delivering a fact
/// at a different schema version yields a *new* `Fact` carrying the same id
/// and serial.
///
/// # Example
///
/// ```rust
/// use factdb::Fact;
/// use serde_json::json;
///
/// let fact = Fact::builder("orders", "OrderPlaced")
///     .version(2)
///     .meta("source", "web")
///     .payload(json!({"orderId": 42}))
///     .build()?;
///
/// assert_eq!(fact.ns(), "orders");
/// assert!(fact.serial().is_none());
/// # Ok::<(), factdb::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    id: Uuid,
    ns: String,
    fact_type: String,
    version: u32,
    aggregate_ids: Vec<Uuid>,
    meta: Meta,
    serial: Option<Serial>,
    header: Value,
    payload: Value,
}

impl Fact {
    /// Starts building a fact in the given namespace with the given type.
    pub fn builder(ns: impl Into<String>, fact_type: impl Into<String>) -> FactBuilder {
        FactBuilder {
            id: None,
            ns: ns.into(),
            fact_type: fact_type.into(),
            version: 1,
            aggregate_ids: Vec::new(),
            meta: Meta::new(),
            payload: Value::Object(Default::default()),
        }
    }

    /// Globally unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Namespace.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Type within the namespace.
    pub fn fact_type(&self) -> &str {
        &self.fact_type
    }

    /// Schema version of the payload.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Aggregate ids this fact belongs to (possibly empty, no duplicates).
    pub fn aggregate_ids(&self) -> &[Uuid] {
        &self.aggregate_ids
    }

    /// Metadata entries.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Serial position, `None` until the fact has been published.
    pub fn serial(&self) -> Option<Serial> {
        self.serial
    }

    /// Header document (id, ns, type, version, aggIds, meta).
    pub fn header(&self) -> &Value {
        &self.header
    }

    /// Payload document.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns a copy of this fact positioned at `serial`.
    #[cfg(test)]
    pub(crate) fn with_serial(mut self, serial: Serial) -> Self {
        self.serial = Some(serial);
        self.header = build_header(
            self.id,
            &self.ns,
            &self.fact_type,
            self.version,
            &self.aggregate_ids,
            &self.meta,
            Some(serial),
        );
        self
    }

    /// Returns a copy of this fact reshaped to `version` with a new payload.
    ///
    /// Id, serial, namespace, type, aggregates and meta are preserved.
    pub(crate) fn with_version(&self, version: u32, payload: Value) -> Self {
        Self {
            id: self.id,
            ns: self.ns.clone(),
            fact_type: self.fact_type.clone(),
            version,
            aggregate_ids: self.aggregate_ids.clone(),
            meta: self.meta.clone(),
            serial: self.serial,
            header: build_header(
                self.id,
                &self.ns,
                &self.fact_type,
                version,
                &self.aggregate_ids,
                &self.meta,
                self.serial,
            ),
            payload,
        }
    }

    /// Reassembles a fact read from storage.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: Uuid,
        ns: String,
        fact_type: String,
        version: u32,
        aggregate_ids: Vec<Uuid>,
        meta: Meta,
        serial: Serial,
        payload: Value,
    ) -> Self {
        let header = build_header(
            id,
            &ns,
            &fact_type,
            version,
            &aggregate_ids,
            &meta,
            Some(serial),
        );
        Self {
            id,
            ns,
            fact_type,
            version,
            aggregate_ids,
            meta,
            serial: Some(serial),
            header,
            payload,
        }
    }
}

/// Builder for [`Fact`].
#[derive(Debug, Clone)]
pub struct FactBuilder {
    id: Option<Uuid>,
    ns: String,
    fact_type: String,
    version: u32,
    aggregate_ids: Vec<Uuid>,
    meta: Meta,
    payload: Value,
}

impl FactBuilder {
    /// Sets an explicit id (defaults to a random v4 UUID).
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the schema version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Adds an aggregate id. Duplicates are ignored.
    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        if !self.aggregate_ids.contains(&id) {
            self.aggregate_ids.push(id);
        }
        self
    }

    /// Adds a meta entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key, value);
        self
    }

    /// Sets the payload document.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validates and builds the fact.
    ///
    /// # Errors
    ///
    /// `Error::InvalidFact` if the namespace or type is empty or the version is 0.
    pub fn build(self) -> Result<Fact> {
        if self.ns.trim().is_empty() {
            return Err(Error::InvalidFact("namespace must not be empty".into()));
        }
        if self.fact_type.trim().is_empty() {
            return Err(Error::InvalidFact("type must not be empty".into()));
        }
        if self.version == 0 {
            return Err(Error::InvalidFact("version must be positive".into()));
        }

        let id = self.id.unwrap_or_else(Uuid::new_v4);
        let header = build_header(
            id,
            &self.ns,
            &self.fact_type,
            self.version,
            &self.aggregate_ids,
            &self.meta,
            None,
        );

        Ok(Fact {
            id,
            ns: self.ns,
            fact_type: self.fact_type,
            version: self.version,
            aggregate_ids: self.aggregate_ids,
            meta: self.meta,
            serial: None,
            header,
            payload: self.payload,
        })
    }
}

// =============================================================================
// FactSpec
// =============================================================================

/// A single filter over facts.
///
/// All present constraints must hold (logical AND). A subscription holds a
/// list of specs and a fact matches if **any** spec matches.
///
/// `version` is not a filter: it is the version a matching fact is delivered
/// at (0 = as stored).
///
/// # Example
///
/// ```rust
/// use factdb::FactSpec;
///
/// let spec = FactSpec::ns("orders")
///     .fact_type("OrderPlaced")
///     .meta("source", "web")
///     .filter_script("payload.total > 100");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactSpec {
    pub(crate) ns: String,
    pub(crate) fact_type: Option<String>,
    pub(crate) version: u32,
    pub(crate) aggregate_id: Option<Uuid>,
    pub(crate) meta: BTreeMap<String, String>,
    pub(crate) filter_script: Option<String>,
}

impl FactSpec {
    /// Creates a spec matching every fact in a namespace.
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: None,
            version: 0,
            aggregate_id: None,
            meta: BTreeMap::new(),
            filter_script: None,
        }
    }

    /// Restricts to one fact type.
    pub fn fact_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    /// Requests delivery at this schema version (0 = as stored).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Restricts to facts carrying this aggregate id.
    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Requires an exact meta value. Repeating a key replaces the constraint.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Adds a script predicate evaluated against `header` and `payload`.
    pub fn filter_script(mut self, source: impl Into<String>) -> Self {
        self.filter_script = Some(source.into());
        self
    }

    /// Namespace this spec selects.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Type constraint, if any.
    pub fn type_constraint(&self) -> Option<&str> {
        self.fact_type.as_deref()
    }

    /// Requested delivery version.
    pub fn requested_version(&self) -> u32 {
        self.version
    }

    /// Returns true if this spec cannot be fully pushed down into SQL.
    pub fn has_script(&self) -> bool {
        self.filter_script.is_some()
    }
}

// =============================================================================
// Subscription Requests
// =============================================================================

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// From the very first fact.
    Beginning,
    /// Strictly after the given serial.
    After(Serial),
    /// Skip catchup and follow from the current head (ephemeral).
    Now,
}

/// A request to stream facts.
///
/// # Example
///
/// ```rust
/// use factdb::{FactSpec, Serial, SubscriptionRequest};
/// use std::time::Duration;
///
/// let request = SubscriptionRequest::follow(vec![FactSpec::ns("orders")])
///     .after(Serial::from_raw(41))
///     .max_latency(Duration::from_millis(100));
/// assert!(request.is_continuous());
/// ```
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub(crate) specs: Vec<FactSpec>,
    pub(crate) start: StartPosition,
    pub(crate) continuous: bool,
    pub(crate) max_latency: Option<Duration>,
    pub(crate) debug_info: Option<String>,
}

impl SubscriptionRequest {
    /// Catchup only: deliver history, then complete.
    pub fn catchup(specs: Vec<FactSpec>) -> Self {
        Self {
            specs,
            start: StartPosition::Beginning,
            continuous: false,
            max_latency: None,
            debug_info: None,
        }
    }

    /// Catchup, then follow new facts until closed.
    pub fn follow(specs: Vec<FactSpec>) -> Self {
        Self {
            continuous: true,
            ..Self::catchup(specs)
        }
    }

    /// Starts strictly after `serial`.
    pub fn after(mut self, serial: Serial) -> Self {
        self.start = StartPosition::After(serial);
        self
    }

    /// Starts after `serial` if given, from the beginning otherwise.
    pub fn after_optional(self, serial: Option<Serial>) -> Self {
        match serial {
            Some(serial) => self.after(serial),
            None => self,
        }
    }

    /// Skips catchup and follows from the current head.
    pub fn from_now(mut self) -> Self {
        self.start = StartPosition::Now;
        self.continuous = true;
        self
    }

    /// Caps how long a committed fact may wait before delivery.
    pub fn max_latency(mut self, latency: Duration) -> Self {
        self.max_latency = Some(latency);
        self
    }

    /// Free-form label included in log lines for this subscription.
    pub fn debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }

    /// The specs, in request order.
    pub fn specs(&self) -> &[FactSpec] {
        &self.specs
    }

    /// Start position.
    pub fn start(&self) -> StartPosition {
        self.start
    }

    /// Whether the subscription follows after catchup.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub(crate) fn label(&self) -> &str {
        self.debug_info.as_deref().unwrap_or("-")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.specs.is_empty() {
            return Err(Error::InvalidFact(
                "subscription request needs at least one fact spec".into(),
            ));
        }
        if let Some(spec) = self.specs.iter().find(|s| s.ns.trim().is_empty()) {
            return Err(Error::InvalidFact(format!(
                "fact spec without namespace: {spec:?}"
            )));
        }
        if let Some(spec) = self
            .specs
            .iter()
            .find(|s| s.version != 0 && s.fact_type.is_none())
        {
            return Err(Error::InvalidFact(format!(
                "a requested version needs a type constraint: {spec:?}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Optimistic Locking
// =============================================================================

/// Opaque handle over a captured aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateToken(Uuid);

impl StateToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Recreates a token from its id.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The token id.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the last fact id per aggregate in a namespace.
///
/// With an empty aggregate set the snapshot covers the namespace as a whole:
/// `namespace_head` is the last fact id in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Namespace the state was captured in.
    pub ns: String,
    /// Last fact id per aggregate (`None` if the aggregate has no facts yet).
    pub heads: BTreeMap<Uuid, Option<Uuid>>,
    /// Last fact id in the namespace, used when `heads` is empty.
    pub namespace_head: Option<Uuid>,
}

/// Result of an unconditional publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    /// Serial of the first fact written.
    pub first_serial: Serial,
    /// Serial of the last fact written.
    pub last_serial: Serial,
    /// Id of the last fact written.
    pub last_fact_id: Uuid,
}

// =============================================================================
// Tests
// =============================================================================
