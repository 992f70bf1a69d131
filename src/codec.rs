//! # Fact Encoding and Decoding
//!
//! Facts are stored as plain SQLite columns plus three JSON text columns:
//!
//! ```text
//! header   {"id":…,"ns":…,"type":…,"version":…,"aggIds":[…],"meta":{…}}
//! meta     [["source","web"],["tag","a"],["tag","b"]]
//! payload  arbitrary JSON document
//! ```
//!
//! The header is derived from the structured fields and rebuilt on every
//! read, so the stored copy is informational. On read the serial is added
//! as `meta._ser`, which lets script predicates see it.
//!
//! The `meta` column keeps the exact ordered list of pairs. The header's
//! `meta` object is a convenience view for scripts: a key with one value maps
//! to a string, a repeated key maps to an array of strings.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Row;
use serde_json::map::Entry;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Fact, Meta, Serial};

/// Columns selected by every fact query, in [`fact_from_row`] order.
pub(crate) const FACT_COLUMNS: &str = "f.serial, f.id, f.ns, f.type, f.version, f.header, f.meta, f.payload";

// =============================================================================
// Header
// =============================================================================

/// Builds the header document for a fact.
pub(crate) fn build_header(
    id: Uuid,
    ns: &str,
    fact_type: &str,
    version: u32,
    aggregate_ids: &[Uuid],
    meta: &Meta,
    serial: Option<Serial>,
) -> Value {
    let mut meta_view = Map::new();
    for (key, value) in meta.iter() {
        let value = Value::String(value.to_string());
        match meta_view.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                Value::Array(values) => values.push(value),
                existing => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            },
        }
    }
    if let Some(serial) = serial {
        meta_view.insert("_ser".to_string(), json!(serial.as_raw()));
    }

    json!({
        "id": id.to_string(),
        "ns": ns,
        "type": fact_type,
        "version": version,
        "aggIds": aggregate_ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
        "meta": Value::Object(meta_view),
    })
}

// =============================================================================
// Meta
// =============================================================================

/// Encodes meta as an ordered JSON array of `[key, value]` pairs.
pub(crate) fn encode_meta(meta: &Meta) -> Result<String> {
    let pairs: Vec<(&str, &str)> = meta.iter().collect();
    Ok(serde_json::to_string(&pairs)?)
}

/// Decodes the `meta` column.
pub(crate) fn decode_meta(text: &str) -> Result<Meta> {
    let pairs: Vec<(String, String)> = serde_json::from_str(text)?;
    Ok(pairs.into_iter().collect())
}

// =============================================================================
// Rows
// =============================================================================

/// Raw column values of one fact row.
///
/// Extracted inside `query_map` closures (which must return
/// `rusqlite::Result`), then decoded with [`StoredFact::decode`] where JSON
/// errors can be reported as [`Error::Json`].
pub(crate) struct StoredFact {
    serial: i64,
    id: String,
    ns: String,
    fact_type: String,
    version: i64,
    header: String,
    meta: String,
    payload: String,
}

impl StoredFact {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            serial: row.get(0)?,
            id: row.get(1)?,
            ns: row.get(2)?,
            fact_type: row.get(3)?,
            version: row.get(4)?,
            header: row.get(5)?,
            meta: row.get(6)?,
            payload: row.get(7)?,
        })
    }

    pub(crate) fn decode(self) -> Result<Fact> {
        let id = parse_uuid(&self.id)?;
        let header: Value = serde_json::from_str(&self.header)?;
        let aggregate_ids = header
            .get("aggIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(parse_uuid)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        let meta = decode_meta(&self.meta)?;
        let payload: Value = serde_json::from_str(&self.payload)?;
        let version = u32::try_from(self.version)
            .map_err(|_| Error::Schema(format!("fact {id} has invalid version {}", self.version)))?;

        Ok(Fact::from_parts(
            id,
            self.ns,
            self.fact_type,
            version,
            aggregate_ids,
            meta,
            Serial::from_raw(self.serial as u64),
            payload,
        ))
    }
}

/// Reads and decodes a fact row selected with [`FACT_COLUMNS`].
pub(crate) fn fact_from_row(row: &Row<'_>) -> Result<Fact> {
    StoredFact::from_row(row)?.decode()
}

pub(crate) fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Schema(format!("invalid uuid '{text}': {e}")))
}

// =============================================================================
// Hashing & Time
// =============================================================================

/// Hex SHA-256 of a string.
pub(crate) fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Hex SHA-256 over a sequence of parts, each length-prefixed.
pub(crate) fn composite_hash<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Returns the current time in milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_groups_repeated_meta_keys() {
        let mut meta = Meta::new();
        meta.insert("tag", "a");
        meta.insert("source", "web");
        meta.insert("tag", "b");
        meta.insert("tag", "c");

        let header = build_header(
            Uuid::nil(),
            "orders",
            "OrderPlaced",
            2,
            &[],
            &meta,
            Some(Serial::from_raw(17)),
        );

        assert_eq!(header["meta"]["source"], "web");
        assert_eq!(header["meta"]["tag"], json!(["a", "b", "c"]));
        assert_eq!(header["meta"]["_ser"], 17);
        assert_eq!(header["type"], "OrderPlaced");
    }

    #[test]
    fn test_meta_column_preserves_order() {
        let meta: Meta = vec![("b", "1"), ("a", "2"), ("b", "3")].into_iter().collect();
        let decoded = decode_meta(&encode_meta(&meta).unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_composite_hash_is_boundary_sensitive() {
        assert_ne!(composite_hash(["ab", "c"]), composite_hash(["a", "bc"]));
        assert_eq!(composite_hash(["x", "y"]), composite_hash(["x", "y"]));
        assert_eq!(content_hash("abc").len(), 64);
    }
}
