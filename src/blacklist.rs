//! # Blacklist
//!
//! A set of fact ids suppressed from every delivery path (catchup, follow and
//! point lookups) without deleting them.
//!
//! ## Wholesale replacement
//!
//! The set is never patched. Every refresh reads the complete `blacklist`
//! table and swaps in a new `Arc<HashSet<Uuid>>`:
//!
//! ```text
//!   readers ──► RwLock<Arc<HashSet>> ──► old set (kept alive by in-flight readers)
//!                       │
//!   refresh ────────────┘ swap ──────► new set
//! ```
//!
//! A reader clones the `Arc` (or checks under a short read lock) and therefore
//! always sees one complete set, either the old one or the new one. Unblocking
//! a fact is just a refresh that no longer contains its id.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::Connection;
use uuid::Uuid;

use crate::codec::parse_uuid;
use crate::error::Result;

/// Shared, refreshable set of blocked fact ids.
#[derive(Debug, Default)]
pub struct Blacklist {
    ids: RwLock<Arc<HashSet<Uuid>>>,
}

impl Blacklist {
    /// Creates an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the fact id is suppressed. O(1).
    pub fn is_blocked(&self, id: &Uuid) -> bool {
        self.ids.read().contains(id)
    }

    /// Replaces the whole set.
    pub fn replace(&self, ids: HashSet<Uuid>) {
        *self.ids.write() = Arc::new(ids);
    }

    /// Returns the current set.
    pub fn snapshot(&self) -> Arc<HashSet<Uuid>> {
        Arc::clone(&self.ids.read())
    }

    /// Number of blocked ids.
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// Returns true if nothing is blocked.
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

/// Reads the complete blacklist table.
pub(crate) fn load_blacklist(conn: &Connection) -> Result<HashSet<Uuid>> {
    let mut stmt = conn.prepare("SELECT id FROM blacklist")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut ids = HashSet::new();
    for row in rows {
        ids.insert(parse_uuid(&row?)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    #[test]
    fn test_replace_is_wholesale() {
        let blacklist = Blacklist::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        blacklist.replace([a].into_iter().collect());
        assert!(blacklist.is_blocked(&a));

        let before = blacklist.snapshot();
        blacklist.replace([b].into_iter().collect());

        assert!(!blacklist.is_blocked(&a));
        assert!(blacklist.is_blocked(&b));
        // A snapshot taken earlier still sees the complete old set.
        assert!(before.contains(&a));
        assert!(!before.contains(&b));
    }

    #[test]
    fn test_load_blacklist() {
        let db = Database::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.connection()
            .execute(
                "INSERT INTO blacklist (id, reason, created_ms) VALUES (?, 'poison', 0)",
                [id.to_string()],
            )
            .unwrap();

        let ids = load_blacklist(db.connection()).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&id));
    }
}
