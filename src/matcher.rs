//! # Predicate Matching
//!
//! A subscription's specs are evaluated in two places:
//!
//! 1. **In SQL.** [`SqlFilter::from_specs`] turns namespace, type, aggregate
//!    and meta constraints into a `WHERE` fragment over `facts f`, so catchup
//!    snapshots and follow re-queries only touch candidate rows.
//! 2. **In memory.** [`SpecMatcher`] re-checks every candidate against the
//!    full specs, including script predicates that SQL cannot express.
//!
//! ```text
//!   specs ──► SqlFilter ──► candidate rows ──► SpecMatcher ──► matching facts
//!             (ns/type/agg/meta)               (all constraints + script)
//! ```
//!
//! Within a spec all constraints must hold (AND, cheapest first, script
//! last). Across specs the first matching spec wins (OR); its requested
//! version decides how the fact is delivered.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;

use crate::error::Result;
use crate::script::{CompiledPredicate, PredicateCache, ScriptEngine};
use crate::types::{Fact, FactSpec};

// =============================================================================
// In-Memory Matching
// =============================================================================

struct CompiledSpec {
    spec: FactSpec,
    predicate: Option<Arc<dyn CompiledPredicate>>,
}

/// A subscription's specs with their script predicates compiled.
pub struct SpecMatcher {
    specs: Vec<CompiledSpec>,
}

impl SpecMatcher {
    /// Compiles the specs' predicates with `engine`.
    pub fn new(specs: &[FactSpec], engine: &dyn ScriptEngine) -> Result<Self> {
        Self::build(specs, |source| engine.compile_predicate(source))
    }

    /// Compiles the specs' predicates through the store-wide cache.
    pub(crate) fn with_cache(specs: &[FactSpec], cache: &PredicateCache) -> Result<Self> {
        Self::build(specs, |source| cache.get_or_compile(source))
    }

    fn build<F>(specs: &[FactSpec], compile: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Arc<dyn CompiledPredicate>>,
    {
        let specs = specs
            .iter()
            .map(|spec| {
                let predicate = spec.filter_script.as_deref().map(&compile).transpose()?;
                Ok(CompiledSpec {
                    spec: spec.clone(),
                    predicate,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { specs })
    }

    /// Returns true if any spec matches.
    pub fn matches(&self, fact: &Fact) -> Result<bool> {
        Ok(self.first_match(fact)?.is_some())
    }

    /// Returns the first spec the fact matches.
    ///
    /// # Errors
    ///
    /// `Error::Script` if a predicate fails to evaluate. Earlier specs that
    /// matched without a script short-circuit before any later script runs.
    pub fn first_match(&self, fact: &Fact) -> Result<Option<&FactSpec>> {
        for compiled in &self.specs {
            if !matches_static(&compiled.spec, fact) {
                continue;
            }
            match &compiled.predicate {
                None => return Ok(Some(&compiled.spec)),
                Some(predicate) => {
                    if predicate.test(fact.header(), fact.payload())? {
                        return Ok(Some(&compiled.spec));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The specs, in request order.
    pub fn specs(&self) -> impl Iterator<Item = &FactSpec> {
        self.specs.iter().map(|c| &c.spec)
    }
}

/// Checks every non-script constraint of `spec`.
pub fn matches_static(spec: &FactSpec, fact: &Fact) -> bool {
    if spec.ns.len() != fact.ns().len() || spec.ns != fact.ns() {
        return false;
    }
    if let Some(fact_type) = &spec.fact_type {
        if fact_type != fact.fact_type() {
            return false;
        }
    }
    if let Some(aggregate_id) = &spec.aggregate_id {
        if !fact.aggregate_ids().contains(aggregate_id) {
            return false;
        }
    }
    spec.meta
        .iter()
        .all(|(key, value)| fact.meta().contains(key, value))
}

// =============================================================================
// SQL Pushdown
// =============================================================================

/// A `WHERE` fragment over `facts f` selecting candidate rows for a spec list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlFilter {
    pub(crate) clause: String,
    pub(crate) params: Vec<SqlValue>,
}

impl SqlFilter {
    pub(crate) fn from_specs(specs: &[FactSpec]) -> Self {
        let mut params = Vec::new();
        let mut alternatives = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut terms = vec!["f.ns = ?".to_string()];
            params.push(SqlValue::Text(spec.ns.clone()));

            if let Some(fact_type) = &spec.fact_type {
                terms.push("f.type = ?".to_string());
                params.push(SqlValue::Text(fact_type.clone()));
            }
            if let Some(aggregate_id) = &spec.aggregate_id {
                terms.push(
                    "EXISTS (SELECT 1 FROM fact_aggregates a WHERE a.serial = f.serial AND a.aggregate_id = ?)"
                        .to_string(),
                );
                params.push(SqlValue::Text(aggregate_id.to_string()));
            }
            for (key, value) in &spec.meta {
                terms.push(
                    "EXISTS (SELECT 1 FROM fact_meta m WHERE m.serial = f.serial AND m.key = ? AND m.value = ?)"
                        .to_string(),
                );
                params.push(SqlValue::Text(key.clone()));
                params.push(SqlValue::Text(value.clone()));
            }

            alternatives.push(format!("({})", terms.join(" AND ")));
        }

        let clause = if alternatives.is_empty() {
            "0".to_string()
        } else {
            format!("({})", alternatives.join(" OR "))
        };

        Self { clause, params }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::script::RhaiEngine;
    use serde_json::json;
    use uuid::Uuid;

    fn fact(ns: &str, fact_type: &str) -> Fact {
        Fact::builder(ns, fact_type)
            .meta("source", "web")
            .payload(json!({"total": 120}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_static_constraints_are_anded() {
        let agg = Uuid::new_v4();
        let f = Fact::builder("orders", "OrderPlaced")
            .aggregate_id(agg)
            .meta("source", "web")
            .build()
            .unwrap();

        assert!(matches_static(&FactSpec::ns("orders"), &f));
        assert!(matches_static(
            &FactSpec::ns("orders")
                .fact_type("OrderPlaced")
                .aggregate_id(agg)
                .meta("source", "web"),
            &f
        ));
        assert!(!matches_static(&FactSpec::ns("order"), &f));
        assert!(!matches_static(
            &FactSpec::ns("orders").fact_type("OrderShipped"),
            &f
        ));
        assert!(!matches_static(
            &FactSpec::ns("orders").aggregate_id(Uuid::new_v4()),
            &f
        ));
        assert!(!matches_static(
            &FactSpec::ns("orders").meta("source", "app"),
            &f
        ));
    }

    #[test]
    fn test_adding_a_spec_never_narrows() {
        let engine = RhaiEngine::new();
        let f = fact("orders", "OrderPlaced");

        let narrow = SpecMatcher::new(&[FactSpec::ns("users")], &engine).unwrap();
        let wider = SpecMatcher::new(
            &[FactSpec::ns("users"), FactSpec::ns("orders")],
            &engine,
        )
        .unwrap();

        assert!(!narrow.matches(&f).unwrap());
        assert!(wider.matches(&f).unwrap());
    }

    #[test]
    fn test_first_matching_spec_wins() {
        let engine = RhaiEngine::new();
        let f = fact("orders", "OrderPlaced");
        let matcher = SpecMatcher::new(
            &[
                FactSpec::ns("orders").fact_type("OrderPlaced").version(2),
                FactSpec::ns("orders").fact_type("OrderPlaced").version(3),
            ],
            &engine,
        )
        .unwrap();

        let spec = matcher.first_match(&f).unwrap().unwrap();
        assert_eq!(spec.requested_version(), 2);
    }

    #[test]
    fn test_script_predicate_runs_last() {
        let engine = RhaiEngine::new();
        let f = fact("orders", "OrderPlaced");

        let cheap = SpecMatcher::new(
            &[FactSpec::ns("orders").filter_script("payload.total > 100")],
            &engine,
        )
        .unwrap();
        assert!(cheap.matches(&f).unwrap());

        let expensive = SpecMatcher::new(
            &[FactSpec::ns("orders").filter_script("payload.total > 500")],
            &engine,
        )
        .unwrap();
        assert!(!expensive.matches(&f).unwrap());

        // Namespace mismatch short-circuits before the broken script is evaluated.
        let skipped = SpecMatcher::new(
            &[FactSpec::ns("users").filter_script("payload.total")],
            &engine,
        )
        .unwrap();
        assert!(!skipped.matches(&f).unwrap());

        let broken = SpecMatcher::new(
            &[FactSpec::ns("orders").filter_script("payload.total")],
            &engine,
        )
        .unwrap();
        assert!(matches!(broken.matches(&f), Err(Error::Script(_))));
    }

    #[test]
    fn test_header_is_visible_to_scripts() {
        let engine = RhaiEngine::new();
        let f = fact("orders", "OrderPlaced");
        let matcher = SpecMatcher::new(
            &[FactSpec::ns("orders").filter_script(r#"header.meta.source == "web""#)],
            &engine,
        )
        .unwrap();
        assert!(matcher.matches(&f).unwrap());
    }

    #[test]
    fn test_sql_filter_shape() {
        let agg = Uuid::new_v4();
        let filter = SqlFilter::from_specs(&[
            FactSpec::ns("orders").fact_type("OrderPlaced").meta("k", "v"),
            FactSpec::ns("users").aggregate_id(agg),
        ]);

        assert!(filter.clause.starts_with("((f.ns = ? AND f.type = ? AND EXISTS"));
        assert!(filter.clause.contains(") OR (f.ns = ? AND EXISTS"));
        assert_eq!(
            filter.params,
            vec![
                SqlValue::Text("orders".into()),
                SqlValue::Text("OrderPlaced".into()),
                SqlValue::Text("k".into()),
                SqlValue::Text("v".into()),
                SqlValue::Text("users".into()),
                SqlValue::Text(agg.to_string()),
            ]
        );
    }
}
