//! # Payload Validation
//!
//! Before facts are handed to the writer their payloads are checked against
//! the JSON schema registered for `(ns, type, version)`. A missing schema is
//! either a rejection or a pass-through, depending on
//! [`StoreConfig::allow_unvalidated_publish`](crate::StoreConfig).

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, VALIDATION_FAILED};
use crate::registry::Registry;
use crate::types::Fact;

/// Reported schema violations per fact.
const MAX_REPORTED_ERRORS: usize = 3;

/// Checks facts against registered schemas.
pub struct FactValidator {
    registry: Arc<Registry>,
    metrics: Arc<dyn MetricsSink>,
    enabled: bool,
    allow_unvalidated: bool,
}

impl FactValidator {
    /// Creates a validator.
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<dyn MetricsSink>,
        enabled: bool,
        allow_unvalidated: bool,
    ) -> Self {
        Self {
            registry,
            metrics,
            enabled,
            allow_unvalidated,
        }
    }

    /// Validates one fact.
    ///
    /// # Errors
    ///
    /// `Error::Validation` if the payload violates its schema, or if no
    /// schema is registered and unvalidated publishing is not allowed.
    pub fn validate(&self, fact: &Fact) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(validator) =
            self.registry
                .validator(fact.ns(), fact.fact_type(), fact.version())?
        else {
            if self.allow_unvalidated {
                return Ok(());
            }
            return Err(self.reject(
                fact,
                format!(
                    "no schema registered for {}/{}/{}",
                    fact.ns(),
                    fact.fact_type(),
                    fact.version()
                ),
            ));
        };

        let violations: Vec<String> = validator
            .iter_errors(fact.payload())
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(self.reject(fact, violations.join("; ")))
        }
    }

    /// Validates every fact, stopping at the first rejection.
    pub fn validate_all(&self, facts: &[Fact]) -> Result<()> {
        facts.iter().try_for_each(|fact| self.validate(fact))
    }

    fn reject(&self, fact: &Fact, reason: String) -> Error {
        self.metrics.count(VALIDATION_FAILED, 1);
        warn!(
            fact_id = %fact.id(),
            ns = %fact.ns(),
            fact_type = %fact.fact_type(),
            version = fact.version(),
            %reason,
            "fact rejected"
        );
        Error::Validation {
            fact_id: fact.id(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMetrics;
    use crate::registry::SchemaSource;
    use crate::schema::Database;
    use crate::script::RhaiEngine;
    use serde_json::json;

    fn registry(metrics: Arc<CounterMetrics>) -> Arc<Registry> {
        let db = Database::open_in_memory().unwrap();
        let registry = Registry::new(db.into_connection(), Arc::new(RhaiEngine::new()), metrics);
        registry
            .register_schema(&SchemaSource::new(
                "users",
                "UserCreated",
                1,
                json!({
                    "type": "object",
                    "required": ["name"],
                    "properties": {"name": {"type": "string"}}
                }),
            ))
            .unwrap();
        Arc::new(registry)
    }

    fn user(payload: serde_json::Value, version: u32) -> Fact {
        Fact::builder("users", "UserCreated")
            .version(version)
            .payload(payload)
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_payload_passes() {
        let metrics = Arc::new(CounterMetrics::new());
        let validator = FactValidator::new(registry(metrics.clone()), metrics.clone(), true, false);
        validator.validate(&user(json!({"name": "ada"}), 1)).unwrap();
        assert_eq!(metrics.get(VALIDATION_FAILED), 0);
    }

    #[test]
    fn test_schema_violation_is_rejected() {
        let metrics = Arc::new(CounterMetrics::new());
        let validator = FactValidator::new(registry(metrics.clone()), metrics.clone(), true, false);

        let fact = user(json!({"name": 42}), 1);
        let err = validator.validate(&fact).unwrap_err();
        assert!(matches!(err, Error::Validation { fact_id, .. } if fact_id == fact.id()));
        assert_eq!(metrics.get(VALIDATION_FAILED), 1);
    }

    #[test]
    fn test_missing_schema_policy() {
        let metrics = Arc::new(CounterMetrics::new());
        let registry = registry(metrics.clone());
        let unknown = user(json!({}), 7);

        let strict = FactValidator::new(registry.clone(), metrics.clone(), true, false);
        assert!(matches!(
            strict.validate(&unknown),
            Err(Error::Validation { .. })
        ));

        let lenient = FactValidator::new(registry.clone(), metrics.clone(), true, true);
        lenient.validate(&unknown).unwrap();

        let disabled = FactValidator::new(registry, metrics, false, false);
        disabled.validate(&user(json!({"name": 42}), 1)).unwrap();
    }

    #[test]
    fn test_validate_all_stops_at_first_failure() {
        let metrics = Arc::new(CounterMetrics::new());
        let validator = FactValidator::new(registry(metrics.clone()), metrics.clone(), true, false);
        let facts = vec![
            user(json!({"name": "a"}), 1),
            user(json!({}), 1),
            user(json!({"name": 1}), 1),
        ];
        assert!(validator.validate_all(&facts).is_err());
        assert_eq!(metrics.get(VALIDATION_FAILED), 1);
    }
}
