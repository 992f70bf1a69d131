//! # Error Handling for FactDB
//!
//! This module defines the error types used throughout FactDB. A single error
//! enum ([`Error`]) represents every failure mode, so callers can match on one
//! type whether the failure came from SQLite, the registry, or a script.
//!
//! ## Rust Pattern: thiserror
//!
//! The `thiserror` crate derives `std::error::Error` and `Display` from the
//! `#[error(...)]` attributes, and `#[from]` generates the `From` impls that
//! let `?` convert `rusqlite` and `serde_json` errors automatically.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Integrity | Schema/transformation conflict | Fix the registry deployment |
//! | Rejected write | Validation failure, duplicate fact id | Fix the fact and republish |
//! | Lock outcome | Attempt aborted, retries exhausted | Surface to the business caller |
//! | Partial success | Exception after publish | Reconcile from `last_published` |
//! | Delivery | Missing transformation | Register the missing step |
//! | Internal | SQLite error, closed store | Log and investigate |

use thiserror::Error;
use uuid::Uuid;

/// Boxed error returned by user-supplied callbacks (side effects, observers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in FactDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use factdb::{Error, Result};
///
/// fn example() -> Result<()> {
///     let err = Error::TransformationConflict {
///         id: "orders/OrderPlaced/1-2".to_string(),
///         existing: "ab12".to_string(),
///         offered: "cd34".to_string(),
///     };
///     Err(err)
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Transformation & Registry Errors
    // =========================================================================

    /// No transformation chain connects the stored version to the requested one.
    ///
    /// Fatal to the single fetch or delivery that asked for the version. A
    /// catchup may skip the fact instead, depending on
    /// [`StoreConfig::skip_missing_transformation`](crate::StoreConfig).
    #[error(
        "missing transformation information for {ns}/{fact_type}: no path from version {from} to {to}"
    )]
    MissingTransformationInformation {
        /// Namespace of the fact
        ns: String,
        /// Type of the fact
        fact_type: String,
        /// Version the fact is stored at
        from: u32,
        /// Version that was requested
        to: u32,
    },

    /// A schema with this id is already registered with a different hash.
    ///
    /// Two registry deployments disagree about the schema. This is never
    /// resolved silently: the registration attempt fails.
    #[error("schema conflict on '{id}': registered hash {existing}, offered hash {offered}")]
    SchemaConflict {
        /// Schema id
        id: String,
        /// Hash already stored
        existing: String,
        /// Hash of the rejected registration
        offered: String,
    },

    /// A transformation with this id is already registered with a different hash.
    #[error(
        "transformation conflict on '{id}': registered hash {existing}, offered hash {offered}"
    )]
    TransformationConflict {
        /// Transformation id
        id: String,
        /// Hash already stored
        existing: String,
        /// Hash of the rejected registration
        offered: String,
    },

    /// A script failed to compile or to run.
    #[error("script error: {0}")]
    Script(String),

    // =========================================================================
    // Write-Path Errors
    // =========================================================================

    /// The payload does not satisfy the schema registered for its version.
    ///
    /// Also returned when no schema exists and unvalidated publishing is
    /// not allowed.
    #[error("validation failed for fact {fact_id}: {reason}")]
    Validation {
        /// Id of the rejected fact
        fact_id: Uuid,
        /// Human readable explanation
        reason: String,
    },

    /// A fact with this id has already been published.
    #[error("duplicate fact id {0}")]
    DuplicateFactId(Uuid),

    /// The fact is malformed (empty namespace, version 0, ...).
    #[error("invalid fact: {0}")]
    InvalidFact(String),

    /// The state token is unknown or was already consumed.
    #[error("invalid or consumed state token {0}")]
    InvalidStateToken(Uuid),

    // =========================================================================
    // Lock Outcomes
    // =========================================================================

    /// Business logic declined to produce facts.
    ///
    /// Returned only by [`LockOutcome::into_result`](crate::LockOutcome::into_result);
    /// the lock API itself reports aborts as a normal outcome.
    #[error("attempt aborted: {0}")]
    AttemptAborted(String),

    /// Every retry observed a concurrent change on the locked aggregates.
    #[error("lock on namespace '{ns}' gave up after {attempts} attempts")]
    RetryLimitExceeded {
        /// Locked namespace
        ns: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Facts were published, then the post-publish side effect failed.
    ///
    /// The write is durable. `last_published` is the id of the last fact
    /// written so the caller can reconcile instead of assuming failure.
    #[error("exception after publish (last published fact {last_published}): {source}")]
    ExceptionAfterPublish {
        /// Id of the last durably published fact
        last_published: Uuid,
        /// The side effect's error
        #[source]
        source: BoxError,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored header or payload is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch, corrupted rows or an unusable JSON schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The subscription was closed by its consumer.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// A [`FactObserver`](crate::FactObserver) callback failed; the
    /// subscription was closed.
    #[error("observer failed: {0}")]
    Observer(#[source] BoxError),

    /// The store (or one of its worker threads) has shut down.
    #[error("store closed: {0}")]
    Closed(String),

    /// A worker thread could not be started or a task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors a follow subscription may retry on its next tick.
    ///
    /// Only database hiccups qualify; integrity and script errors would fail
    /// the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Sqlite(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let missing = Error::MissingTransformationInformation {
            ns: "orders".to_string(),
            fact_type: "OrderPlaced".to_string(),
            from: 1,
            to: 3,
        };
        assert_eq!(
            missing.to_string(),
            "missing transformation information for orders/OrderPlaced: no path from version 1 to 3"
        );

        let conflict = Error::SchemaConflict {
            id: "orders/OrderPlaced/1".to_string(),
            existing: "aa".to_string(),
            offered: "bb".to_string(),
        };
        assert_eq!(
            conflict.to_string(),
            "schema conflict on 'orders/OrderPlaced/1': registered hash aa, offered hash bb"
        );

        let retries = Error::RetryLimitExceeded {
            ns: "orders".to_string(),
            attempts: 3,
        };
        assert_eq!(
            retries.to_string(),
            "lock on namespace 'orders' gave up after 3 attempts"
        );
    }

    #[test]
    fn test_exception_after_publish_keeps_source() {
        let id = Uuid::new_v4();
        let err = Error::ExceptionAfterPublish {
            last_published: id,
            source: "mail server down".into(),
        };

        assert!(err.to_string().contains(&id.to_string()));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.is_transient());
        assert!(!Error::Script("boom".into()).is_transient());
    }
}
