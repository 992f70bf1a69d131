//! # FactDB - Fact Store Runtime
//!
//! FactDB is an append-only fact store built on SQLite. It provides:
//!
//! - **Ordered fact log**: every fact gets a strictly increasing serial
//! - **Catchup-and-follow subscriptions**: replay history, then tail new facts
//!   with no gap and no duplicate at the handoff
//! - **Versioned facts**: payloads are transformed on read through registered
//!   transformation chains, with a two-tier cache
//! - **Optimistic locking**: state tokens over aggregates and a retrying
//!   lock DSL
//! - **Blacklisting**: poisoned facts are suppressed without being deleted
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │        (publish, subscribe, fetch, lock, blacklist, registry)   │
//! └───────────────┬─────────────────────────────┬───────────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │         Writer Thread         │ │     Subscriptions             │
//! │  group commit, SAVEPOINT per  │ │  catchup: temp-table snapshot │
//! │  request, state tokens,       │ │  follow:  notification fan-out│
//! │  blacklist, commit broadcast ─┼─┼─► re-query serial > last      │
//! └───────────────┬───────────────┘ └───────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single logical writer**: one thread owns the only fact-writing connection
//! 2. **Durable ordering**: serials strictly increase and are never reused
//! 3. **Ordered delivery**: a subscription delivers in ascending serial order,
//!    across the catchup to follow handoff
//! 4. **Immutable registry**: a schema or transformation id never changes content
//! 5. **Atomic check-and-publish**: a conditional publish never interleaves
//!    with another write
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for all failure modes
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Domain types (Fact, Serial, FactSpec, StateToken, ...)
//! - [`config`]: Store configuration and environment overlay
//! - [`registry`]: Schemas and transformations with conflict detection
//! - [`transform`]: Transformation chains with memory and durable caching
//! - [`matcher`]: FactSpec matching and SQL push-down
//! - [`subscription`]: Catchup + follow subscriptions and observers
//! - [`lock`]: Optimistic locking DSL
//! - [`api`]: Async API (main entry point)

pub mod api;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod lock;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod schema;
pub mod script;
pub mod subscription;
pub mod transform;
pub mod types;
pub mod validation;

mod catchup;
mod codec;
mod follow;
mod pipeline;
mod reader;
mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::FactStore;
pub use blacklist::Blacklist;
pub use config::StoreConfig;
pub use error::{BoxError, Error, Result};
pub use lock::{Attempt, LockBuilder, LockOutcome};
pub use matcher::SpecMatcher;
pub use metrics::{CounterMetrics, MetricsSink, NoopMetrics};
pub use registry::{Registry, SchemaSource, TransformationChain, TransformationSource};
pub use schema::Database;
pub use script::{RhaiEngine, ScriptEngine};
pub use subscription::{FactObserver, ObservedSubscription, Subscription, SubscriptionEvent};
pub use transform::Transformer;
pub use types::{
    AggregateState, Fact, FactBuilder, FactSpec, Meta, PublishResult, Serial, StartPosition,
    StateToken, SubscriptionRequest,
};
pub use validation::FactValidator;
pub use writer::WriterConfig;
