//! # Embedded Script Engine
//!
//! Filter predicates and transformation steps are user-authored scripts. The
//! store only depends on the narrow [`ScriptEngine`] trait:
//!
//! ```text
//! compile_predicate(source) → CompiledPredicate.test(header, payload) → bool
//! compile_transform(source) → CompiledTransform.run(document) → document
//! ```
//!
//! [`RhaiEngine`] is the default implementation. Scripts run sandboxed (no
//! file or network access) with an operation budget, so a runaway loop fails
//! with [`Error::Script`] instead of hanging a reader thread.
//!
//! ## Script conventions
//!
//! - A predicate is an expression over `header` and `payload`:
//!   `payload.total > 100 && header.meta.source == "web"`
//! - A transformation mutates the `event` variable in place:
//!   `event.displayName = event.firstName + " " + event.lastName;`
//!
//! Compilation is the expensive part. Compiled scripts are immutable and
//! shared (`Arc`), and [`PredicateCache`] makes sure identical predicate
//! sources are compiled once per store.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;

use crate::error::{Error, Result};

/// Operations a single script evaluation may perform.
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

/// Distinct predicate sources kept compiled by [`PredicateCache`].
const PREDICATE_CACHE_CAPACITY: usize = 1024;

// =============================================================================
// Engine Traits
// =============================================================================

/// A compiled boolean filter over a fact's header and payload.
pub trait CompiledPredicate: Send + Sync {
    /// Evaluates the predicate.
    fn test(&self, header: &Value, payload: &Value) -> Result<bool>;
}

/// A compiled payload transformation.
pub trait CompiledTransform: Send + Sync {
    /// Runs the transformation and returns the reshaped document.
    fn run(&self, document: Value) -> Result<Value>;
}

/// Pluggable compiler for predicates and transformations.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Compiles a predicate source.
    fn compile_predicate(&self, source: &str) -> Result<Arc<dyn CompiledPredicate>>;

    /// Compiles a transformation source.
    fn compile_transform(&self, source: &str) -> Result<Arc<dyn CompiledTransform>>;
}

// =============================================================================
// Rhai Implementation
// =============================================================================

/// [`ScriptEngine`] backed by the `rhai` embedded scripting language.
#[derive(Clone)]
pub struct RhaiEngine {
    engine: Arc<Engine>,
}

impl RhaiEngine {
    /// Creates an engine with the default operation budget.
    pub fn new() -> Self {
        Self::with_max_operations(DEFAULT_MAX_OPERATIONS)
    }

    /// Creates an engine with a custom operation budget.
    pub fn with_max_operations(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_call_levels(32);
        Self {
            engine: Arc::new(engine),
        }
    }

    fn compile(&self, source: &str) -> Result<AST> {
        self.engine
            .compile(source)
            .map_err(|e| Error::Script(format!("compile error: {e}")))
    }
}

impl Default for RhaiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RhaiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiEngine").finish_non_exhaustive()
    }
}

impl ScriptEngine for RhaiEngine {
    fn compile_predicate(&self, source: &str) -> Result<Arc<dyn CompiledPredicate>> {
        let ast = self.compile(source)?;
        Ok(Arc::new(RhaiPredicate {
            engine: Arc::clone(&self.engine),
            ast,
        }))
    }

    fn compile_transform(&self, source: &str) -> Result<Arc<dyn CompiledTransform>> {
        let ast = self.compile(source)?;
        Ok(Arc::new(RhaiTransform {
            engine: Arc::clone(&self.engine),
            ast,
        }))
    }
}

struct RhaiPredicate {
    engine: Arc<Engine>,
    ast: AST,
}

impl CompiledPredicate for RhaiPredicate {
    fn test(&self, header: &Value, payload: &Value) -> Result<bool> {
        let mut scope = Scope::new();
        scope.push_constant_dynamic("header", to_script(header)?);
        scope.push_constant_dynamic("payload", to_script(payload)?);

        self.engine
            .eval_ast_with_scope::<bool>(&mut scope, &self.ast)
            .map_err(|e| Error::Script(format!("predicate failed: {e}")))
    }
}

struct RhaiTransform {
    engine: Arc<Engine>,
    ast: AST,
}

impl CompiledTransform for RhaiTransform {
    fn run(&self, document: Value) -> Result<Value> {
        let mut scope = Scope::new();
        scope.push_dynamic("event", to_script(&document)?);

        self.engine
            .run_ast_with_scope(&mut scope, &self.ast)
            .map_err(|e| Error::Script(format!("transformation failed: {e}")))?;

        let event = scope
            .get_value::<Dynamic>("event")
            .ok_or_else(|| Error::Script("transformation removed 'event'".into()))?;
        from_dynamic::<Value>(&event)
            .map_err(|e| Error::Script(format!("transformation produced invalid JSON: {e}")))
    }
}

fn to_script(value: &Value) -> Result<Dynamic> {
    to_dynamic(value).map_err(|e| Error::Script(format!("cannot convert document: {e}")))
}

// =============================================================================
// Predicate Cache
// =============================================================================

/// Compiles each distinct predicate source once per store.
pub(crate) struct PredicateCache {
    engine: Arc<dyn ScriptEngine>,
    compiled: Mutex<LruCache<String, Arc<dyn CompiledPredicate>>>,
}

impl PredicateCache {
    pub(crate) fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        let capacity = NonZeroUsize::new(PREDICATE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            engine,
            compiled: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get_or_compile(&self, source: &str) -> Result<Arc<dyn CompiledPredicate>> {
        if let Some(hit) = self.compiled.lock().get(source) {
            return Ok(Arc::clone(hit));
        }

        // Compile outside the lock; a concurrent duplicate compile is harmless.
        let predicate = self.engine.compile_predicate(source)?;
        self.compiled
            .lock()
            .put(source.to_string(), Arc::clone(&predicate));
        Ok(predicate)
    }
}

// =============================================================================
// Tests
// =============================================================================
