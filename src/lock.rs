//! # Optimistic Locking DSL
//!
//! ```text
//!   ACQUIRE ──► ATTEMPT ──┬── abort ───────────────► Aborted
//!      ▲                  │
//!      │                  └── publish ──► COMMIT ──┬── unchanged ─► Published
//!      │                                           │                 (side effect)
//!      └──────────── state changed (retry) ◄───────┘
//! ```
//!
//! ACQUIRE captures a [`StateToken`] over the named aggregates. ATTEMPT runs
//! the caller's business logic against that state. COMMIT is a conditional
//! publish executed on the writer thread, so the state check and the insert
//! cannot interleave with any other write.
//!
//! ```rust,ignore
//! let outcome = store
//!     .lock("accounts")
//!     .on([account_id])
//!     .retries(5)
//!     .attempt(|state| async move {
//!         if state.heads[&account_id].is_none() {
//!             return Ok(Attempt::abort("account does not exist"));
//!         }
//!         Ok(Attempt::publish(vec![withdrawn(account_id, 10)]))
//!     })
//!     .await?;
//! ```

use std::future::Future;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::FactStore;
use crate::error::{BoxError, Error, Result};
use crate::types::{AggregateState, Fact, PublishResult, StateToken};

type SideEffect = Box<dyn FnOnce(&PublishResult) -> std::result::Result<(), BoxError> + Send>;

enum AttemptKind {
    Publish {
        facts: Vec<Fact>,
        side_effect: Option<SideEffect>,
    },
    Abort(String),
}

/// What one attempt decided to do.
pub struct Attempt {
    kind: AttemptKind,
}

impl Attempt {
    /// Publish these facts if the locked state is still current.
    pub fn publish(facts: Vec<Fact>) -> Self {
        Self {
            kind: AttemptKind::Publish {
                facts,
                side_effect: None,
            },
        }
    }

    /// Give up without writing. Never retried.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            kind: AttemptKind::Abort(reason.into()),
        }
    }

    /// Runs `effect` once the facts are durable.
    ///
    /// A failing effect is reported as [`Error::ExceptionAfterPublish`]. Has
    /// no effect on an aborted attempt.
    pub fn and_then<F>(mut self, effect: F) -> Self
    where
        F: FnOnce(&PublishResult) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        if let AttemptKind::Publish { side_effect, .. } = &mut self.kind {
            *side_effect = Some(Box::new(effect));
        }
        self
    }
}

impl std::fmt::Debug for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AttemptKind::Publish { facts, side_effect } => f
                .debug_struct("Publish")
                .field("facts", &facts.len())
                .field("side_effect", &side_effect.is_some())
                .finish(),
            AttemptKind::Abort(reason) => f.debug_tuple("Abort").field(reason).finish(),
        }
    }
}

/// Final result of a locked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The facts were written.
    Published(PublishResult),
    /// Business logic aborted; nothing was written.
    Aborted(String),
}

impl LockOutcome {
    /// Turns an abort into [`Error::AttemptAborted`].
    pub fn into_result(self) -> Result<PublishResult> {
        match self {
            LockOutcome::Published(result) => Ok(result),
            LockOutcome::Aborted(reason) => Err(Error::AttemptAborted(reason)),
        }
    }

    /// Returns true if facts were written.
    pub fn is_published(&self) -> bool {
        matches!(self, LockOutcome::Published(_))
    }
}

/// Builder returned by [`FactStore::lock`].
#[must_use = "a lock does nothing until `attempt` is awaited"]
pub struct LockBuilder {
    store: FactStore,
    ns: String,
    aggregate_ids: Vec<Uuid>,
    retries: u32,
}

impl LockBuilder {
    pub(crate) fn new(store: FactStore, ns: String, retries: u32) -> Self {
        Self {
            store,
            ns,
            aggregate_ids: Vec::new(),
            retries,
        }
    }

    /// Aggregates to guard. Without any, the namespace as a whole is guarded.
    pub fn on(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.aggregate_ids.extend(ids);
        self
    }

    /// Retries after a concurrent change (total attempts = `retries + 1`).
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Runs the ACQUIRE → ATTEMPT → COMMIT loop.
    ///
    /// `attempt` is called once per try with the freshly captured state.
    ///
    /// # Errors
    ///
    /// - `Error::RetryLimitExceeded` if every try observed a concurrent change
    /// - `Error::ExceptionAfterPublish` if the side effect failed
    /// - any error returned by `attempt` or by the publish itself
    pub async fn attempt<F, Fut>(self, mut attempt: F) -> Result<LockOutcome>
    where
        F: FnMut(AggregateState) -> Fut,
        Fut: Future<Output = Result<Attempt>>,
    {
        let attempts = self.retries.saturating_add(1);

        for n in 1..=attempts {
            let (token, state) = self
                .store
                .acquire_lock(&self.ns, self.aggregate_ids.clone())
                .await?;

            let decided = match attempt(state).await {
                Ok(decided) => decided,
                Err(e) => {
                    self.release(token).await;
                    return Err(e);
                }
            };

            let (facts, side_effect) = match decided.kind {
                AttemptKind::Abort(reason) => {
                    self.release(token).await;
                    debug!(ns = %self.ns, %reason, "lock attempt aborted");
                    return Ok(LockOutcome::Aborted(reason));
                }
                AttemptKind::Publish { facts, side_effect } => (facts, side_effect),
            };

            let published = match self.store.publish_if_unchanged_result(token, facts).await {
                Ok(published) => published,
                Err(e) => {
                    self.release(token).await;
                    return Err(e);
                }
            };

            match published {
                Some(result) => {
                    if let Some(effect) = side_effect {
                        effect(&result).map_err(|source| Error::ExceptionAfterPublish {
                            last_published: result.last_fact_id,
                            source,
                        })?;
                    }
                    return Ok(LockOutcome::Published(result));
                }
                None => {
                    self.release(token).await;
                    debug!(ns = %self.ns, attempt = n, "locked state changed, retrying");
                }
            }
        }

        warn!(ns = %self.ns, attempts, "lock retries exhausted");
        Err(Error::RetryLimitExceeded {
            ns: self.ns,
            attempts,
        })
    }

    async fn release(&self, token: StateToken) {
        if let Err(e) = self.store.invalidate(token).await {
            warn!(ns = %self.ns, %token, error = %e, "failed to invalidate state token");
        }
    }
}
