//! # Subscriptions: Catchup + Follow
//!
//! A subscription replays matching history and then, if continuous, tails
//! new facts until it is closed.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Subscription Timeline                            │
//! │                                                                         │
//! │  start = After(100)                 high_water = 500                    │
//! │       │                                   │                             │
//! │       ▼                                   ▼                             │
//! │  ┌────────────────────────────────┐  ┌──────────────────────────────┐   │
//! │  │     Phase 1: Catchup           │  │     Phase 2: Follow          │   │
//! │  │     temp-table snapshot of     │  │     serial > 500, re-queried │   │
//! │  │     serials 101..=500          │  │     on every wake-up         │   │
//! │  └────────────────────────────────┘  └──────────────────────────────┘   │
//! │                                   │                                     │
//! │               FastForward(500)? ──┴── CatchupComplete                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handoff
//!
//! Follow starts strictly after the snapshot's high-water serial. Every fact
//! at or below it was either in the snapshot or did not match, so the handoff
//! has no gap and no duplicate.
//!
//! ## Consuming
//!
//! [`Subscription`] is pull based (`next().await` or `futures::Stream`).
//! [`FactStore::observe`](crate::FactStore::observe) drives a
//! [`FactObserver`] from a pump task instead.
//!
//! ## Errors
//!
//! Database errors during catchup, script failures and missing
//! transformations end the subscription with an `Err` item. During follow a
//! transient database error is retried on the next wake-up, up to
//! `follow_max_consecutive_errors` in a row.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::blacklist::Blacklist;
use crate::catchup::CatchupScan;
use crate::config::StoreConfig;
use crate::error::{BoxError, Error, Result};
use crate::follow::FollowHub;
use crate::matcher::{SpecMatcher, SqlFilter};
use crate::metrics::{MetricsSink, FOLLOW_REQUERY};
use crate::pipeline::DeliveryPipeline;
use crate::reader::ReaderPool;
use crate::script::PredicateCache;
use crate::transform::Transformer;
use crate::types::{Fact, Serial, StartPosition, SubscriptionRequest};

/// Buffered events per subscription. A full buffer pauses the producer.
const SUBSCRIPTION_BUFFER: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// An item delivered by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A matching fact, shaped for the requested version.
    Fact(Fact),
    /// No matching fact exists up to this serial; consumers may persist it
    /// as their position.
    FastForward(Serial),
    /// History has been delivered. Follow (if any) starts now.
    CatchupComplete,
    /// A catchup-only subscription has ended.
    Complete,
}

// =============================================================================
// Shared Context
// =============================================================================

/// Store-wide components every subscription uses.
pub(crate) struct SubscriptionContext {
    pub(crate) path: PathBuf,
    pub(crate) reader: ReaderPool,
    pub(crate) hub: Arc<FollowHub>,
    pub(crate) blacklist: Arc<Blacklist>,
    pub(crate) transformer: Arc<Transformer>,
    pub(crate) predicates: PredicateCache,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) config: StoreConfig,
}

/// Cooperative cancellation flag with a wake-up for a single waiter.
#[derive(Default)]
struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A running subscription.
///
/// Dropping it cancels delivery; [`close`](Self::close) additionally waits
/// until the background task has released its database session.
pub struct Subscription {
    rx: mpsc::Receiver<Result<SubscriptionEvent>>,
    cancel: Arc<CancelSignal>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Validates the request, compiles its predicates and starts delivery.
    pub(crate) fn start(ctx: Arc<SubscriptionContext>, request: SubscriptionRequest) -> Result<Self> {
        request.validate()?;
        let matcher = SpecMatcher::with_cache(&request.specs, &ctx.predicates)?;
        let pipeline = Arc::new(DeliveryPipeline::new(
            matcher,
            Arc::clone(&ctx.blacklist),
            Arc::clone(&ctx.transformer),
            ctx.config.skip_missing_transformation,
            request.label(),
        ));
        let filter = Arc::new(SqlFilter::from_specs(&request.specs));

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = Arc::new(CancelSignal::default());
        let driver = Driver {
            ctx,
            pipeline,
            filter,
            tx,
            cancel: Arc::clone(&cancel),
            label: request.label().to_string(),
        };
        let task = tokio::spawn(driver.run(request));

        Ok(Self {
            rx,
            cancel,
            task: Some(task),
        })
    }

    /// Receives the next event. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<SubscriptionEvent>> {
        self.rx.recv().await
    }

    /// Stops delivery and waits for the background task to finish.
    ///
    /// No event is produced after this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "subscription task failed");
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Result<SubscriptionEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Background task producing a subscription's events.
struct Driver {
    ctx: Arc<SubscriptionContext>,
    pipeline: Arc<DeliveryPipeline>,
    filter: Arc<SqlFilter>,
    tx: mpsc::Sender<Result<SubscriptionEvent>>,
    cancel: Arc<CancelSignal>,
    label: String,
}

impl Driver {
    async fn run(self, request: SubscriptionRequest) {
        if let Err(e) = self.drive(&request).await {
            if !self.cancel.is_cancelled() {
                warn!(subscription = %self.label, error = %e, "subscription failed");
                let _ = self.tx.send(Err(e)).await;
            }
        }
        debug!(subscription = %self.label, "subscription ended");
    }

    async fn drive(&self, request: &SubscriptionRequest) -> Result<()> {
        let mut last = match request.start {
            StartPosition::Beginning => Serial::ZERO,
            StartPosition::After(serial) => serial,
            StartPosition::Now => self.ctx.reader.latest_serial().await?.unwrap_or(Serial::ZERO),
        };

        if request.start != StartPosition::Now {
            let Some(high_water) = self.catchup(last).await? else {
                return Ok(());
            };
            last = last.max(high_water);
        }

        if !self.emit(SubscriptionEvent::CatchupComplete).await {
            return Ok(());
        }
        if !request.continuous {
            self.emit(SubscriptionEvent::Complete).await;
            return Ok(());
        }

        self.follow(last, self.ctx.config.effective_latency(request.max_latency))
            .await
    }

    /// Sends an event. Returns false if the consumer is gone.
    async fn emit(&self, event: SubscriptionEvent) -> bool {
        !self.cancel.is_cancelled() && self.tx.send(Ok(event)).await.is_ok()
    }

    /// Runs the catchup scan on a blocking thread.
    ///
    /// Returns the serial follow continues after, or `None` if cancelled.
    async fn catchup(&self, after: Serial) -> Result<Option<Serial>> {
        let ctx = Arc::clone(&self.ctx);
        let pipeline = Arc::clone(&self.pipeline);
        let filter = Arc::clone(&self.filter);
        let cancel = Arc::clone(&self.cancel);
        let tx = self.tx.clone();
        let label = self.label.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let scan = CatchupScan {
                filter: &filter,
                after,
                chunk_size: ctx.config.catchup_chunk_size,
                pipeline: &pipeline,
                cancel: &cancel.flag,
                metrics: ctx.metrics.as_ref(),
                label: &label,
            };
            scan.run(&ctx.path, |fact| {
                tx.blocking_send(Ok(SubscriptionEvent::Fact(fact))).is_ok()
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("catchup task failed: {e}")))??;

        if outcome.cancelled {
            return Ok(None);
        }

        let reached = outcome.last_delivered.unwrap_or(after);
        if outcome.high_water > reached && !self.emit(SubscriptionEvent::FastForward(outcome.high_water)).await {
            return Ok(None);
        }
        Ok(Some(outcome.high_water))
    }

    /// Tails facts after `last` until cancelled.
    async fn follow(&self, mut last: Serial, latency: std::time::Duration) -> Result<()> {
        let registration = self.ctx.hub.register(latency);
        let limit = self.ctx.config.follow_batch_limit;
        let mut consecutive_errors = 0;
        debug!(subscription = %self.label, after = %last, latency_ms = latency.as_millis() as u64, "following");

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.ctx.metrics.count(FOLLOW_REQUERY, 1);
            let fetched = match self.requery(&mut last, limit).await {
                Ok(Some(fetched)) => {
                    consecutive_errors = 0;
                    fetched
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_transient() => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.ctx.config.follow_max_consecutive_errors {
                        return Err(e);
                    }
                    warn!(
                        subscription = %self.label,
                        error = %e,
                        attempt = consecutive_errors,
                        "follow query failed, retrying on next wake-up"
                    );
                    0
                }
                Err(e) => return Err(e),
            };

            // A full page means more facts are already waiting.
            if fetched == limit {
                continue;
            }

            tokio::select! {
                _ = registration.notified() => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Fetches and delivers the next page after `last`.
    ///
    /// Returns the number of rows fetched, or `None` if the consumer is gone.
    async fn requery(&self, last: &mut Serial, limit: usize) -> Result<Option<usize>> {
        let facts = self
            .ctx
            .reader
            .facts_after(Arc::clone(&self.filter), *last, limit)
            .await?;
        let fetched = facts.len();
        if fetched == 0 {
            return Ok(Some(0));
        }

        // Scripts and transformations may block; keep them off the runtime.
        let pipeline = Arc::clone(&self.pipeline);
        let (processed, failure) = tokio::task::spawn_blocking(move || {
            let mut processed = Vec::with_capacity(facts.len());
            for fact in facts {
                let serial = fact.serial();
                match pipeline.process(fact) {
                    Ok(delivered) => processed.push((serial, delivered)),
                    Err(e) => return (processed, Some(e)),
                }
            }
            (processed, None)
        })
        .await
        .map_err(|e| Error::Internal(format!("follow task failed: {e}")))?;

        for (serial, delivered) in processed {
            if let Some(fact) = delivered {
                if !self.emit(SubscriptionEvent::Fact(fact)).await {
                    return Ok(None);
                }
            }
            if let Some(serial) = serial {
                *last = serial;
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(Some(fetched)),
        }
    }
}

// =============================================================================
// Observer API
// =============================================================================

/// Push-style consumer of a subscription.
///
/// Callbacks run on a dedicated pump task, one at a time and in order.
pub trait FactObserver: Send + 'static {
    /// A matching fact. Returning an error closes the subscription and
    /// reports [`Error::Observer`] through [`on_error`](Self::on_error).
    fn on_next(&mut self, fact: Fact) -> std::result::Result<(), BoxError>;

    /// History has been delivered.
    fn on_catchup(&mut self) {}

    /// Nothing matched up to `serial`.
    fn on_fast_forward(&mut self, serial: Serial) {
        let _ = serial;
    }

    /// A catchup-only subscription has ended.
    fn on_complete(&mut self) {}

    /// The subscription ended with an error.
    fn on_error(&mut self, error: Error) {
        let _ = error;
    }
}

/// A subscription driving a [`FactObserver`].
pub struct ObservedSubscription {
    stop: Arc<CancelSignal>,
    pump: Option<JoinHandle<()>>,
}

impl ObservedSubscription {
    pub(crate) fn start<O: FactObserver>(subscription: Subscription, observer: O) -> Self {
        let stop = Arc::new(CancelSignal::default());
        let pump = tokio::spawn(pump(subscription, observer, Arc::clone(&stop)));
        Self {
            stop,
            pump: Some(pump),
        }
    }

    /// Returns true once the pump has stopped (completed, failed or closed).
    pub fn is_finished(&self) -> bool {
        self.pump.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the subscription. No callback runs after this returns.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "observer pump failed");
            }
        }
    }
}

impl Drop for ObservedSubscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn pump<O: FactObserver>(mut subscription: Subscription, mut observer: O, stop: Arc<CancelSignal>) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            item = subscription.next() => item,
        };
        if stop.is_cancelled() {
            break;
        }

        match item {
            None => break,
            Some(Ok(SubscriptionEvent::Fact(fact))) => {
                if let Err(e) = observer.on_next(fact) {
                    observer.on_error(Error::Observer(e));
                    break;
                }
            }
            Some(Ok(SubscriptionEvent::FastForward(serial))) => observer.on_fast_forward(serial),
            Some(Ok(SubscriptionEvent::CatchupComplete)) => observer.on_catchup(),
            Some(Ok(SubscriptionEvent::Complete)) => {
                observer.on_complete();
                break;
            }
            Some(Err(e)) => {
                observer.on_error(e);
                break;
            }
        }
    }
    subscription.close().await;
}
