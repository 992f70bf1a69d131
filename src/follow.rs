//! # Follow Hub
//!
//! One task per store listens to the writer's commit notifications and fans
//! them out to every following subscription:
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!   writer ─broadcast──►│          FollowHub           │
//!   (after COMMIT)      │                              │
//!                       │  FactsCommitted ─► wake all  │──► Notify ─► subscription 1 ─► re-query
//!                       │  BlacklistChanged ─► reload  │──► Notify ─► subscription 2 ─► re-query
//!                       │  safety timer ────► wake all │──► Notify ─► subscription N ─► re-query
//!                       └──────────────────────────────┘
//! ```
//!
//! A notification carries no facts. Every subscription re-queries
//! `serial > last_delivered` with its own filter, so a missed or coalesced
//! signal only delays delivery until the next one. The safety-net timer ticks
//! at the smallest `max_latency` among the registered subscriptions, which
//! bounds that delay.
//!
//! Wake-ups use [`Notify::notify_one`], which stores a permit when the
//! subscription is busy querying; no signal between two queries is lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::blacklist::Blacklist;
use crate::error::Result;
use crate::reader::ReaderPool;
use crate::writer::Notification;

/// Timer period while nobody is following.
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Reloads the whole blacklist table and swaps it in.
pub(crate) async fn refresh_blacklist(reader: &ReaderPool, blacklist: &Blacklist) -> Result<()> {
    let ids = reader.load_blacklist().await?;
    debug!(blocked = ids.len(), "blacklist refreshed");
    blacklist.replace(ids);
    Ok(())
}

struct Registration {
    wake: Arc<Notify>,
    latency: Duration,
}

#[derive(Default)]
struct HubShared {
    registrations: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    /// Signalled when the registrations change, so the timer is recomputed.
    changed: Notify,
    shutdown: Notify,
}

impl HubShared {
    fn wake_all(&self) {
        for registration in self.registrations.lock().values() {
            registration.wake.notify_one();
        }
    }

    fn timer_period(&self) -> Option<Duration> {
        self.registrations
            .lock()
            .values()
            .map(|r| r.latency)
            .min()
    }
}

/// A subscription's place in the fan-out. Deregisters on drop.
pub(crate) struct FollowRegistration {
    id: u64,
    wake: Arc<Notify>,
    shared: Arc<HubShared>,
}

impl FollowRegistration {
    /// Waits for the next wake-up (commit, blacklist change or timer tick).
    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }
}

impl Drop for FollowRegistration {
    fn drop(&mut self) {
        self.shared.registrations.lock().remove(&self.id);
        self.shared.changed.notify_one();
    }
}

/// Store-wide notification fan-out.
pub(crate) struct FollowHub {
    shared: Arc<HubShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FollowHub {
    /// Spawns the hub task.
    ///
    /// The hub also reloads the blacklist on every `BlacklistChanged`, after a
    /// lagged receive, and every `blacklist_refresh` as a fallback.
    pub(crate) fn spawn(
        notifications: broadcast::Receiver<Notification>,
        reader: ReaderPool,
        blacklist: Arc<Blacklist>,
        blacklist_refresh: Duration,
    ) -> Self {
        let shared = Arc::new(HubShared::default());
        let task = tokio::spawn(run_hub(
            Arc::clone(&shared),
            notifications,
            reader,
            blacklist,
            blacklist_refresh,
        ));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Adds a subscription to the fan-out with its latency bound.
    pub(crate) fn register(&self, latency: Duration) -> FollowRegistration {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        self.shared.registrations.lock().insert(
            id,
            Registration {
                wake: Arc::clone(&wake),
                latency,
            },
        );
        self.shared.changed.notify_one();
        FollowRegistration {
            id,
            wake,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of registered subscriptions.
    pub(crate) fn active(&self) -> usize {
        self.shared.registrations.lock().len()
    }

    /// Stops the hub task and waits for it.
    pub(crate) async fn shutdown(&self) {
        self.shared.shutdown.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "follow hub task failed");
            }
        }
        // Release anyone still parked so their tasks observe the closed store.
        self.shared.wake_all();
    }
}

async fn run_hub(
    shared: Arc<HubShared>,
    mut notifications: broadcast::Receiver<Notification>,
    reader: ReaderPool,
    blacklist: Arc<Blacklist>,
    blacklist_refresh: Duration,
) {
    let mut next_tick = Instant::now() + shared.timer_period().unwrap_or(IDLE_PERIOD);
    let mut next_refresh = Instant::now() + blacklist_refresh;

    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            received = notifications.recv() => match received {
                Ok(Notification::FactsCommitted { .. }) => shared.wake_all(),
                Ok(Notification::BlacklistChanged) => {
                    if let Err(e) = refresh_blacklist(&reader, &blacklist).await {
                        warn!(error = %e, "blacklist refresh failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "follow hub lagged behind notifications");
                    if let Err(e) = refresh_blacklist(&reader, &blacklist).await {
                        warn!(error = %e, "blacklist refresh failed");
                    }
                    shared.wake_all();
                }
                Err(RecvError::Closed) => break,
            },
            _ = sleep_until(next_tick) => {
                shared.wake_all();
                next_tick = Instant::now() + shared.timer_period().unwrap_or(IDLE_PERIOD);
            }
            _ = sleep_until(next_refresh) => {
                if let Err(e) = refresh_blacklist(&reader, &blacklist).await {
                    warn!(error = %e, "periodic blacklist refresh failed");
                }
                next_refresh = Instant::now() + blacklist_refresh;
            }
            _ = shared.changed.notified() => {
                let candidate = Instant::now() + shared.timer_period().unwrap_or(IDLE_PERIOD);
                next_tick = next_tick.min(candidate);
            }
        }
    }

    debug!("follow hub stopped");
}
