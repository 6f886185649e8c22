//! Change notification and the rate-limited event sender.
//!
//! Handlers call [`ChangeNotifier::notify`] as often as they like; the
//! pending flag holds at most one change. A single sender task drains it
//! once per tick, so a burst of changes within one interval turns into at
//! most one [`Event`] downstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Lower bound for the event interval.
pub const MIN_EVENT_INTERVAL: Duration = Duration::from_secs(5);

/// One-slot "configuration may have changed" flag.
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    pending: Arc<AtomicBool>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a change as pending. Returns `false` if one already was.
    pub fn notify(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Clear the pending change, returning whether there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    PrometheusCr,
}

/// Emitted downstream when the generated configuration may differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: EventSource,
    /// Name of the watcher that raised it.
    pub watcher: String,
}

/// Drain `notifier` into `events` at most once per `interval`.
///
/// A full channel re-arms the notifier so the change goes out on a later
/// tick. Exits on shutdown or when the receiver is gone.
pub async fn run_rate_limited_sender(
    notifier: ChangeNotifier,
    interval: Duration,
    events: mpsc::Sender<Event>,
    watcher: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(?interval, "event sender starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !notifier.take() {
                    continue;
                }
                let event = Event {
                    source: EventSource::PrometheusCr,
                    watcher: watcher.clone(),
                };
                match events.try_send(event) {
                    Ok(()) => debug!("change event sent"),
                    Err(TrySendError::Full(_)) => {
                        notifier.notify();
                        debug!("event channel full, retrying next tick");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("event channel closed, stopping sender");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("event sender shutting down");
                break;
            }
        }
    }
}
