//! Change notification bus
//!
//! One bus is created at start-up and handed to every component that
//! publishes or observes local changes. Delivery is best-effort and
//! at-most-once per subscriber: there is no replay, and a subscriber that
//! falls behind skips what it missed. Observers re-read the store rather
//! than trusting event payloads, so a missed event only delays a refresh.
//!
//! ```text
//! UpsertEngine ──publish──► ChangeBus ──► subscribe() stream ──► debounce ──► refresh
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::debounce::spawn_debounced;

/// Which locally visible aggregate changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    ProgressEntry,
    ActivitySnapshot,
    SleepSession,
    Profile,
}

/// Notification that a local record may have changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub model_type: ModelType,
}

impl ChangeEvent {
    pub fn progress_entry(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            model_type: ModelType::ProgressEntry,
        }
    }
}

/// Broadcast bus for change events
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    /// Create a new bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new bus with the given per-subscriber buffer
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber
    pub fn publish(&self, event: ChangeEvent) {
        trace!(event = ?event, "Publishing change event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Stream of events published from now on.
    ///
    /// Lagged gaps are skipped; the stream ends when the bus is dropped.
    pub fn subscribe(&self) -> BoxStream<'static, ChangeEvent> {
        Box::pin(stream::unfold(self.sender.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Change subscriber lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    /// Subscribe and run `on_quiet` once per quiet period of `window`
    /// (`sync.notify_debounce_ms` in config) with the events it coalesced.
    ///
    /// The task ends after the bus is dropped.
    pub fn spawn_debounced_observer<F, Fut>(&self, window: Duration, on_quiet: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<ChangeEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(window_ms = window.as_millis() as u64, "Debounced change observer started");
        spawn_debounced(self.subscribe(), window, on_quiet)
    }

    /// Raw broadcast receiver
    pub fn receiver(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
