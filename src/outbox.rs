//! Outbox processor
//!
//! Delivers queued outbox events to the backend at least once. Events are
//! written in the same transaction as the entry they describe (see
//! [`crate::dedup`]); this processor only drains them.
//!
//! ```text
//! select_ready ─► claim ─► load entry ─► push (timeout) ─┬─ ok ──► synced, entry.backend_id
//!                                                        └─ err ─► retry w/ backoff | failed
//! ```
//!
//! Drains run one at a time. They are triggered by a periodic timer, by
//! nudges after local writes, and by explicit flush requests. Without the
//! background loop a nudge spawns a one-off drain instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{format_timestamp, Clock};
use crate::config::OutboxConfig;
use crate::db::{outbox, progress, LocalStore, NewOutboxEvent, OutboxCounts, OutboxEvent, ProgressEntry, SyncStatus};
use crate::error::{DeliveryError, SyncError};

/// Remote API that accepts progress entries
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Push one entry. `idempotency_key` is stable across retries of the
    /// same entry. Returns the backend's id for it.
    async fn push(&self, entry: &ProgressEntry, idempotency_key: &str) -> Result<String, DeliveryError>;
}

/// Retry delay after `attempt` failures: `base * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Per-event drain outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxResult {
    pub event_id: String,
    pub entity_id: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Synced { remote_id: String },
    Retrying { attempt: u32, next_attempt_at: String, error: String },
    Failed { attempts: u32, error: String },
}

/// Totals for one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub synced: u64,
    pub retrying: u64,
    pub failed: u64,
    pub batches: u64,
}

impl FlushSummary {
    fn record(&mut self, results: &[OutboxResult]) {
        self.batches += 1;
        for result in results {
            match result.outcome {
                DeliveryOutcome::Synced { .. } => self.synced += 1,
                DeliveryOutcome::Retrying { .. } => self.retrying += 1,
                DeliveryOutcome::Failed { .. } => self.failed += 1,
            }
        }
    }
}

pub struct OutboxProcessor {
    store: Arc<LocalStore>,
    backend: Arc<dyn BackendClient>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    /// Held for the duration of a drain
    drain_lock: Mutex<()>,
    wake: Notify,
    running: AtomicBool,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn BackendClient>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            backend,
            clock,
            config,
            drain_lock: Mutex::new(()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now_utc())
    }

    /// Durably queue an event outside of an entry write, then nudge
    pub fn enqueue(self: &Arc<Self>, input: NewOutboxEvent) -> Result<OutboxEvent, SyncError> {
        let now = self.now();
        let event = self.store.with_conn(|conn| outbox::insert_event(conn, &input, &now))?;
        debug!(event_id = %event.id, entity_id = %event.entity_id, "Outbox event enqueued");
        self.nudge();
        Ok(event)
    }

    /// Ask for an opportunistic drain.
    ///
    /// Wakes the background loop when it is running. Otherwise a one-off
    /// drain is spawned on the current runtime; outside a runtime the nudge
    /// is dropped and events wait for the next explicit drain.
    pub fn nudge(self: &Arc<Self>) {
        if self.running.load(Ordering::SeqCst) {
            self.wake.notify_one();
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for nudge, drain deferred");
            return;
        };
        let processor = Arc::clone(self);
        runtime.spawn(async move {
            loop {
                match processor.try_drain(processor.config.batch_size).await {
                    Ok(Some(results)) if !results.is_empty() => {
                        debug!(delivered = results.len(), "Nudged drain completed");
                    }
                    // Nothing ready, or another drain already has the lock
                    Ok(_) => break,
                    Err(e) => {
                        error!(error = %e, "Nudged drain failed");
                        break;
                    }
                }
            }
        });
    }

    /// Deliver up to `batch_size` ready events, waiting for any drain in flight
    pub async fn drain(&self, batch_size: u32) -> Result<Vec<OutboxResult>, SyncError> {
        let _guard = self.drain_lock.lock().await;
        self.drain_locked(batch_size).await
    }

    /// Like [`drain`](Self::drain) but returns `None` if a drain is already running
    pub async fn try_drain(&self, batch_size: u32) -> Result<Option<Vec<OutboxResult>>, SyncError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in flight, skipping");
            return Ok(None);
        };
        self.drain_locked(batch_size).await.map(Some)
    }

    async fn drain_locked(&self, batch_size: u32) -> Result<Vec<OutboxResult>, SyncError> {
        let now = self.now();
        let ready = self
            .store
            .with_conn(|conn| outbox::select_ready(conn, &now, batch_size))?;

        if ready.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = ready.len(), "Draining outbox");

        let mut results = Vec::with_capacity(ready.len());
        for event in ready {
            let (event_id, entity_id, attempt_count) =
                (event.id.clone(), event.entity_id.clone(), event.attempt_count);
            match self.deliver(event).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    error!(event_id = %event_id, error = %e, "Outbox delivery bookkeeping failed");
                    results.push(self.release_after_error(event_id, entity_id, attempt_count, &e));
                }
            }
        }
        Ok(results)
    }

    /// Put an event whose bookkeeping failed back in the queue. The attempt
    /// is not counted; the push may or may not have reached the backend.
    fn release_after_error(
        &self,
        event_id: String,
        entity_id: String,
        attempt_count: u32,
        cause: &SyncError,
    ) -> OutboxResult {
        let delay = backoff_delay(
            attempt_count.max(1),
            Duration::from_secs(self.config.backoff_base_secs),
            Duration::from_secs(self.config.backoff_max_secs),
        );
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(self.config.backoff_max_secs as i64));
        let next_attempt_at = format_timestamp(self.clock.now_utc() + delay);
        let message = cause.to_string();

        match self
            .store
            .with_conn(|conn| outbox::release_claim(conn, &event_id, &next_attempt_at, &message))
        {
            Ok(_) => {}
            // Left in_progress; recover_interrupted picks it up on the next start
            Err(e) => error!(event_id = %event_id, error = %e, "Failed to release outbox event"),
        }

        OutboxResult {
            event_id,
            entity_id,
            outcome: DeliveryOutcome::Retrying {
                attempt: attempt_count,
                next_attempt_at,
                error: message,
            },
        }
    }

    async fn deliver(&self, event: OutboxEvent) -> Result<Option<OutboxResult>, SyncError> {
        let claimed_at = self.now();
        let claimed = self
            .store
            .with_conn(|conn| outbox::claim(conn, &event.id, &claimed_at))?;
        if !claimed {
            debug!(event_id = %event.id, "Event claimed elsewhere");
            return Ok(None);
        }

        let entry = self
            .store
            .with_conn(|conn| progress::get_entry(conn, &event.entity_id))?;

        let Some(entry) = entry else {
            let attempts = event.attempt_count + 1;
            let message = format!("entity {} no longer exists", event.entity_id);
            let now = self.now();
            self.store.with_conn(|conn| {
                outbox::record_failure(conn, &event.id, attempts, &message, &now, None)
            })?;
            warn!(event_id = %event.id, entity_id = %event.entity_id, "Outbox event references missing entity");
            return Ok(Some(OutboxResult {
                event_id: event.id,
                entity_id: event.entity_id,
                outcome: DeliveryOutcome::Failed { attempts, error: message },
            }));
        };

        let pushed = match tokio::time::timeout(
            self.config.push_timeout(),
            self.backend.push(&entry, &entry.id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.push_timeout_ms)),
        };

        let outcome = match pushed {
            Ok(remote_id) => {
                self.store.with_tx(|tx| {
                    outbox::mark_synced(tx, &event.id)?;
                    progress::mark_delivered(tx, &entry.id, &remote_id, &event.id)
                })?;
                debug!(event_id = %event.id, entity_id = %entry.id, remote_id = %remote_id, "Entry delivered");
                DeliveryOutcome::Synced { remote_id }
            }
            Err(e) => self.record_attempt_failure(&event, &e)?,
        };

        Ok(Some(OutboxResult {
            event_id: event.id,
            entity_id: event.entity_id,
            outcome,
        }))
    }

    fn record_attempt_failure(
        &self,
        event: &OutboxEvent,
        cause: &DeliveryError,
    ) -> Result<DeliveryOutcome, SyncError> {
        let attempt = event.attempt_count + 1;
        let message = cause.to_string();
        let now_utc = self.clock.now_utc();
        let now = format_timestamp(now_utc);

        if attempt < event.max_attempts {
            let delay = backoff_delay(
                attempt,
                Duration::from_secs(self.config.backoff_base_secs),
                Duration::from_secs(self.config.backoff_max_secs),
            );
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(self.config.backoff_max_secs as i64));
            let next_attempt_at = format_timestamp(now_utc + delay);

            self.store.with_conn(|conn| {
                outbox::record_failure(conn, &event.id, attempt, &message, &now, Some(&next_attempt_at))
            })?;
            warn!(
                event_id = %event.id,
                attempt,
                max_attempts = event.max_attempts,
                next_attempt_at = %next_attempt_at,
                error = %message,
                "Delivery failed, will retry"
            );
            Ok(DeliveryOutcome::Retrying {
                attempt,
                next_attempt_at,
                error: message,
            })
        } else {
            self.store.with_tx(|tx| {
                outbox::record_failure(tx, &event.id, attempt, &message, &now, None)?;
                progress::set_sync_status(tx, &event.entity_id, SyncStatus::Failed)
            })?;
            error!(
                event_id = %event.id,
                entity_id = %event.entity_id,
                attempts = attempt,
                error = %message,
                "Delivery attempts exhausted, event failed"
            );
            Ok(DeliveryOutcome::Failed {
                attempts: attempt,
                error: message,
            })
        }
    }

    /// Drain batches until nothing is ready
    pub async fn flush(&self) -> Result<FlushSummary, SyncError> {
        let mut summary = FlushSummary::default();
        loop {
            let results = self.drain(self.config.batch_size).await?;
            if results.is_empty() {
                break;
            }
            summary.record(&results);
        }

        if summary.batches > 0 {
            info!(
                synced = summary.synced,
                retrying = summary.retrying,
                failed = summary.failed,
                batches = summary.batches,
                "Outbox flush completed"
            );
        }
        Ok(summary)
    }

    /// Flush soon without waiting. Goes through the background loop when it
    /// is running, otherwise spawns a one-off flush.
    pub fn request_flush(self: &Arc<Self>) {
        if self.running.load(Ordering::SeqCst) {
            self.wake.notify_one();
            return;
        }

        let processor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = processor.flush().await {
                error!(error = %e, "Requested outbox flush failed");
            }
        });
    }

    /// Start the background drain loop.
    ///
    /// Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox processor already running");
            return None;
        }

        let processor = Arc::clone(self);
        let interval = self.config.drain_interval();

        Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Outbox processor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = processor.wake.notified() => {}
                }

                if !processor.running.load(Ordering::SeqCst) {
                    info!("Outbox processor stopping");
                    break;
                }

                match processor.try_drain(processor.config.batch_size).await {
                    Ok(Some(results)) if !results.is_empty() => {
                        debug!(delivered = results.len(), "Background drain completed");
                        // More may be ready than one batch held
                        processor.wake.notify_one();
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Background drain failed"),
                }
            }
        }))
    }

    /// Stop the background loop after its current drain
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Return events stranded in `in_progress` by a crash to `pending`.
    /// Call once at start-up, before the first drain.
    pub fn recover_interrupted(&self) -> Result<usize, SyncError> {
        let recovered = self.store.with_conn(outbox::recover_in_progress)?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted outbox events");
        }
        Ok(recovered)
    }

    /// Give failed events a fresh attempt budget. Wakes the background
    /// loop if it is running; otherwise the next drain picks them up.
    pub fn retry_failed(&self) -> Result<usize, SyncError> {
        let requeued = self.store.with_conn(outbox::requeue_failed)?;
        info!(requeued, "Failed outbox events requeued");
        if requeued > 0 {
            self.wake.notify_one();
        }
        Ok(requeued)
    }

    /// Delete synced and failed events older than the retention period
    pub fn prune(&self) -> Result<usize, SyncError> {
        let cutoff = self.clock.now_utc() - chrono::Duration::days(i64::from(self.config.retention_days));
        let cutoff = format_timestamp(cutoff);
        let pruned = self
            .store
            .with_conn(|conn| outbox::prune_terminal(conn, &cutoff))?;
        info!(pruned, cutoff = %cutoff, "Outbox pruned");
        Ok(pruned)
    }

    pub fn stats(&self) -> Result<OutboxCounts, SyncError> {
        self.store.with_conn(outbox::count_by_status)
    }
}
