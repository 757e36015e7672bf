//! Sync orchestrator
//!
//! Drives one ingest pass over a date range for one metric:
//!
//! ```text
//! for date in from..=to:
//!     tracked && !force        -> Skipped
//!     fetch(metric, date)      -> upsert each sample -> mark ingested
//! ```
//!
//! Each date is fetched on its own so memory and per-call duplicate checks
//! stay bounded by one day of samples. A date is only recorded in the sync
//! window when every sample was stored, and never while the day is still
//! open, since its current bucket can still change.
//!
//! Ranges hold the orchestrator gate shared; a user reset holds it
//! exclusively so erase never interleaves with ingest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::db::{EraseSummary, LocalStore};
use crate::debounce::spawn_debounced;
use crate::dedup::{SampleObservation, UpsertEngine, UpsertOutcome};
use crate::error::{SourceError, SyncError, ValidationError};
use crate::metric::{BucketGranularity, MetricType};
use crate::outbox::OutboxProcessor;
use crate::sync_window::SyncWindowTracker;

/// Signal that the external source has new data for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal {
    pub metric_type: MetricType,
}

/// Platform health data provider
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// All bucketed samples for one metric and one calendar date
    async fn fetch_bucketed_samples(
        &self,
        metric_type: MetricType,
        date: NaiveDate,
    ) -> Result<Vec<SampleObservation>, SourceError>;

    /// Change notifications for `metrics`. Sources without observers never yield.
    fn observe_changes(&self, _metrics: &[MetricType]) -> BoxStream<'static, ChangeSignal> {
        stream::empty().boxed()
    }
}

/// Cooperative cancellation for a running range
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one date of a range
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DateState {
    /// Already fully ingested and not forced
    Skipped,
    Ingested {
        created: u32,
        updated: u32,
        duplicates: u32,
        rejected: u32,
        /// Whether the date was recorded in the sync window
        marked: bool,
    },
    Failed { error: String },
    /// Range stopped before reaching this date
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateReport {
    pub date: NaiveDate,
    pub state: DateState,
}

/// Per-date outcomes of one range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRangeReport {
    pub metric_type: MetricType,
    pub dates: Vec<DateReport>,
    pub cancelled: bool,
    pub permission_denied: bool,
}

impl SyncRangeReport {
    fn new(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            dates: Vec::new(),
            cancelled: false,
            permission_denied: false,
        }
    }

    pub fn state(&self, date: NaiveDate) -> Option<&DateState> {
        self.dates.iter().find(|d| d.date == date).map(|d| &d.state)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, DateState::Skipped))
    }

    pub fn ingested(&self) -> usize {
        self.count(|s| matches!(s, DateState::Ingested { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, DateState::Failed { .. }))
    }

    /// Whether any entry was created or updated
    pub fn wrote_entries(&self) -> bool {
        self.dates.iter().any(|d| {
            matches!(d.state, DateState::Ingested { created, updated, .. } if created + updated > 0)
        })
    }

    fn count(&self, pred: impl Fn(&DateState) -> bool) -> usize {
        self.dates.iter().filter(|d| pred(&d.state)).count()
    }
}

pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    engine: Arc<UpsertEngine>,
    tracker: SyncWindowTracker,
    source: Arc<dyn ExternalSource>,
    clock: Arc<dyn Clock>,
    outbox: Option<Arc<OutboxProcessor>>,
    config: SyncConfig,
    gate: RwLock<()>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<LocalStore>,
        engine: Arc<UpsertEngine>,
        source: Arc<dyn ExternalSource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let tracker = SyncWindowTracker::with_retention(store.clone(), config.window_retention);
        Self {
            store,
            engine,
            tracker,
            source,
            clock,
            outbox: None,
            config,
            gate: RwLock::new(()),
        }
    }

    /// Request an outbox flush after every range that wrote entries
    pub fn with_outbox(mut self, outbox: Arc<OutboxProcessor>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn tracker(&self) -> &SyncWindowTracker {
        &self.tracker
    }

    pub async fn sync_range(
        &self,
        metric_type: MetricType,
        from: NaiveDate,
        to: NaiveDate,
        force: bool,
    ) -> Result<SyncRangeReport, SyncError> {
        self.sync_range_with_cancel(metric_type, from, to, force, &CancelFlag::new())
            .await
    }

    /// Ingest `from..=to` for one metric, oldest date first.
    ///
    /// Per-date failures are reported, not returned. Only an inverted range
    /// is an error.
    pub async fn sync_range_with_cancel(
        &self,
        metric_type: MetricType,
        from: NaiveDate,
        to: NaiveDate,
        force: bool,
        cancel: &CancelFlag,
    ) -> Result<SyncRangeReport, SyncError> {
        if from > to {
            return Err(ValidationError::InvalidRange {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let _gate = self.gate.read().await;
        let mut report = SyncRangeReport::new(metric_type);

        for date in from.iter_days().take_while(|d| *d <= to) {
            if !report.cancelled && !report.permission_denied && cancel.is_cancelled() {
                info!(metric = %metric_type, date = %date, "Sync range cancelled");
                report.cancelled = true;
            }
            if report.cancelled || report.permission_denied {
                report.dates.push(DateReport {
                    date,
                    state: DateState::NotAttempted,
                });
                continue;
            }

            let state = self.sync_date(metric_type, date, force, &mut report).await;
            report.dates.push(DateReport { date, state });
        }

        info!(
            metric = %metric_type,
            from = %from,
            to = %to,
            force,
            ingested = report.ingested(),
            skipped = report.skipped(),
            failed = report.failed(),
            cancelled = report.cancelled,
            permission_denied = report.permission_denied,
            "Sync range finished"
        );

        if report.wrote_entries() {
            if let Some(outbox) = &self.outbox {
                outbox.request_flush();
            }
        }

        Ok(report)
    }

    async fn sync_date(
        &self,
        metric_type: MetricType,
        date: NaiveDate,
        force: bool,
        report: &mut SyncRangeReport,
    ) -> DateState {
        if !force {
            match self.tracker.is_fully_ingested(metric_type, date) {
                Ok(true) => {
                    debug!(metric = %metric_type, date = %date, "Date already ingested, skipping");
                    return DateState::Skipped;
                }
                Ok(false) => {}
                Err(e) => return failed(metric_type, date, &e),
            }
        }

        let fetched = tokio::time::timeout(
            self.config.fetch_timeout(),
            self.source.fetch_bucketed_samples(metric_type, date),
        )
        .await
        .unwrap_or(Err(SourceError::Timeout(self.config.fetch_timeout_ms)));

        let samples = match fetched {
            Ok(samples) => samples,
            Err(e) => {
                if e.is_permission_denied() {
                    report.permission_denied = true;
                }
                return failed(metric_type, date, &e);
            }
        };

        let (mut created, mut updated, mut duplicates, mut rejected) = (0, 0, 0, 0);
        // A storage error fails the date but not the samples after it
        let mut storage_error: Option<SyncError> = None;
        for sample in &samples {
            if sample.metric_type != metric_type || sample.date != date {
                warn!(
                    metric = %metric_type,
                    date = %date,
                    sample_metric = %sample.metric_type,
                    sample_date = %sample.date,
                    "Source returned a sample outside the requested day"
                );
                rejected += 1;
                continue;
            }

            match self.engine.upsert(sample).await {
                Ok(UpsertOutcome::Created { .. }) => created += 1,
                Ok(UpsertOutcome::Updated { .. }) => updated += 1,
                Ok(UpsertOutcome::DuplicateNoop { .. }) => duplicates += 1,
                Err(SyncError::Validation(e)) => {
                    warn!(metric = %metric_type, date = %date, error = %e, "Sample rejected");
                    rejected += 1;
                }
                Err(e) => {
                    warn!(
                        metric = %metric_type,
                        date = %date,
                        bucket = ?sample.bucket_time,
                        error = %e,
                        "Sample upsert failed"
                    );
                    storage_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = storage_error {
            return failed(metric_type, date, &e);
        }

        let day_open = BucketGranularity::Daily.is_open(date, None, self.clock.now_local());
        let marked = if day_open {
            false
        } else {
            match self.tracker.mark_fully_ingested(metric_type, date) {
                Ok(_) => true,
                Err(e) => return failed(metric_type, date, &e),
            }
        };

        debug!(
            metric = %metric_type,
            date = %date,
            samples = samples.len(),
            created,
            updated,
            duplicates,
            rejected,
            marked,
            "Date ingested"
        );

        DateState::Ingested {
            created,
            updated,
            duplicates,
            rejected,
            marked,
        }
    }

    /// Erase a user's entries and outbox events and every sync window.
    ///
    /// Waits for in-flight ranges and blocks new ones until done.
    pub async fn reset_user(&self, user_id: &str) -> Result<EraseSummary, SyncError> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::EmptyUserId.into());
        }

        let _gate = self.gate.write().await;
        self.store.erase_user_data(user_id)
    }

    /// Re-sync recent days whenever the source reports changes.
    ///
    /// Signals are coalesced over `sync.trigger_debounce_ms`; each quiet
    /// period force-syncs `[today - lookback_days, today]` for the metrics
    /// that changed. The task ends when the source's change stream ends.
    pub fn spawn_change_trigger(self: &Arc<Self>, metrics: &[MetricType]) -> JoinHandle<()> {
        let signals = self.source.observe_changes(metrics);
        let window = self.config.trigger_debounce();
        let orchestrator = Arc::clone(self);

        info!(metrics = ?metrics, debounce_ms = self.config.trigger_debounce_ms, "Change trigger started");

        spawn_debounced(signals, window, move |batch: Vec<ChangeSignal>| {
            let orchestrator = Arc::clone(&orchestrator);
            async move {
                let mut changed: Vec<MetricType> = batch.iter().map(|s| s.metric_type).collect();
                changed.sort();
                changed.dedup();

                let today = orchestrator.clock.now_local().date();
                let from = today - Duration::days(i64::from(orchestrator.config.lookback_days));

                for metric_type in changed {
                    if let Err(e) = orchestrator.sync_range(metric_type, from, today, true).await {
                        warn!(metric = %metric_type, error = %e, "Triggered sync failed");
                    }
                }
            }
        })
    }
}

fn failed(metric_type: MetricType, date: NaiveDate, error: &dyn std::fmt::Display) -> DateState {
    warn!(metric = %metric_type, date = %date, error = %error, "Date sync failed");
    DateState::Failed {
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
    }

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_report_counters() {
        let mut report = SyncRangeReport::new(MetricType::Steps);
        report.dates = vec![
            DateReport { date: d(1), state: DateState::Skipped },
            DateReport {
                date: d(2),
                state: DateState::Ingested {
                    created: 0,
                    updated: 0,
                    duplicates: 3,
                    rejected: 0,
                    marked: true,
                },
            },
            DateReport {
                date: d(3),
                state: DateState::Failed { error: "boom".into() },
            },
        ];

        assert_eq!(report.skipped(), 1);
        assert_eq!(report.ingested(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.wrote_entries());
        assert_eq!(report.state(d(1)), Some(&DateState::Skipped));
    }
}
