//! Shared fixtures: in-memory source and backend fakes plus a wired-up harness
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use vitals_sync::config::{OutboxConfig, SyncConfig};
use vitals_sync::{
    BackendClient, CancelFlag, ChangeBus, ChangeSignal, DeliveryError, ExternalSource, LocalStore,
    ManualClock, MetricType, MigrationPlan, OutboxProcessor, ProgressEntry, SampleObservation,
    SourceError, SyncOrchestrator, UpsertEngine,
};

pub const USER: &str = "user-1";

pub fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, month, day).unwrap()
}

pub fn hour(h: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(h, 0, 0)
}

/// 2026-06-10 09:30 at UTC+2
pub fn start_time() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(2 * 3600)
        .unwrap()
        .with_ymd_and_hms(2026, 6, 10, 9, 30, 0)
        .unwrap()
}

pub fn today() -> NaiveDate {
    date(6, 10)
}

pub fn steps(day: NaiveDate, h: u32, quantity: f64) -> SampleObservation {
    SampleObservation {
        user_id: USER.to_string(),
        metric_type: MetricType::Steps,
        quantity,
        date: day,
        bucket_time: hour(h),
        notes: None,
    }
}

pub fn weight(day: NaiveDate, quantity: f64) -> SampleObservation {
    SampleObservation {
        user_id: USER.to_string(),
        metric_type: MetricType::Weight,
        quantity,
        date: day,
        bucket_time: None,
        notes: None,
    }
}

// =============================================================================
// External source fake
// =============================================================================

#[derive(Default)]
pub struct FakeSource {
    samples: Mutex<HashMap<(MetricType, NaiveDate), Vec<SampleObservation>>>,
    errors: Mutex<HashMap<(MetricType, NaiveDate), SourceError>>,
    fetches: Mutex<Vec<(MetricType, NaiveDate)>>,
    delay: Mutex<Option<Duration>>,
    cancel_on_fetch: Mutex<Option<CancelFlag>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<ChangeSignal>>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_samples(&self, metric: MetricType, day: NaiveDate, samples: Vec<SampleObservation>) {
        self.samples.lock().unwrap().insert((metric, day), samples);
    }

    pub fn fail(&self, metric: MetricType, day: NaiveDate, error: SourceError) {
        self.errors.lock().unwrap().insert((metric, day), error);
    }

    pub fn heal(&self, metric: MetricType, day: NaiveDate) {
        self.errors.lock().unwrap().remove(&(metric, day));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Cancel `flag` as soon as any fetch starts
    pub fn cancel_on_fetch(&self, flag: CancelFlag) {
        *self.cancel_on_fetch.lock().unwrap() = Some(flag);
    }

    pub fn change_sender(&self) -> mpsc::UnboundedSender<ChangeSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.changes.lock().unwrap() = Some(rx);
        tx
    }

    pub fn fetches(&self) -> Vec<(MetricType, NaiveDate)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl ExternalSource for FakeSource {
    async fn fetch_bucketed_samples(
        &self,
        metric_type: MetricType,
        date: NaiveDate,
    ) -> Result<Vec<SampleObservation>, SourceError> {
        self.fetches.lock().unwrap().push((metric_type, date));
        if let Some(flag) = self.cancel_on_fetch.lock().unwrap().as_ref() {
            flag.cancel();
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.errors.lock().unwrap().get(&(metric_type, date)) {
            return Err(error.clone());
        }
        Ok(self
            .samples
            .lock()
            .unwrap()
            .get(&(metric_type, date))
            .cloned()
            .unwrap_or_default())
    }

    fn observe_changes(&self, _metrics: &[MetricType]) -> BoxStream<'static, ChangeSignal> {
        match self.changes.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|s| (s, rx)) }).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

// =============================================================================
// Backend fake
// =============================================================================

#[derive(Default)]
pub struct FakeBackend {
    /// Pushes received, as (entry id, idempotency key, quantity)
    pushes: Mutex<Vec<(String, String, f64)>>,
    failing: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn pushes(&self) -> Vec<(String, String, f64)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn push(&self, entry: &ProgressEntry, idempotency_key: &str) -> Result<String, DeliveryError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.pushes
            .lock()
            .unwrap()
            .push((entry.id.clone(), idempotency_key.to_string(), entry.quantity));

        if *self.failing.lock().unwrap() {
            return Err(DeliveryError::Transport("connection refused".into()));
        }
        Ok(format!("remote-{}", entry.id))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub store: Arc<LocalStore>,
    pub bus: Arc<ChangeBus>,
    pub clock: Arc<ManualClock>,
    pub source: Arc<FakeSource>,
    pub backend: Arc<FakeBackend>,
    pub outbox: Arc<OutboxProcessor>,
    pub engine: Arc<UpsertEngine>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OutboxConfig::default(), SyncConfig::default())
    }

    pub fn with_config(outbox_config: OutboxConfig, sync_config: SyncConfig) -> Self {
        let store = Arc::new(LocalStore::open_in_memory(&MigrationPlan::current()).unwrap());
        Self::with_store(store, outbox_config, sync_config)
    }

    pub fn with_store(store: Arc<LocalStore>, outbox_config: OutboxConfig, sync_config: SyncConfig) -> Self {
        let bus = Arc::new(ChangeBus::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let source = Arc::new(FakeSource::new());
        let backend = Arc::new(FakeBackend::new());

        let policy = outbox_config.policy();
        let outbox = Arc::new(OutboxProcessor::new(
            store.clone(),
            backend.clone(),
            clock.clone(),
            outbox_config,
        ));
        let engine = Arc::new(
            UpsertEngine::new(store.clone(), bus.clone(), clock.clone()).with_policy(policy),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            engine.clone(),
            source.clone(),
            clock.clone(),
            sync_config,
        ));

        Self {
            store,
            bus,
            clock,
            source,
            backend,
            outbox,
            engine,
            orchestrator,
        }
    }

    /// An engine that nudges this harness's outbox after every write.
    /// The default engine does not, so tests control when drains happen.
    pub fn nudging_engine(&self) -> Arc<UpsertEngine> {
        Arc::new(
            UpsertEngine::new(self.store.clone(), self.bus.clone(), self.clock.clone())
                .with_policy(self.outbox.config().policy())
                .with_outbox(self.outbox.clone()),
        )
    }

    pub fn entries(&self, metric: MetricType, from: NaiveDate, to: NaiveDate) -> Vec<ProgressEntry> {
        self.store
            .with_conn(|conn| vitals_sync::db::progress::list_range(conn, USER, metric, from, to))
            .unwrap()
    }

    /// Run raw SQL against the store, used to install failure triggers
    pub fn run_sql(&self, sql: &str) {
        self.store
            .with_conn(|conn| {
                conn.execute_batch(sql)
                    .map_err(|e| vitals_sync::SyncError::Storage(e.to_string()))
            })
            .unwrap();
    }

    pub fn events_for(&self, entity_id: &str) -> Vec<vitals_sync::db::OutboxEvent> {
        self.store
            .with_conn(|conn| vitals_sync::db::outbox::events_for_entity(conn, entity_id))
            .unwrap()
    }
}
