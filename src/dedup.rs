//! Deduplication and upsert engine
//!
//! Decides whether an incoming sample is new, a change to the still-open
//! bucket, or a duplicate, and performs the write together with its outbox
//! event in a single store transaction.
//!
//! ```text
//! sample ─► validate ─► day lookup (user, metric, date) ─► match bucket
//!                                                  │
//!            none ─► insert + "created" event ─────┤
//!   open & changed ─► update + "updated" event ────┼─► commit ─► publish ChangeEvent
//!        otherwise ─► no write ────────────────────┘
//! ```
//!
//! A change event is published for every outcome, duplicates included, so
//! day-level aggregates are re-derived after every ingest pass.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{format_timestamp, Clock};
use crate::db::{outbox, progress, LocalStore, NewOutboxEvent, OutboxEventType, ProgressEntry, SyncStatus};
use crate::error::{SyncError, ValidationError};
use crate::events::{ChangeBus, ChangeEvent};
use crate::metric::{BucketGranularity, MetricType};
use crate::outbox::OutboxProcessor;

/// Maximum length of free-text notes, in characters
pub const MAX_NOTES_LEN: usize = 500;

/// One time-bucketed sample from the external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleObservation {
    pub user_id: String,
    pub metric_type: MetricType,
    /// Already normalised to the metric's unit
    pub quantity: f64,
    pub date: NaiveDate,
    pub bucket_time: Option<NaiveTime>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SampleObservation {
    /// Check the sample against its metric's parameters
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyUserId);
        }

        if !self.quantity.is_finite() {
            return Err(ValidationError::NonFiniteQuantity {
                quantity: self.quantity,
            });
        }

        let params = self.metric_type.params();
        if self.quantity < params.min || self.quantity > params.max {
            return Err(ValidationError::QuantityOutOfRange {
                metric: self.metric_type,
                quantity: self.quantity,
                min: params.min,
                max: params.max,
            });
        }

        if let Some(notes) = &self.notes {
            let len = notes.chars().count();
            if len > MAX_NOTES_LEN {
                return Err(ValidationError::NotesTooLong {
                    len,
                    max: MAX_NOTES_LEN,
                });
            }
        }

        match (params.granularity, self.bucket_time) {
            (BucketGranularity::Hourly, None) => Err(ValidationError::MissingBucket {
                metric: self.metric_type,
            }),
            (BucketGranularity::Hourly, Some(bucket)) if !params.granularity.is_aligned(bucket) => {
                Err(ValidationError::MisalignedBucket {
                    bucket: bucket.to_string(),
                })
            }
            (BucketGranularity::Daily, Some(_)) => Err(ValidationError::UnexpectedBucket {
                metric: self.metric_type,
            }),
            _ => Ok(()),
        }
    }
}

/// What an upsert did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { entry_id: String },
    Updated { entry_id: String, previous_quantity: f64 },
    DuplicateNoop { entry_id: String },
}

impl UpsertOutcome {
    pub fn entry_id(&self) -> &str {
        match self {
            UpsertOutcome::Created { entry_id }
            | UpsertOutcome::Updated { entry_id, .. }
            | UpsertOutcome::DuplicateNoop { entry_id } => entry_id,
        }
    }

    /// Whether a row was written (and an outbox event queued)
    pub fn wrote(&self) -> bool {
        !matches!(self, UpsertOutcome::DuplicateNoop { .. })
    }
}

/// Priorities and attempt budget for events the engine queues
#[derive(Debug, Clone, Copy)]
pub struct OutboxPolicy {
    pub created_priority: i32,
    pub updated_priority: i32,
    pub max_attempts: u32,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            created_priority: 10,
            updated_priority: 5,
            max_attempts: 5,
        }
    }
}

/// Deduplicating writer for progress entries
pub struct UpsertEngine {
    store: Arc<LocalStore>,
    bus: Arc<ChangeBus>,
    clock: Arc<dyn Clock>,
    policy: OutboxPolicy,
    outbox: Option<Arc<OutboxProcessor>>,
}

impl UpsertEngine {
    pub fn new(store: Arc<LocalStore>, bus: Arc<ChangeBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            policy: OutboxPolicy::default(),
            outbox: None,
        }
    }

    pub fn with_policy(mut self, policy: OutboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Nudge this processor after every write so it drains opportunistically
    pub fn with_outbox(mut self, outbox: Arc<OutboxProcessor>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Insert, update or skip `sample`
    pub async fn upsert(&self, sample: &SampleObservation) -> Result<UpsertOutcome, SyncError> {
        sample.validate()?;

        let now_local = self.clock.now_local();
        let now = format_timestamp(self.clock.now_utc());
        let policy = self.policy;

        let outcome = self.store.with_tx(|tx| {
            let day = progress::find_day_entries(tx, &sample.user_id, sample.metric_type, sample.date)?;
            let existing = day.into_iter().find(|e| e.bucket_time == sample.bucket_time);

            match existing {
                None => {
                    let entry = ProgressEntry {
                        id: uuid::Uuid::new_v4().to_string(),
                        user_id: sample.user_id.clone(),
                        metric_type: sample.metric_type,
                        quantity: sample.quantity,
                        date: sample.date,
                        bucket_time: sample.bucket_time,
                        notes: sample.notes.clone(),
                        backend_id: None,
                        sync_status: SyncStatus::Pending,
                        created_at: now.clone(),
                        updated_at: now.clone(),
                    };
                    progress::insert_entry(tx, &entry)?;
                    outbox::insert_event(
                        tx,
                        &NewOutboxEvent {
                            event_type: OutboxEventType::ProgressEntryCreated,
                            entity_id: entry.id.clone(),
                            user_id: entry.user_id.clone(),
                            priority: policy.created_priority,
                            max_attempts: policy.max_attempts,
                        },
                        &now,
                    )?;
                    Ok(UpsertOutcome::Created { entry_id: entry.id })
                }
                Some(entry) => {
                    let open = sample
                        .metric_type
                        .granularity()
                        .is_open(entry.date, entry.bucket_time, now_local);

                    if open && entry.quantity != sample.quantity {
                        progress::update_quantity(tx, &entry.id, sample.quantity, &now)?;
                        outbox::insert_event(
                            tx,
                            &NewOutboxEvent {
                                event_type: OutboxEventType::ProgressEntryUpdated,
                                entity_id: entry.id.clone(),
                                user_id: entry.user_id.clone(),
                                priority: policy.updated_priority,
                                max_attempts: policy.max_attempts,
                            },
                            &now,
                        )?;
                        Ok(UpsertOutcome::Updated {
                            entry_id: entry.id,
                            previous_quantity: entry.quantity,
                        })
                    } else {
                        Ok(UpsertOutcome::DuplicateNoop { entry_id: entry.id })
                    }
                }
            }
        })?;

        debug!(
            metric = %sample.metric_type,
            date = %sample.date,
            bucket = ?sample.bucket_time,
            outcome = ?outcome,
            "Sample upserted"
        );

        self.bus.publish(ChangeEvent::progress_entry(outcome.entry_id()));

        if outcome.wrote() {
            if let Some(outbox) = &self.outbox {
                outbox.nudge();
            }
        }

        Ok(outcome)
    }

    /// Sum of a metric for one user and day
    pub fn day_total(&self, user_id: &str, metric_type: MetricType, date: NaiveDate) -> Result<f64, SyncError> {
        self.store
            .with_conn(|conn| progress::day_total(conn, user_id, metric_type, date))
    }
}
