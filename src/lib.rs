//! Vitals Sync - local-first sync engine for wearable health measurements
//!
//! Mirrors time-bucketed samples from a platform health source into a local
//! SQLite store and delivers them to a backend through a durable outbox.
//!
//! ## Architecture
//!
//! ```text
//! ExternalSource ──fetch(date)──► SyncOrchestrator ──► UpsertEngine ──tx──► LocalStore
//!                                      │                    │                 │
//!                              SyncWindowTracker        ChangeBus        OutboxProcessor ──► BackendClient
//! ```
//!
//! - **LocalStore**: SQLite, opened only through a [`MigrationPlan`]
//! - **UpsertEngine**: dedup on (user, metric, date, bucket); entry and outbox
//!   event written in one transaction
//! - **SyncWindowTracker**: per-metric set of fully ingested dates
//! - **OutboxProcessor**: at-least-once delivery with exponential backoff
//! - **ChangeBus**: best-effort change notifications, debounced by observers
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/vitals-sync/
//! ├── vitals.db        # Entries, outbox, sync windows, schema version
//! └── config.toml      # Optional configuration
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod debounce;
pub mod dedup;
pub mod error;
pub mod events;
pub mod metric;
pub mod orchestrator;
pub mod outbox;
pub mod sync_window;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{LocalStore, MigrationPlan, ProgressEntry, SchemaVersion, SyncStatus, CURRENT_SCHEMA_VERSION};
pub use dedup::{SampleObservation, UpsertEngine, UpsertOutcome};
pub use error::{DeliveryError, SourceError, SyncError, ValidationError};
pub use events::{ChangeBus, ChangeEvent, ModelType};
pub use metric::{BucketGranularity, MetricType};
pub use orchestrator::{CancelFlag, ChangeSignal, DateState, ExternalSource, SyncOrchestrator, SyncRangeReport};
pub use outbox::{BackendClient, DeliveryOutcome, OutboxProcessor, OutboxResult};
pub use sync_window::SyncWindowTracker;
