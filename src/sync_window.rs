//! Sync window tracker
//!
//! Remembers, per metric type, which calendar dates have been fully ingested
//! from the external source so later passes can skip them. Each metric's set
//! is a bounded, date-ordered list stored as one JSON record in the settings
//! table:
//!
//! ```text
//! settings["sync_window:steps"] = ["2026-03-01", "2026-03-02", ...]
//! ```
//!
//! Once a set grows past its retention cap the oldest dates are evicted first.
//! The tracker keeps no copy of its own; every call reads the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::{settings, LocalStore};
use crate::error::SyncError;
use crate::metric::MetricType;

const KEY_PREFIX: &str = "sync_window:";

/// Default number of dates retained per metric
pub const DEFAULT_WINDOW_RETENTION: usize = 400;

fn window_key(metric_type: MetricType) -> String {
    format!("{}{}", KEY_PREFIX, metric_type.as_str())
}

fn load_window(conn: &Connection, metric_type: MetricType) -> Result<BTreeSet<NaiveDate>, SyncError> {
    match settings::get(conn, &window_key(metric_type))? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(BTreeSet::new()),
    }
}

fn save_window(conn: &Connection, metric_type: MetricType, dates: &BTreeSet<NaiveDate>) -> Result<(), SyncError> {
    let raw = serde_json::to_string(dates)?;
    settings::put(conn, &window_key(metric_type), &raw)
}

/// Remove every metric's window. Used by bulk erase inside its transaction.
pub(crate) fn clear_all_windows(conn: &Connection) -> Result<usize, SyncError> {
    settings::delete_prefix(conn, KEY_PREFIX)
}

/// Per-metric record of fully ingested dates
pub struct SyncWindowTracker {
    store: Arc<LocalStore>,
    retention: usize,
}

impl SyncWindowTracker {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self::with_retention(store, DEFAULT_WINDOW_RETENTION)
    }

    pub fn with_retention(store: Arc<LocalStore>, retention: usize) -> Self {
        Self {
            store,
            retention: retention.max(1),
        }
    }

    pub fn is_fully_ingested(&self, metric_type: MetricType, date: NaiveDate) -> Result<bool, SyncError> {
        self.store
            .with_conn(|conn| Ok(load_window(conn, metric_type)?.contains(&date)))
    }

    /// Record `date` as ingested. Idempotent; returns whether it was new.
    pub fn mark_fully_ingested(&self, metric_type: MetricType, date: NaiveDate) -> Result<bool, SyncError> {
        let retention = self.retention;
        let (inserted, evicted) = self.store.with_tx(|tx| {
            let mut dates = load_window(tx, metric_type)?;
            if !dates.insert(date) {
                return Ok((false, 0));
            }

            let mut evicted = 0;
            while dates.len() > retention {
                dates.pop_first();
                evicted += 1;
            }

            save_window(tx, metric_type, &dates)?;
            Ok((true, evicted))
        })?;

        if inserted {
            debug!(metric = %metric_type, date = %date, evicted, "Date marked fully ingested");
        }
        Ok(inserted)
    }

    /// Forget every ingested date for one metric
    pub fn clear(&self, metric_type: MetricType) -> Result<(), SyncError> {
        let removed = self
            .store
            .with_conn(|conn| settings::delete(conn, &window_key(metric_type)))?;
        if removed {
            info!(metric = %metric_type, "Sync window cleared");
        }
        Ok(())
    }

    /// Forget every ingested date for every metric.
    ///
    /// On its own this only forces refetching. A reset that also erases
    /// entries goes through [`LocalStore::erase_user_data`], which clears the
    /// windows in the same transaction.
    pub fn clear_all(&self) -> Result<(), SyncError> {
        let removed = self.store.with_conn(clear_all_windows)?;
        info!(metrics = removed, "All sync windows cleared");
        Ok(())
    }

    /// Ingested dates for a metric, oldest first
    pub fn ingested_dates(&self, metric_type: MetricType) -> Result<Vec<NaiveDate>, SyncError> {
        self.store
            .with_conn(|conn| Ok(load_window(conn, metric_type)?.into_iter().collect()))
    }
}
