//! SQLite local store
//!
//! The single source of truth for progress entries, outbox events and the
//! sync-window sets. Every mutation goes through [`LocalStore::with_tx`], and
//! the connection mutex makes the store a single writer.
//!
//! ## Tables
//!
//! - `progress_entries` - one row per (user, metric, date, bucket)
//! - `outbox_events` - durable delivery intents for the backend
//! - `settings` - small key-value records (sync windows)
//! - `schema_version` - on-disk schema version
//!
//! A store can only be opened with a [`MigrationPlan`]; there is no
//! constructor that skips migrations.

pub mod schema;
pub mod progress;
pub mod outbox;
pub mod settings;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SyncError;

pub use schema::{MigrationPlan, SchemaVersion, CURRENT_SCHEMA_VERSION};

/// SQLite-backed local store
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    schema_version: u32,
}

impl LocalStore {
    /// Open or create the store at `db_path`, migrating it with `plan`
    pub fn open(db_path: &Path, plan: &MigrationPlan) -> Result<Self, SyncError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers alongside the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SyncError::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        Self::init(conn, Some(db_path.to_path_buf()), plan)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(plan: &MigrationPlan) -> Result<Self, SyncError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::init(conn, None, plan)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>, plan: &MigrationPlan) -> Result<Self, SyncError> {
        let schema_version = schema::apply_plan(&mut conn, plan)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            schema_version,
        })
    }

    /// Schema version the store was opened at
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Connection) -> Result<T, SyncError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside a transaction; commits on `Ok`, rolls back on `Err`
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, SyncError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))?;

        let tx = conn
            .transaction()
            .map_err(|e| SyncError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| SyncError::Storage(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }

    /// Delete a user's entries and outbox events and clear every sync window
    /// in one transaction.
    ///
    /// Windows are cleared together with the rows so a later sync cannot skip
    /// a date whose data was erased.
    pub fn erase_user_data(&self, user_id: &str) -> Result<EraseSummary, SyncError> {
        let summary = self.with_tx(|tx| {
            let entries_deleted = progress::delete_user_entries(tx, user_id)?;
            let events_deleted = outbox::delete_user_events(tx, user_id)?;
            let windows_cleared = crate::sync_window::clear_all_windows(tx)?;
            Ok(EraseSummary {
                entries_deleted,
                events_deleted,
                windows_cleared,
            })
        })?;

        info!(
            user_id = %user_id,
            entries = summary.entries_deleted,
            events = summary.events_deleted,
            windows = summary.windows_cleared,
            "Erased user data"
        );
        Ok(summary)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, SyncError> {
        self.with_conn(|conn| {
            let entry_count: i64 = conn
                .query_row("SELECT COUNT(*) FROM progress_entries", [], |row| row.get(0))
                .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

            let unsynced_entries: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM progress_entries WHERE sync_status != 'synced'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

            Ok(DbStats {
                schema_version: self.schema_version,
                entry_count: entry_count as u64,
                unsynced_entries: unsynced_entries as u64,
                outbox: outbox::count_by_status(conn)?,
            })
        })
    }
}

/// Rows removed by a bulk erase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EraseSummary {
    pub entries_deleted: usize,
    pub events_deleted: usize,
    pub windows_cleared: usize,
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub schema_version: u32,
    pub entry_count: u64,
    pub unsynced_entries: u64,
    pub outbox: outbox::OutboxCounts,
}

// Re-exports
pub use progress::{ProgressEntry, SyncStatus};
pub use outbox::{NewOutboxEvent, OutboxCounts, OutboxEvent, OutboxEventType, OutboxStatus};
