//! Outbox event rows
//!
//! Status lifecycle:
//!
//! ```text
//! pending ──claim──► in_progress ──ok──► synced
//!    ▲                    │
//!    └──── retry ◄────────┤
//!                         └──exhausted──► failed
//! ```

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InProgress => "in_progress",
            OutboxStatus::Synced => "synced",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Synced | OutboxStatus::Failed)
    }
}

impl ToSql for OutboxStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutboxStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(OutboxStatus::Pending),
            "in_progress" => Ok(OutboxStatus::InProgress),
            "synced" => Ok(OutboxStatus::Synced),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(FromSqlError::Other(format!("unknown outbox status: {}", other).into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxEventType {
    #[serde(rename = "progress_entry.created")]
    ProgressEntryCreated,
    #[serde(rename = "progress_entry.updated")]
    ProgressEntryUpdated,
}

impl OutboxEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxEventType::ProgressEntryCreated => "progress_entry.created",
            OutboxEventType::ProgressEntryUpdated => "progress_entry.updated",
        }
    }
}

impl ToSql for OutboxEventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutboxEventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "progress_entry.created" => Ok(OutboxEventType::ProgressEntryCreated),
            "progress_entry.updated" => Ok(OutboxEventType::ProgressEntryUpdated),
            other => Err(FromSqlError::Other(format!("unknown outbox event type: {}", other).into())),
        }
    }
}

/// Durable intent to push one entity to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub event_type: OutboxEventType,
    pub entity_id: String,
    pub user_id: String,
    pub status: OutboxStatus,
    pub created_at: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<String>,
    /// Earliest time a retry may be attempted
    pub next_attempt_at: Option<String>,
    pub error_message: Option<String>,
    pub priority: i32,
}

impl OutboxEvent {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            entity_id: row.get("entity_id")?,
            user_id: row.get("user_id")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            last_attempt_at: row.get("last_attempt_at")?,
            next_attempt_at: row.get("next_attempt_at")?,
            error_message: row.get("error_message")?,
            priority: row.get("priority")?,
        })
    }
}

/// Input for creating an outbox event
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: OutboxEventType,
    pub entity_id: String,
    pub user_id: String,
    pub priority: i32,
    pub max_attempts: u32,
}

/// Event counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub synced: u64,
    pub failed: u64,
}

const EVENT_COLUMNS: &str = "id, event_type, entity_id, user_id, status, created_at, attempt_count, \
     max_attempts, last_attempt_at, next_attempt_at, error_message, priority";

/// Insert a pending event
pub fn insert_event(
    conn: &Connection,
    input: &NewOutboxEvent,
    created_at: &str,
) -> Result<OutboxEvent, SyncError> {
    let event = OutboxEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: input.event_type,
        entity_id: input.entity_id.clone(),
        user_id: input.user_id.clone(),
        status: OutboxStatus::Pending,
        created_at: created_at.to_string(),
        attempt_count: 0,
        max_attempts: input.max_attempts.max(1),
        last_attempt_at: None,
        next_attempt_at: None,
        error_message: None,
        priority: input.priority,
    };

    conn.execute(
        "INSERT INTO outbox_events (
            id, event_type, entity_id, user_id, status, created_at,
            attempt_count, max_attempts, priority
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
        params![
            event.id,
            event.event_type,
            event.entity_id,
            event.user_id,
            event.status,
            event.created_at,
            event.max_attempts,
            event.priority,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to insert outbox event: {}", e)))?;

    debug!(id = %event.id, event_type = event.event_type.as_str(), entity_id = %event.entity_id, "Outbox event queued");
    Ok(event)
}

pub fn get_event(conn: &Connection, id: &str) -> Result<Option<OutboxEvent>, SyncError> {
    let sql = format!("SELECT {} FROM outbox_events WHERE id = ?", EVENT_COLUMNS);
    conn.query_row(&sql, params![id], OutboxEvent::from_row)
        .optional()
        .map_err(|e| SyncError::Storage(format!("Failed to load outbox event {}: {}", id, e)))
}

/// Pending events whose backoff has elapsed, most urgent first
pub fn select_ready(conn: &Connection, now: &str, limit: u32) -> Result<Vec<OutboxEvent>, SyncError> {
    let sql = format!(
        "SELECT {} FROM outbox_events
         WHERE status = 'pending'
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
         ORDER BY priority DESC, created_at ASC, rowid ASC
         LIMIT ?2",
        EVENT_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Storage(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![now, limit], OutboxEvent::from_row)
        .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Storage(format!("Row parse failed: {}", e)))
}

/// Events referencing an entity, oldest first
pub fn events_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<OutboxEvent>, SyncError> {
    let sql = format!(
        "SELECT {} FROM outbox_events WHERE entity_id = ? ORDER BY created_at, rowid",
        EVENT_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Storage(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![entity_id], OutboxEvent::from_row)
        .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Storage(format!("Row parse failed: {}", e)))
}

/// Move a pending event to in_progress. Returns false if someone else
/// already claimed it or it is no longer pending.
pub fn claim(conn: &Connection, id: &str, now: &str) -> Result<bool, SyncError> {
    let claimed = conn
        .execute(
            "UPDATE outbox_events SET status = 'in_progress', last_attempt_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )
        .map_err(|e| SyncError::Storage(format!("Failed to claim outbox event {}: {}", id, e)))?;
    Ok(claimed == 1)
}

pub fn mark_synced(conn: &Connection, id: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE outbox_events
         SET status = 'synced', next_attempt_at = NULL, error_message = NULL
         WHERE id = ?1",
        params![id],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to mark outbox event {} synced: {}", id, e)))?;
    Ok(())
}

/// Record a failed attempt.
///
/// `next_attempt_at = Some(..)` keeps the event pending for a retry;
/// `None` makes the failure terminal.
pub fn record_failure(
    conn: &Connection,
    id: &str,
    attempt_count: u32,
    error_message: &str,
    now: &str,
    next_attempt_at: Option<&str>,
) -> Result<(), SyncError> {
    let status = if next_attempt_at.is_some() {
        OutboxStatus::Pending
    } else {
        OutboxStatus::Failed
    };

    conn.execute(
        "UPDATE outbox_events
         SET status = ?2, attempt_count = ?3, error_message = ?4,
             last_attempt_at = ?5, next_attempt_at = ?6
         WHERE id = ?1",
        params![id, status, attempt_count, error_message, now, next_attempt_at],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to record failure for {}: {}", id, e)))?;
    Ok(())
}

/// Hand a claimed event back to pending without spending an attempt.
/// Only touches events still in_progress.
pub fn release_claim(
    conn: &Connection,
    id: &str,
    next_attempt_at: &str,
    error_message: &str,
) -> Result<bool, SyncError> {
    let released = conn
        .execute(
            "UPDATE outbox_events
             SET status = 'pending', next_attempt_at = ?2, error_message = ?3
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, next_attempt_at, error_message],
        )
        .map_err(|e| SyncError::Storage(format!("Failed to release outbox event {}: {}", id, e)))?;
    Ok(released == 1)
}

/// Return events stranded in in_progress (process died mid-push) to pending
pub fn recover_in_progress(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute(
        "UPDATE outbox_events SET status = 'pending' WHERE status = 'in_progress'",
        [],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to recover in-progress events: {}", e)))
}

/// Operator-requested requeue of failed events with a fresh attempt budget
pub fn requeue_failed(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute(
        "UPDATE outbox_events
         SET status = 'pending', attempt_count = 0, next_attempt_at = NULL
         WHERE status = 'failed'",
        [],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to requeue failed events: {}", e)))
}

/// Delete terminal events created before `before`
pub fn prune_terminal(conn: &Connection, before: &str) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM outbox_events
         WHERE status IN ('synced', 'failed') AND created_at < ?1",
        params![before],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to prune outbox: {}", e)))
}

pub fn delete_user_events(conn: &Connection, user_id: &str) -> Result<usize, SyncError> {
    conn.execute("DELETE FROM outbox_events WHERE user_id = ?", params![user_id])
        .map_err(|e| SyncError::Storage(format!("Failed to delete outbox events: {}", e)))
}

pub fn count_by_status(conn: &Connection) -> Result<OutboxCounts, SyncError> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
        .map_err(|e| SyncError::Storage(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, OutboxStatus>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

    let mut counts = OutboxCounts::default();
    for row in rows {
        let (status, count) = row.map_err(|e| SyncError::Storage(format!("Row parse failed: {}", e)))?;
        let count = count as u64;
        match status {
            OutboxStatus::Pending => counts.pending = count,
            OutboxStatus::InProgress => counts.in_progress = count,
            OutboxStatus::Synced => counts.synced = count,
            OutboxStatus::Failed => counts.failed = count,
        }
    }
    Ok(counts)
}
