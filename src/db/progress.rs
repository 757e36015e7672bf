//! Progress entry rows

use chrono::{NaiveDate, NaiveTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::metric::MetricType;

/// Delivery state of an entry as seen by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(FromSqlError::Other(format!("unknown sync status: {}", other).into())),
        }
    }
}

impl ToSql for MetricType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MetricType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A single time-bucketed measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: String,
    pub user_id: String,
    pub metric_type: MetricType,
    pub quantity: f64,
    pub date: NaiveDate,
    /// Start of the sub-day bucket; `None` for daily metrics
    pub bucket_time: Option<NaiveTime>,
    pub notes: Option<String>,
    pub backend_id: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl ProgressEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            metric_type: row.get("metric_type")?,
            quantity: row.get("quantity")?,
            date: row.get("date")?,
            bucket_time: row.get("bucket_time")?,
            notes: row.get("notes")?,
            backend_id: row.get("backend_id")?,
            sync_status: row.get("sync_status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, user_id, metric_type, quantity, date, bucket_time, notes, \
     backend_id, sync_status, created_at, updated_at";

/// Get an entry by ID
pub fn get_entry(conn: &Connection, id: &str) -> Result<Option<ProgressEntry>, SyncError> {
    let sql = format!("SELECT {} FROM progress_entries WHERE id = ?", ENTRY_COLUMNS);
    conn.query_row(&sql, params![id], ProgressEntry::from_row)
        .optional()
        .map_err(|e| SyncError::Storage(format!("Failed to load entry {}: {}", id, e)))
}

/// Entries for one user, metric and day.
///
/// This is the only lookup on the ingest path; it is served by the
/// (user_id, metric_type, date) index and never scans the table.
pub fn find_day_entries(
    conn: &Connection,
    user_id: &str,
    metric_type: MetricType,
    date: NaiveDate,
) -> Result<Vec<ProgressEntry>, SyncError> {
    let sql = format!(
        "SELECT {} FROM progress_entries
         WHERE user_id = ?1 AND metric_type = ?2 AND date = ?3
         ORDER BY bucket_time",
        ENTRY_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Storage(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![user_id, metric_type, date], ProgressEntry::from_row)
        .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Storage(format!("Row parse failed: {}", e)))
}

/// Insert a new entry
pub fn insert_entry(conn: &Connection, entry: &ProgressEntry) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO progress_entries (
            id, user_id, metric_type, quantity, date, bucket_time, notes,
            backend_id, sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id,
            entry.user_id,
            entry.metric_type,
            entry.quantity,
            entry.date,
            entry.bucket_time,
            entry.notes,
            entry.backend_id,
            entry.sync_status,
            entry.created_at,
            entry.updated_at,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to insert entry: {}", e)))?;

    debug!(id = %entry.id, metric = %entry.metric_type, date = %entry.date, "Entry inserted");
    Ok(())
}

/// Overwrite an entry's quantity and put it back in the pending state
pub fn update_quantity(
    conn: &Connection,
    id: &str,
    quantity: f64,
    updated_at: &str,
) -> Result<bool, SyncError> {
    let changed = conn
        .execute(
            "UPDATE progress_entries
             SET quantity = ?2, sync_status = 'pending', updated_at = ?3
             WHERE id = ?1",
            params![id, quantity, updated_at],
        )
        .map_err(|e| SyncError::Storage(format!("Failed to update entry {}: {}", id, e)))?;
    Ok(changed > 0)
}

/// Record a backend acceptance.
///
/// The entry only becomes `synced` when no other live outbox event still
/// references it; a newer pending update keeps it `pending`.
pub fn mark_delivered(
    conn: &Connection,
    id: &str,
    backend_id: &str,
    delivered_event_id: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE progress_entries
         SET backend_id = ?2,
             sync_status = CASE
                 WHEN EXISTS (
                     SELECT 1 FROM outbox_events
                     WHERE entity_id = ?1 AND id != ?3
                       AND status IN ('pending', 'in_progress')
                 ) THEN 'pending'
                 ELSE 'synced'
             END
         WHERE id = ?1",
        params![id, backend_id, delivered_event_id],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to mark entry {} delivered: {}", id, e)))?;
    Ok(())
}

pub fn set_sync_status(conn: &Connection, id: &str, status: SyncStatus) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE progress_entries SET sync_status = ?2 WHERE id = ?1",
        params![id, status],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to set status on {}: {}", id, e)))?;
    Ok(())
}

/// Sum of a metric for one user and day, for "today's total" style views
pub fn day_total(
    conn: &Connection,
    user_id: &str,
    metric_type: MetricType,
    date: NaiveDate,
) -> Result<f64, SyncError> {
    conn.query_row(
        "SELECT COALESCE(SUM(quantity), 0.0) FROM progress_entries
         WHERE user_id = ?1 AND metric_type = ?2 AND date = ?3",
        params![user_id, metric_type, date],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("Failed to total day: {}", e)))
}

/// Entries for a user and metric in an inclusive date range, oldest first
pub fn list_range(
    conn: &Connection,
    user_id: &str,
    metric_type: MetricType,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<ProgressEntry>, SyncError> {
    let sql = format!(
        "SELECT {} FROM progress_entries
         WHERE user_id = ?1 AND metric_type = ?2 AND date BETWEEN ?3 AND ?4
         ORDER BY date, bucket_time",
        ENTRY_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Storage(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![user_id, metric_type, from, to], ProgressEntry::from_row)
        .map_err(|e| SyncError::Storage(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Storage(format!("Row parse failed: {}", e)))
}

pub fn delete_user_entries(conn: &Connection, user_id: &str) -> Result<usize, SyncError> {
    conn.execute("DELETE FROM progress_entries WHERE user_id = ?", params![user_id])
        .map_err(|e| SyncError::Storage(format!("Failed to delete entries: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{apply_plan, MigrationPlan};

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_plan(&mut conn, &MigrationPlan::current()).unwrap();
        conn
    }

    fn entry(id: &str, hour: u32, quantity: f64) -> ProgressEntry {
        ProgressEntry {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            metric_type: MetricType::Steps,
            quantity,
            date: NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
            bucket_time: NaiveTime::from_hms_opt(hour, 0, 0),
            notes: None,
            backend_id: None,
            sync_status: SyncStatus::Pending,
            created_at: "2026-04-02T10:00:00.000000Z".to_string(),
            updated_at: "2026-04-02T10:00:00.000000Z".to_string(),
        }
    }

    #[test]
    fn test_insert_and_find_day() {
        let conn = conn();
        insert_entry(&conn, &entry("b", 10, 50.0)).unwrap();
        insert_entry(&conn, &entry("a", 9, 100.0)).unwrap();

        let found = find_day_entries(
            &conn,
            "user-1",
            MetricType::Steps,
            NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
        )
        .unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "a");
        assert_eq!(found[0].bucket_time, NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(get_entry(&conn, "b").unwrap().unwrap().quantity, 50.0);
    }

    #[test]
    fn test_dedup_key_is_unique() {
        let conn = conn();
        insert_entry(&conn, &entry("a", 9, 100.0)).unwrap();
        let err = insert_entry(&conn, &entry("b", 9, 120.0)).unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn test_daily_dedup_key_with_null_bucket() {
        let conn = conn();
        let mut first = entry("a", 0, 70.0);
        first.metric_type = MetricType::Weight;
        first.bucket_time = None;
        let mut second = first.clone();
        second.id = "b".to_string();

        insert_entry(&conn, &first).unwrap();
        assert!(insert_entry(&conn, &second).is_err());
    }

    #[test]
    fn test_day_total() {
        let conn = conn();
        insert_entry(&conn, &entry("a", 9, 100.0)).unwrap();
        insert_entry(&conn, &entry("b", 10, 250.0)).unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 4, 2).unwrap();
        assert_eq!(day_total(&conn, "user-1", MetricType::Steps, date).unwrap(), 350.0);
        assert_eq!(day_total(&conn, "user-2", MetricType::Steps, date).unwrap(), 0.0);
    }
}
