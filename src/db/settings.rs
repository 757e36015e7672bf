//! Key-value settings records

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SyncError;

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, SyncError> {
    conn.query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| row.get(0))
        .optional()
        .map_err(|e| SyncError::Storage(format!("Failed to read setting {}: {}", key, e)))
}

pub fn put(conn: &Connection, key: &str, value: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![key, value],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to write setting {}: {}", key, e)))?;
    Ok(())
}

pub fn delete(conn: &Connection, key: &str) -> Result<bool, SyncError> {
    let removed = conn
        .execute("DELETE FROM settings WHERE key = ?", params![key])
        .map_err(|e| SyncError::Storage(format!("Failed to delete setting {}: {}", key, e)))?;
    Ok(removed > 0)
}

/// Delete every key starting with `prefix`, returning how many went
pub fn delete_prefix(conn: &Connection, prefix: &str) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM settings WHERE substr(key, 1, length(?1)) = ?1",
        params![prefix],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to delete settings under {}: {}", prefix, e)))
}
