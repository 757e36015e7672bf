//! Schema version registry and migration plan
//!
//! The registry is an ordered, append-only list of [`SchemaVersion`]s. Each
//! version carries the step that upgrades a store from the previous version.
//! A [`MigrationPlan`] is required to open a [`LocalStore`](super::LocalStore);
//! before any step runs the plan must cover every version between the one on
//! disk and its target, otherwise opening fails with
//! [`SyncError::SchemaVersionGap`].

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::SyncError;

/// Latest schema version known to this build
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Migration step: upgrades a store from `version - 1` to `version`
pub type MigrationStep = fn(&Connection) -> Result<(), SyncError>;

/// One entry in the version registry
#[derive(Clone)]
pub struct SchemaVersion {
    pub version: u32,
    pub name: &'static str,
    step: MigrationStep,
}

impl SchemaVersion {
    pub fn new(version: u32, name: &'static str, step: MigrationStep) -> Self {
        Self { version, name, step }
    }

    fn apply(&self, conn: &Connection) -> Result<(), SyncError> {
        (self.step)(conn)
    }
}

impl std::fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaVersion")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// The full registry, oldest first
pub fn versions() -> Vec<SchemaVersion> {
    vec![
        SchemaVersion::new(1, "initial", migrate_v1),
        SchemaVersion::new(2, "hourly_buckets_outbox", migrate_v2),
        SchemaVersion::new(3, "dedup_key_priority_settings", migrate_v3),
    ]
}

/// Ordered set of versions a store is opened with
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    versions: Vec<SchemaVersion>,
}

impl MigrationPlan {
    /// Plan covering the whole registry
    pub fn current() -> Self {
        Self { versions: versions() }
    }

    /// Build a plan from an explicit version list.
    ///
    /// The list is sorted; it must be non-empty and free of duplicate
    /// versions. Gaps are allowed here and detected when a store is opened,
    /// because whether a gap matters depends on the version found on disk.
    pub fn from_versions(mut versions: Vec<SchemaVersion>) -> Result<Self, SyncError> {
        if versions.is_empty() {
            return Err(SyncError::InvalidMigrationPlan(
                "plan has no versions".to_string(),
            ));
        }
        versions.sort_by_key(|v| v.version);
        if let Some(pair) = versions.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(SyncError::InvalidMigrationPlan(format!(
                "version {} listed twice",
                pair[0].version
            )));
        }
        if versions[0].version == 0 {
            return Err(SyncError::InvalidMigrationPlan(
                "version 0 is reserved for an empty store".to_string(),
            ));
        }
        Ok(Self { versions })
    }

    /// Version a store is at after opening with this plan
    pub fn target(&self) -> u32 {
        self.versions.last().map(|v| v.version).unwrap_or(0)
    }

    pub fn versions(&self) -> &[SchemaVersion] {
        &self.versions
    }

    /// Steps needed to bring a store at `on_disk` up to [`target`](Self::target).
    pub fn path_from(&self, on_disk: u32) -> Result<Vec<&SchemaVersion>, SyncError> {
        let target = self.target();
        if on_disk > target {
            return Err(SyncError::SchemaTooNew { on_disk, target });
        }

        let mut path = Vec::new();
        for wanted in (on_disk + 1)..=target {
            let step = self
                .versions
                .iter()
                .find(|v| v.version == wanted)
                .ok_or(SyncError::SchemaVersionGap {
                    on_disk,
                    missing: wanted,
                    target,
                })?;
            path.push(step);
        }
        Ok(path)
    }
}

/// Read the on-disk version without writing anything (0 for a new store)
pub fn get_schema_version(conn: &Connection) -> Result<u32, SyncError> {
    let has_table: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Storage(format!("Failed to inspect schema: {}", e)))?;

    if !has_table {
        return Ok(0);
    }

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| SyncError::Storage(format!("Failed to read schema_version: {}", e)))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), SyncError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to create schema_version table: {}", e)))?;
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| SyncError::Storage(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| SyncError::Storage(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Bring the store up to the plan's target.
///
/// The whole path is resolved first; a gap fails before any step runs. All
/// steps and the version bump share one transaction.
pub fn apply_plan(conn: &mut Connection, plan: &MigrationPlan) -> Result<u32, SyncError> {
    let on_disk = get_schema_version(conn)?;
    let path = plan.path_from(on_disk)?;

    if path.is_empty() {
        info!("Database schema is up to date (v{})", on_disk);
        return Ok(on_disk);
    }

    let target = plan.target();
    if on_disk == 0 {
        info!("Creating new database schema v{}", target);
    } else {
        info!("Migrating schema from v{} to v{}", on_disk, target);
    }

    let tx = conn
        .transaction()
        .map_err(|e| SyncError::Storage(format!("Failed to begin migration: {}", e)))?;

    for step in path {
        info!(version = step.version, name = step.name, "Applying schema step");
        step.apply(&tx)?;
    }
    set_schema_version(&tx, target)?;

    tx.commit()
        .map_err(|e| SyncError::Storage(format!("Failed to commit migration: {}", e)))?;

    Ok(target)
}

fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(V1_SCHEMA)
        .map_err(|e| SyncError::Storage(format!("Failed to apply v1: {}", e)))
}

fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(V2_SCHEMA)
        .map_err(|e| SyncError::Storage(format!("Failed to apply v2: {}", e)))
}

fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    // Rows written before the dedup key existed may collide; the most recently
    // written row for a key wins.
    let collapsed = conn
        .execute(
            "DELETE FROM progress_entries WHERE rowid NOT IN (
                SELECT MAX(rowid) FROM progress_entries
                GROUP BY user_id, metric_type, date, COALESCE(bucket_time, '')
            )",
            [],
        )
        .map_err(|e| SyncError::Storage(format!("Failed to collapse duplicate entries: {}", e)))?;

    if collapsed > 0 {
        warn!(collapsed, "Collapsed duplicate progress entries while adding dedup key");
    }

    // Undelivered events of collapsed rows would only fail as missing entities
    let orphaned = conn
        .execute(
            "DELETE FROM outbox_events
             WHERE status != 'synced'
               AND entity_id NOT IN (SELECT id FROM progress_entries)",
            [],
        )
        .map_err(|e| SyncError::Storage(format!("Failed to drop orphaned outbox events: {}", e)))?;

    if orphaned > 0 {
        warn!(orphaned, "Dropped outbox events of collapsed entries");
    }

    conn.execute_batch(V3_SCHEMA)
        .map_err(|e| SyncError::Storage(format!("Failed to apply v3: {}", e)))
}

/// v1: daily progress entries
const V1_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS progress_entries (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    quantity REAL NOT NULL,
    date TEXT NOT NULL,
    notes TEXT,

    -- Set once the backend accepted the entry
    backend_id TEXT,
    sync_status TEXT NOT NULL DEFAULT 'pending',

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_progress_user_metric_date
    ON progress_entries(user_id, metric_type, date);
"#;

/// v2: sub-day buckets and the outbox
const V2_SCHEMA: &str = r#"
ALTER TABLE progress_entries ADD COLUMN bucket_time TEXT;

CREATE TABLE IF NOT EXISTS outbox_events (
    id TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    last_attempt_at TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox_events(entity_id);
"#;

/// v3: unique dedup key, outbox priority/backoff, settings store
const V3_SCHEMA: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_progress_dedup_key
    ON progress_entries(user_id, metric_type, date, COALESCE(bucket_time, ''));

ALTER TABLE outbox_events ADD COLUMN priority INTEGER NOT NULL DEFAULT 0;
ALTER TABLE outbox_events ADD COLUMN next_attempt_at TEXT;

CREATE INDEX IF NOT EXISTS idx_outbox_ready
    ON outbox_events(status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_user ON outbox_events(user_id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_of(wanted: &[u32]) -> MigrationPlan {
        MigrationPlan::from_versions(
            versions()
                .into_iter()
                .filter(|v| wanted.contains(&v.version))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_store_reaches_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = apply_plan(&mut conn, &MigrationPlan::current()).unwrap();

        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_plan(&mut conn, &MigrationPlan::current()).unwrap();
        let version = apply_plan(&mut conn, &MigrationPlan::current()).unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_gap_detected_before_any_step() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_plan(&mut conn, &plan_of(&[1])).unwrap();

        let err = apply_plan(&mut conn, &plan_of(&[1, 3])).unwrap_err();
        match err {
            SyncError::SchemaVersionGap { on_disk, missing, target } => {
                assert_eq!(on_disk, 1);
                assert_eq!(missing, 2);
                assert_eq!(target, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Nothing was applied
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_plan_without_base_cannot_create_store() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = apply_plan(&mut conn, &plan_of(&[2, 3])).unwrap_err();
        assert!(matches!(err, SyncError::SchemaVersionGap { missing: 1, .. }));
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_newer_store_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_plan(&mut conn, &MigrationPlan::current()).unwrap();

        let err = apply_plan(&mut conn, &plan_of(&[1, 2])).unwrap_err();
        assert!(matches!(err, SyncError::SchemaTooNew { on_disk: 3, target: 2 }));
    }

    #[test]
    fn test_plan_rejects_duplicates_and_empty() {
        assert!(MigrationPlan::from_versions(vec![]).is_err());

        let mut dup = versions();
        dup.push(versions().remove(0));
        assert!(matches!(
            MigrationPlan::from_versions(dup),
            Err(SyncError::InvalidMigrationPlan(_))
        ));
    }

    #[test]
    fn test_v3_collapses_legacy_duplicates() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_plan(&mut conn, &plan_of(&[1, 2])).unwrap();

        for (id, qty) in [("a", 10.0), ("b", 12.0)] {
            conn.execute(
                "INSERT INTO progress_entries (id, user_id, metric_type, quantity, date, created_at, updated_at)
                 VALUES (?1, 'u1', 'weight', ?2, '2026-01-02', 'x', 'x')",
                rusqlite::params![id, qty],
            )
            .unwrap();
        }

        apply_plan(&mut conn, &MigrationPlan::current()).unwrap();

        let (count, qty): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(quantity) FROM progress_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(qty, 12.0);
    }
}
