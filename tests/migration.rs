//! Schema migration integration tests
//!
//! Builds stores at older schema versions on disk with raw SQL, then reopens
//! them through the registry:
//! - v1 -> current keeps every row and enforces the dedup key
//! - collapsing duplicates also drops their undelivered outbox events
//! - gaps and too-new stores refuse to open and leave the file untouched

mod common;

use std::sync::Arc;

use rusqlite::{params, Connection};
use tempfile::TempDir;

use common::*;
use vitals_sync::config::{OutboxConfig, SyncConfig};
use vitals_sync::db::schema::{get_schema_version, versions};
use vitals_sync::{LocalStore, MetricType, MigrationPlan, SyncError, UpsertOutcome, CURRENT_SCHEMA_VERSION};

fn plan_of(wanted: &[u32]) -> MigrationPlan {
    MigrationPlan::from_versions(
        versions()
            .into_iter()
            .filter(|v| wanted.contains(&v.version))
            .collect(),
    )
    .unwrap()
}

fn insert_v1_row(conn: &Connection, id: &str, metric: &str, quantity: f64, day: &str, written: &str) {
    conn.execute(
        "INSERT INTO progress_entries (id, user_id, metric_type, quantity, date, notes,
            backend_id, sync_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, 'synced', ?6, ?6)",
        params![id, USER, metric, quantity, day, written],
    )
    .unwrap();
}

fn on_disk_version(path: &std::path::Path) -> u32 {
    let conn = Connection::open(path).unwrap();
    get_schema_version(&conn).unwrap()
}

// =============================================================================
// Upgrade path
// =============================================================================

#[tokio::test]
async fn test_v1_store_migrates_to_current_without_loss() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");

    // A store written by a build that only knew v1
    drop(LocalStore::open(&path, &plan_of(&[1])).unwrap());
    assert_eq!(on_disk_version(&path), 1);
    {
        let conn = Connection::open(&path).unwrap();
        insert_v1_row(&conn, "w-1", "weight", 81.0, "2026-05-01", "2026-05-01T08:00:00.000000Z");
        insert_v1_row(&conn, "w-2", "weight", 80.5, "2026-05-02", "2026-05-02T08:00:00.000000Z");
        insert_v1_row(&conn, "m-1", "mood_score", 7.0, "2026-05-02", "2026-05-02T21:00:00.000000Z");
    }

    let store = Arc::new(LocalStore::open(&path, &MigrationPlan::current()).unwrap());
    assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
    assert_eq!(on_disk_version(&path), CURRENT_SCHEMA_VERSION);

    let h = Harness::with_store(store, OutboxConfig::default(), SyncConfig::default());
    let weights = h.entries(MetricType::Weight, date(5, 1), date(5, 2));
    assert_eq!(weights.len(), 2);
    assert_eq!(weights[0].id, "w-1");
    assert_eq!(weights[0].quantity, 81.0);
    assert_eq!(weights[0].bucket_time, None);
    assert_eq!(h.entries(MetricType::MoodScore, date(5, 2), date(5, 2)).len(), 1);

    // Old rows take part in dedup like new ones
    let outcome = h.engine.upsert(&weight(date(5, 1), 81.0)).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::DuplicateNoop { entry_id: "w-1".into() });
    let outcome = h.engine.upsert(&weight(date(5, 3), 80.0)).await.unwrap();
    assert!(matches!(outcome, UpsertOutcome::Created { .. }));
}

#[test]
fn test_v1_duplicates_collapse_to_latest_row() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");

    drop(LocalStore::open(&path, &plan_of(&[1])).unwrap());
    {
        let conn = Connection::open(&path).unwrap();
        insert_v1_row(&conn, "old", "weight", 90.0, "2026-05-01", "2026-05-01T08:00:00.000000Z");
        insert_v1_row(&conn, "new", "weight", 89.0, "2026-05-01", "2026-05-01T09:00:00.000000Z");
    }

    let store = LocalStore::open(&path, &MigrationPlan::current()).unwrap();
    let ids: Vec<String> = store
        .with_conn(|conn| {
            vitals_sync::db::progress::find_day_entries(conn, USER, MetricType::Weight, date(5, 1))
        })
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["new".to_string()]);

    // The dedup key is now enforced by the schema itself
    let conn = Connection::open(&path).unwrap();
    let dup = conn.execute(
        "INSERT INTO progress_entries (id, user_id, metric_type, quantity, date, sync_status, created_at, updated_at)
         VALUES ('again', ?1, 'weight', 88.0, '2026-05-01', 'pending', 'x', 'x')",
        params![USER],
    );
    assert!(dup.is_err());
}

fn insert_v2_event(conn: &Connection, id: &str, entity_id: &str, status: &str) {
    conn.execute(
        "INSERT INTO outbox_events (id, event_type, entity_id, user_id, status, created_at)
         VALUES (?1, 'progress_entry.created', ?2, ?3, ?4, '2026-05-01T08:00:00.000000Z')",
        params![id, entity_id, USER, status],
    )
    .unwrap();
}

#[tokio::test]
async fn test_collapse_drops_undelivered_events_of_removed_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");

    drop(LocalStore::open(&path, &plan_of(&[1, 2])).unwrap());
    {
        let conn = Connection::open(&path).unwrap();
        insert_v1_row(&conn, "old", "weight", 90.0, "2026-05-01", "2026-05-01T08:00:00.000000Z");
        insert_v1_row(&conn, "new", "weight", 89.0, "2026-05-01", "2026-05-01T09:00:00.000000Z");
        insert_v2_event(&conn, "ev-old-pending", "old", "pending");
        insert_v2_event(&conn, "ev-old-failed", "old", "failed");
        insert_v2_event(&conn, "ev-old-synced", "old", "synced");
        insert_v2_event(&conn, "ev-new", "new", "pending");
    }

    let store = Arc::new(LocalStore::open(&path, &MigrationPlan::current()).unwrap());
    let h = Harness::with_store(store, OutboxConfig::default(), SyncConfig::default());

    let old_events: Vec<String> = h.events_for("old").into_iter().map(|e| e.id).collect();
    assert_eq!(old_events, vec!["ev-old-synced".to_string()]);
    assert_eq!(h.events_for("new").len(), 1);

    // Only the surviving row is delivered; nothing fails as a missing entity
    let summary = h.outbox.flush().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(summary.failed, 0);
    let pushed: Vec<String> = h.backend.pushes().into_iter().map(|(id, _, _)| id).collect();
    assert_eq!(pushed, vec!["new".to_string()]);
}

#[test]
fn test_v2_store_upgrades_one_step() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");

    drop(LocalStore::open(&path, &plan_of(&[1, 2])).unwrap());
    assert_eq!(on_disk_version(&path), 2);

    let store = LocalStore::open(&path, &MigrationPlan::current()).unwrap();
    assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
    assert_eq!(store.stats().unwrap().outbox.pending, 0);
}

// =============================================================================
// Refusals
// =============================================================================

#[test]
fn test_gap_refuses_to_open_and_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");
    drop(LocalStore::open(&path, &plan_of(&[1])).unwrap());

    let err = LocalStore::open(&path, &plan_of(&[1, 3])).err().unwrap();
    assert!(matches!(
        err,
        SyncError::SchemaVersionGap { on_disk: 1, missing: 2, target: 3 }
    ));
    assert_eq!(on_disk_version(&path), 1);

    // The full plan still works afterwards
    let store = LocalStore::open(&path, &MigrationPlan::current()).unwrap();
    assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn test_store_newer_than_plan_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vitals.db");
    drop(LocalStore::open(&path, &MigrationPlan::current()).unwrap());

    let err = LocalStore::open(&path, &plan_of(&[1, 2])).err().unwrap();
    assert!(matches!(err, SyncError::SchemaTooNew { on_disk: 3, target: 2 }));
}
