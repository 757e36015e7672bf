//! Error types for vitals-sync

use thiserror::Error;

use crate::metric::MetricType;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(
        "Schema version gap: store is at v{on_disk}, migration plan has no step for v{missing} (target v{target})"
    )]
    SchemaVersionGap {
        on_disk: u32,
        missing: u32,
        target: u32,
    },

    #[error("Schema too new: store is at v{on_disk}, this build only knows up to v{target}")]
    SchemaTooNew { on_disk: u32, target: u32 },

    #[error("Invalid migration plan: {0}")]
    InvalidMigrationPlan(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("External source error: {0}")]
    ExternalSource(#[from] SourceError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejected input. Nothing is written when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("quantity {quantity} is not a finite number")]
    NonFiniteQuantity { quantity: f64 },

    #[error("{metric} quantity {quantity} outside [{min}, {max}]")]
    QuantityOutOfRange {
        metric: MetricType,
        quantity: f64,
        min: f64,
        max: f64,
    },

    #[error("notes are {len} characters, max is {max}")]
    NotesTooLong { len: usize, max: usize },

    #[error("{metric} samples need an hour-aligned bucket time")]
    MissingBucket { metric: MetricType },

    #[error("{metric} is a daily metric and takes no bucket time")]
    UnexpectedBucket { metric: MetricType },

    #[error("bucket time {bucket} is not aligned to the start of an hour")]
    MisalignedBucket { bucket: String },

    #[error("invalid date range: {from} is after {to}")]
    InvalidRange { from: String, to: String },
}

/// Failure pulling samples from the external health source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("fetch timed out after {0} ms")]
    Timeout(u64),
}

impl SourceError {
    /// Permission problems need user remediation and are not retried.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SourceError::PermissionDenied(_))
    }
}

/// Failure pushing an entity to the backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("backend rejected entity: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("push timed out after {0} ms")]
    Timeout(u64),
}
