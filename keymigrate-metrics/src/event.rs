use keymigrate_errors::ErrorRecord;
use serde::Serialize;

/// The operation a `keyProcessed` event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyOperation {
    Update,
    Delete,
    Expire,
    ListUpdate,
}

/// Coarse migration status, reported on every metric snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// A point-in-time snapshot of migration counters, as returned by
/// `Engine::stats()` and carried in `Progress`/`MetricSnapshot` events.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub total: u64,
    pub bytes: u64,
    /// Keys per second, computed as `processed / elapsed`.
    pub rate: f64,
    /// `min(100, 100 * processed / total)`; `100` when `total == 0`.
    pub percent: f64,
    pub errors: Vec<ErrorRecordView>,
}

/// A `Clone`/`Serialize`-friendly view of an [`ErrorRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecordView {
    pub key: Option<String>,
    pub message: String,
}

impl From<&ErrorRecord> for ErrorRecordView {
    fn from(r: &ErrorRecord) -> Self {
        ErrorRecordView {
            key: r.key.clone(),
            message: r.message.clone(),
        }
    }
}

/// Every event the engine can emit. External collaborators (the HTTP
/// control plane, an audit logger, a UI) subscribe to these via
/// [`crate::Aggregator::subscribe`]; none of that plumbing is this
/// crate's concern beyond producing a well-typed, cloneable stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    Progress {
        processed: u64,
        total: u64,
        percent: f64,
        rate: f64,
        bytes: u64,
    },
    MetricSnapshot {
        processed: u64,
        total: u64,
        bytes: u64,
        rate: f64,
        percent: f64,
        timestamp: String,
        status: MigrationStatus,
        errors: Vec<ErrorRecordView>,
    },
    KeyProcessed {
        key: String,
        operation: KeyOperation,
    },
    ScanComplete,
    SyncPaused,
    SyncResumed,
    Stopped,
    Error {
        message: String,
        key: Option<String>,
    },
}
