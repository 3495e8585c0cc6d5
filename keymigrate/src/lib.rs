//! Thin library entry point wiring the engine crates together. The
//! engine itself lives in [`keymigrate_core`]; this crate exists to give
//! the `migrate` binary (and anyone embedding the engine directly) a
//! single `use keymigrate::*` surface, the way `readyset` is a thin
//! binary/library shell over `readyset-adapter`/`readyset-server`.

pub use keymigrate_client::ConnectionConfig;
pub use keymigrate_core::{
    Engine, EngineOptions, FredReplicator, KeyKind, KeyReplicator, LifecycleState, PendingQueue,
    ReplicationOutcome, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE,
};
pub use keymigrate_errors::{EngineError, ErrorRecord, Result};
pub use keymigrate_metrics::{
    Aggregator, EngineEvent, ErrorRecordView, KeyOperation, MigrationStatus, StatsSnapshot,
};
