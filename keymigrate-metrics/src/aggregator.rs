use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use keymigrate_errors::{EngineError, ErrorRecord};
use metrics::{counter, gauge};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::event::{
    EngineEvent, ErrorRecordView, KeyOperation, MigrationStatus, StatsSnapshot,
};

/// Bound on the error list carried in `stats()`/`MetricSnapshot`; older
/// entries are dropped first. This is a display/telemetry bound only —
/// it does not affect the engine's non-fatal-error-continues semantics.
const MAX_RETAINED_ERRORS: usize = 200;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Raw, independently-updatable counters behind the progress surface.
/// `processed` is only ever incremented from inside the replicator (see
/// `Aggregator::record_key_processed`); nothing else touches it, so there
/// is no double-counting to guard against with clamping.
#[derive(Debug, Default)]
struct Stats {
    processed: AtomicU64,
    total: AtomicU64,
    bytes: AtomicU64,
    errors: Mutex<Vec<ErrorRecord>>,
}

/// The Progress & Metric Aggregator: owns the running counters, turns
/// them into point-in-time snapshots, and broadcasts typed events to any
/// number of subscribers.
pub struct Aggregator {
    stats: Stats,
    start: Instant,
    events: broadcast::Sender<EngineEvent>,
}

impl Aggregator {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Aggregator {
            stats: Stats::default(),
            start: Instant::now(),
            events: tx,
        }
    }

    /// Subscribe to the engine's event stream. Each subscriber gets every
    /// event emitted after this call; a slow subscriber can miss events
    /// once the broadcast buffer (of `EVENT_CHANNEL_CAPACITY`) fills, per
    /// `tokio::sync::broadcast` semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Re-set all counters and the start-of-migration clock; called once
    /// per `start()`, never across a restart (the engine does not persist
    /// progress).
    pub fn reset(&self) {
        self.stats.processed.store(0, Ordering::SeqCst);
        self.stats.total.store(0, Ordering::SeqCst);
        self.stats.bytes.store(0, Ordering::SeqCst);
        self.stats.errors.lock().unwrap().clear();
    }

    /// Re-sample the source's total key count. Called at the end of every
    /// scanner page and periodically during steady state.
    pub fn set_total(&self, total: u64) {
        self.stats.total.store(total, Ordering::SeqCst);
        gauge!("keymigrate_total_keys").set(total as f64);
    }

    /// Record a single successful key replication/delete/expire, publish
    /// a `keyProcessed` event, and emit a `progress` event immediately
    /// after — both only after the corresponding target write has
    /// already returned, so observers never see a counter increment
    /// without the matching target-side effect.
    pub fn record_key_processed(&self, key: &str, operation: KeyOperation, bytes: u64) {
        self.stats.processed.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes.fetch_add(bytes, Ordering::SeqCst);

        counter!("keymigrate_keys_processed_total").increment(1);
        counter!("keymigrate_bytes_processed_total").increment(bytes);

        let _ = self.events.send(EngineEvent::KeyProcessed {
            key: key.to_string(),
            operation,
        });

        let snapshot = self.snapshot();
        gauge!("keymigrate_processed_keys").set(snapshot.processed as f64);
        gauge!("keymigrate_rate_keys_per_sec").set(snapshot.rate);
        let _ = self.events.send(EngineEvent::Progress {
            processed: snapshot.processed,
            total: snapshot.total,
            percent: snapshot.percent,
            rate: snapshot.rate,
            bytes: snapshot.bytes,
        });
    }

    /// Record a recoverable error (per-key failure or subscriber I/O
    /// error) into the bounded error list and emit an `error` event. Does
    /// not advance `processed`.
    pub fn record_error(&self, err: &EngineError) {
        let record = ErrorRecord::from(err);
        counter!("keymigrate_errors_total").increment(1);

        let mut errors = self.stats.errors.lock().unwrap();
        errors.push(record.clone());
        if errors.len() > MAX_RETAINED_ERRORS {
            let overflow = errors.len() - MAX_RETAINED_ERRORS;
            errors.drain(0..overflow);
        }
        drop(errors);

        let _ = self.events.send(EngineEvent::Error {
            message: record.message,
            key: record.key,
        });
    }

    pub fn scan_complete(&self) {
        let _ = self.events.send(EngineEvent::ScanComplete);
    }

    pub fn sync_paused(&self) {
        let _ = self.events.send(EngineEvent::SyncPaused);
    }

    pub fn sync_resumed(&self) {
        let _ = self.events.send(EngineEvent::SyncResumed);
    }

    pub fn stopped(&self) {
        let _ = self.events.send(EngineEvent::Stopped);
    }

    /// Emit one `metrics` snapshot event carrying `status` and the
    /// current truncated error list, with an ISO-8601 timestamp.
    pub fn emit_metric_snapshot(&self, status: MigrationStatus) {
        let snapshot = self.snapshot();
        let _ = self.events.send(EngineEvent::MetricSnapshot {
            processed: snapshot.processed,
            total: snapshot.total,
            bytes: snapshot.bytes,
            rate: snapshot.rate,
            percent: snapshot.percent,
            timestamp: chrono::Utc::now().to_rfc3339(),
            status,
            errors: snapshot.errors,
        });
    }

    /// A consistent, immutable view of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.stats.processed.load(Ordering::SeqCst);
        let total = self.stats.total.load(Ordering::SeqCst);
        let bytes = self.stats.bytes.load(Ordering::SeqCst);
        let elapsed = self.start.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = processed as f64 / elapsed;
        let percent = if total == 0 {
            100.0
        } else {
            (100.0 * processed as f64 / total as f64).min(100.0)
        };
        let errors = self
            .stats
            .errors
            .lock()
            .unwrap()
            .iter()
            .map(ErrorRecordView::from)
            .collect();

        StatsSnapshot {
            processed,
            total,
            bytes,
            rate,
            percent,
            errors,
        }
    }

    /// Spawn a background task that emits a `MetricSnapshot` event every
    /// `interval` until `running` is cleared. The task itself does not
    /// own lifecycle state; it just reads a shared flag each tick, the
    /// same pattern the scanner/drain worker use to notice `stop`.
    pub fn spawn_metric_ticker(
        self: std::sync::Arc<Self>,
        interval: Duration,
        running: std::sync::Arc<std::sync::atomic::AtomicBool>,
        status: impl Fn() -> MigrationStatus + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                trace!("emitting periodic metric snapshot");
                self.emit_metric_snapshot(status());
            }
        })
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_100_when_total_is_zero() {
        let agg = Aggregator::new();
        let snap = agg.snapshot();
        assert_eq!(snap.percent, 100.0);
    }

    #[test]
    fn percent_is_clamped_to_100_even_if_total_lags() {
        let agg = Aggregator::new();
        agg.set_total(10);
        for i in 0..20 {
            agg.record_key_processed(&format!("k{i}"), KeyOperation::Update, 1);
        }
        let snap = agg.snapshot();
        assert_eq!(snap.processed, 20);
        assert_eq!(snap.percent, 100.0);
    }

    #[test]
    fn processed_monotonically_grows_and_matches_bytes() {
        let agg = Aggregator::new();
        agg.set_total(2);
        agg.record_key_processed("a", KeyOperation::Update, 5);
        agg.record_key_processed("b", KeyOperation::Delete, 7);
        let snap = agg.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.bytes, 12);
    }

    #[test]
    fn error_list_is_bounded() {
        let agg = Aggregator::new();
        for i in 0..(MAX_RETAINED_ERRORS + 50) {
            agg.record_error(&EngineError::SubscriberError(format!("boom {i}")));
        }
        let snap = agg.snapshot();
        assert_eq!(snap.errors.len(), MAX_RETAINED_ERRORS);
    }

    #[tokio::test]
    async fn subscribers_see_key_processed_then_progress() {
        let agg = Aggregator::new();
        let mut rx = agg.subscribe();
        agg.set_total(1);
        agg.record_key_processed("k", KeyOperation::Update, 3);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::KeyProcessed { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, EngineEvent::Progress { .. }));
    }
}
