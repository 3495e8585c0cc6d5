use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keymigrate_client::{ConnectionConfig, ConnectionPair};
use keymigrate_errors::{EngineError, Result};
use keymigrate_metrics::{Aggregator, MigrationStatus, StatsSnapshot};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::queue::PendingQueue;
use crate::replicator::{FredReplicator, KeyReplicator};
use crate::scanner::{self, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE};
use crate::subscriber::{self, SubscriberHandle};

/// Default cadence for periodic `MetricSnapshot` events.
const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(5);
/// How often background supervision checks for a subscriber failure or a
/// completed scan while `start()` has already returned control to the
/// caller.
const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

/// The lifecycle state machine from the component design: `Idle` through
/// `Validating`, `Scanning`, `SteadyState`, `Stopping`, to `Stopped`.
/// `sync_enabled` (pause/resume) is tracked separately, since pausing
/// does not move the engine out of `SteadyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Validating,
    Scanning,
    SteadyState,
    Stopping,
    Stopped,
}

/// Tunables recognized in the constructor, mirroring spec.md §6.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// If false, the CDC subscriber is never activated and the engine
    /// runs as a one-shot snapshot.
    pub enable_realtime_sync: bool,
    /// Scanner page size.
    pub batch_size: u32,
    /// Replicator concurrency per scanner page / drain pass.
    pub chunk_size: usize,
    /// Cadence of periodic `MetricSnapshot` events.
    pub metric_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            enable_realtime_sync: true,
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            metric_interval: DEFAULT_METRIC_INTERVAL,
        }
    }
}

#[derive(Default)]
struct EngineTasks {
    drain: Option<JoinHandle<()>>,
    metrics: Option<JoinHandle<()>>,
    /// Owns the scan task: `supervise` awaits it directly and flips
    /// lifecycle state to `SteadyState` when it finishes, so `stop()`
    /// only needs to abort this wrapper to cancel both.
    supervisor: Option<JoinHandle<()>>,
    subscriber: Option<SubscriberHandle>,
}

/// The migration engine: the public surface the out-of-scope HTTP control
/// plane is expected to drive (`new`/`validate`/`start`/`stop`/
/// `pause_sync`/`resume_sync`/`cleanup`/`stats`), and the owner of the
/// connection pair, the pending-set, and every background task the engine
/// spawns.
pub struct Engine {
    migration_id: String,
    source_config: ConnectionConfig,
    target_config: ConnectionConfig,
    options: EngineOptions,

    state: Arc<Mutex<LifecycleState>>,
    running: Arc<AtomicBool>,
    sync_enabled: Arc<AtomicBool>,

    aggregator: Arc<Aggregator>,
    queue: Arc<PendingQueue>,

    pair: Mutex<Option<Arc<ConnectionPair>>>,
    tasks: Mutex<EngineTasks>,
}

impl Engine {
    /// Construct the engine. Performs no I/O; sessions are opened lazily
    /// by [`Engine::validate`] or, if that was skipped, by [`Engine::start`].
    pub fn new(
        source_config: ConnectionConfig,
        target_config: ConnectionConfig,
        migration_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        Engine {
            migration_id: migration_id.into(),
            source_config,
            target_config,
            options,
            state: Arc::new(Mutex::new(LifecycleState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            sync_enabled: Arc::new(AtomicBool::new(false)),
            aggregator: Arc::new(Aggregator::new()),
            queue: PendingQueue::new(),
            pair: Mutex::new(None),
            tasks: Mutex::new(EngineTasks::default()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap() = state;
    }

    /// Pre-flight: open all three sessions and validate them (liveness,
    /// same-instance check, target auth). On failure, any partially
    /// opened sessions are already torn down by [`ConnectionPair::connect`].
    #[instrument(skip(self), fields(migration_id = %self.migration_id))]
    pub async fn validate(&self) -> Result<()> {
        self.set_state(LifecycleState::Validating);
        let pair = ConnectionPair::connect(self.source_config.clone(), self.target_config.clone())
            .await?;
        if let Err(e) = pair.validate().await {
            pair.close().await;
            self.aggregator.record_error(&e);
            self.set_state(LifecycleState::Stopped);
            return Err(e);
        }
        *self.pair.lock().unwrap() = Some(Arc::new(pair));
        Ok(())
    }

    /// Begin a migration: validates (if not already validated), activates
    /// the CDC subscriber *before* the scanner per the ordering guarantee
    /// in §4.7, then kicks off the bulk scan in the background and
    /// returns. Progress is observable via [`Engine::stats`] and the
    /// aggregator's event stream.
    #[instrument(skip(self), fields(migration_id = %self.migration_id))]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Scanning | LifecycleState::SteadyState => {
                return Err(EngineError::AlreadyRunning)
            }
            _ => {}
        }

        let existing_pair = self.pair.lock().unwrap().clone();
        let pair = match existing_pair {
            Some(pair) => pair,
            None => {
                if let Err(e) = self.validate().await {
                    error!(error = %e, "validation failed, aborting start");
                    return Err(e);
                }
                self.pair
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("validate() stores a connected pair on success")
            }
        };

        self.aggregator.reset();
        self.running.store(true, Ordering::SeqCst);
        self.sync_enabled.store(true, Ordering::SeqCst);

        let replicator: Arc<dyn KeyReplicator> = Arc::new(FredReplicator {
            source: pair.source.clone(),
            target: pair.target.clone(),
        });

        let mut tasks = EngineTasks::default();

        if self.options.enable_realtime_sync {
            if let Err(e) = subscriber::ensure_notifications(&pair.source).await {
                self.aggregator.record_error(&e);
                self.running.store(false, Ordering::SeqCst);
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }

            // Subscriber strictly before scanner: no write during the scan
            // is lost, since an unseen key is redundantly re-replicated.
            let handle = subscriber::spawn_subscriber(
                pair.subscriber.clone(),
                pair.source.clone(),
                pair.target.clone(),
                replicator.clone(),
                self.queue.clone(),
                self.sync_enabled.clone(),
                self.running.clone(),
                self.aggregator.clone(),
            );

            let drain = tokio::spawn(
                self.queue
                    .clone()
                    .run(replicator.clone(), self.aggregator.clone(), self.running.clone()),
            );

            tasks.subscriber = Some(handle);
            tasks.drain = Some(drain);
        }

        self.set_state(LifecycleState::Scanning);

        let status_for_ticker = {
            let running = self.running.clone();
            move || {
                if running.load(Ordering::SeqCst) {
                    MigrationStatus::Running
                } else {
                    MigrationStatus::Stopped
                }
            }
        };
        tasks.metrics = Some(self.aggregator.clone().spawn_metric_ticker(
            self.options.metric_interval,
            self.running.clone(),
            status_for_ticker,
        ));

        let scan_source = pair.source.clone();
        let scan_replicator = replicator.clone();
        let scan_aggregator = self.aggregator.clone();
        let scan_running = self.running.clone();
        let batch_size = self.options.batch_size;
        let chunk_size = self.options.chunk_size;
        let scan_handle = tokio::spawn(async move {
            if let Err(e) = scanner::run_scan(
                scan_source,
                scan_replicator,
                scan_aggregator.clone(),
                scan_running,
                batch_size,
                chunk_size,
            )
            .await
            {
                error!(error = %e, "bulk scan failed");
                scan_aggregator.record_error(&e);
            }
        });

        let subscriber_fatal = tasks
            .subscriber
            .as_ref()
            .map(|h| h.fatal.clone())
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let supervisor_running = self.running.clone();
        let supervisor_state = self.state.clone();
        let supervisor = tokio::spawn(supervise(
            scan_handle,
            subscriber_fatal,
            supervisor_running,
            supervisor_state,
        ));
        tasks.supervisor = Some(supervisor);

        *self.tasks.lock().unwrap() = tasks;

        Ok(())
    }

    /// Freeze the subscriber's effects without tearing down the
    /// subscription: events that arrive while paused are dropped, not
    /// buffered, and there is no backlog replay on resume.
    pub fn pause_sync(&self) {
        self.sync_enabled.store(false, Ordering::SeqCst);
        self.aggregator.sync_paused();
    }

    pub fn resume_sync(&self) {
        self.sync_enabled.store(true, Ordering::SeqCst);
        self.aggregator.sync_resumed();
    }

    /// Stop the migration. Clears `sync_enabled` first so the subscriber
    /// callback stops accepting new enqueues, then cooperatively signals
    /// every background task, clears the pending set, and closes all
    /// three sessions. Never raises past cleanup: failures while closing
    /// are logged and swallowed.
    #[instrument(skip(self), fields(migration_id = %self.migration_id))]
    pub async fn stop(&self) {
        self.sync_enabled.store(false, Ordering::SeqCst);
        self.set_state(LifecycleState::Stopping);
        self.running.store(false, Ordering::SeqCst);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        if let Some(handle) = tasks.subscriber {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle.task).await;
        }
        if let Some(drain) = tasks.drain {
            let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
        }
        if let Some(supervisor) = tasks.supervisor {
            let _ = tokio::time::timeout(Duration::from_secs(2), supervisor).await;
        }
        if let Some(metrics) = tasks.metrics {
            metrics.abort();
        }

        self.queue.clear().await;

        if let Some(pair) = self.pair.lock().unwrap().clone() {
            pair.close().await;
        }

        self.set_state(LifecycleState::Stopped);
        self.aggregator.stopped();
        self.aggregator.emit_metric_snapshot(MigrationStatus::Stopped);
        info!("migration stopped");
    }

    /// Best-effort teardown of whatever sessions are open, regardless of
    /// lifecycle state. Safe to call after a failed `validate()`, after
    /// `stop()`, or instead of `stop()` when the engine never started.
    pub async fn cleanup(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop().await;
            return;
        }
        if let Some(pair) = self.pair.lock().unwrap().take() {
            pair.close().await;
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.aggregator.snapshot()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<keymigrate_metrics::EngineEvent> {
        self.aggregator.subscribe()
    }
}

/// Watches the scan task and the subscriber's fatal flag concurrently.
/// If the subscriber's pub/sub stream dies (the spec disables automatic
/// reconnection), that is surfaced but does not itself stop the engine;
/// it is the scanner/drain tasks, driven by `running`, that actually wind
/// down. This task flips lifecycle state to `SteadyState` once the scan
/// portion finishes while the engine is still running, so `stats()`/
/// `state()` observers see the transition promptly without the caller
/// having to poll the scan task itself.
async fn supervise(
    scan_handle: JoinHandle<()>,
    subscriber_fatal: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<LifecycleState>>,
) {
    tokio::pin!(scan_handle);
    loop {
        tokio::select! {
            res = &mut scan_handle => {
                if let Err(e) = res {
                    warn!(error = %e, "scan task panicked");
                }
                if running.load(Ordering::SeqCst) {
                    *state.lock().unwrap() = LifecycleState::SteadyState;
                }
                return;
            }
            _ = tokio::time::sleep(SUPERVISOR_POLL) => {
                if subscriber_fatal.load(Ordering::SeqCst) && !running.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> EngineOptions {
        EngineOptions {
            enable_realtime_sync: false,
            ..EngineOptions::default()
        }
    }

    #[test]
    fn starts_idle_and_rejects_pause_resume_as_harmless_no_ops() {
        let engine = Engine::new(
            ConnectionConfig::new("localhost", 6379),
            ConnectionConfig::new("localhost", 6380),
            "mig-1",
            opts(),
        );
        assert_eq!(engine.state(), LifecycleState::Idle);
        engine.pause_sync();
        assert!(!engine.sync_enabled.load(Ordering::SeqCst));
        engine.resume_sync();
        assert!(engine.sync_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn supervisor_moves_to_steady_state_once_scan_completes() {
        let state = Arc::new(Mutex::new(LifecycleState::Scanning));
        let running = Arc::new(AtomicBool::new(true));
        let fatal = Arc::new(AtomicBool::new(false));
        let scan = tokio::spawn(async {});

        supervise(scan, fatal, running, state.clone()).await;

        assert_eq!(*state.lock().unwrap(), LifecycleState::SteadyState);
    }

    #[tokio::test]
    async fn supervisor_leaves_state_alone_if_engine_already_stopped() {
        let state = Arc::new(Mutex::new(LifecycleState::Stopped));
        let running = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(AtomicBool::new(false));
        let scan = tokio::spawn(async {});

        supervise(scan, fatal, running, state.clone()).await;

        assert_eq!(*state.lock().unwrap(), LifecycleState::Stopped);
    }
}
