use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use keymigrate_metrics::Aggregator;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::replicator::KeyReplicator;

/// Bounded concurrency used when replicating the keys in one drain pass.
/// The spec doesn't name a queue-specific concurrency constant; reusing
/// `CHUNK_SIZE`-scale parallelism here would be overkill for what is
/// usually a small coalesced batch, so drains use a smaller, fixed width.
const DRAIN_CONCURRENCY: usize = 64;

/// A set of pending key names plus a single-flight drain worker. Inserting
/// an already-pending key is a no-op (that's the coalescing); the drain
/// worker atomically swaps the set for an empty one and replicates the
/// snapshot, re-draining immediately if new arrivals accumulated while it
/// ran, otherwise going idle.
pub struct PendingQueue {
    pending: Mutex<HashSet<String>>,
    draining: AtomicBool,
    kick: Notify,
}

impl PendingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingQueue {
            pending: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
            kick: Notify::new(),
        })
    }

    /// Enqueue `key` for re-replication. No-op if already pending.
    pub async fn enqueue(&self, key: String) {
        let mut pending = self.pending.lock().await;
        pending.insert(key);
        drop(pending);
        self.kick.notify_one();
    }

    /// Drop everything currently pending without replicating it. Used by
    /// `stop()`, which clears the pending set rather than letting it
    /// drain into a target that's about to be closed.
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    async fn take_snapshot(&self) -> HashSet<String> {
        let mut pending = self.pending.lock().await;
        std::mem::take(&mut *pending)
    }

    /// Run the drain loop until `running` is cleared. Waits for a kick
    /// (an `enqueue` call) when idle instead of busy-polling.
    pub async fn run(
        self: Arc<Self>,
        replicator: Arc<dyn KeyReplicator>,
        aggregator: Arc<Aggregator>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            let snapshot = self.take_snapshot().await;
            if snapshot.is_empty() {
                self.draining.store(false, Ordering::SeqCst);
                tokio::select! {
                    _ = self.kick.notified() => {}
                    _ = wait_while_running(&running) => {}
                }
                continue;
            }

            self.draining.store(true, Ordering::SeqCst);
            trace!(count = snapshot.len(), "draining coalesced updates");
            self.drain_once(snapshot, &*replicator, &aggregator).await;
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    async fn drain_once(
        &self,
        keys: HashSet<String>,
        replicator: &dyn KeyReplicator,
        aggregator: &Aggregator,
    ) {
        let mut keys: Vec<String> = keys.into_iter().collect();
        while !keys.is_empty() {
            let chunk: Vec<String> = keys.drain(..keys.len().min(DRAIN_CONCURRENCY)).collect();
            let futures = chunk
                .iter()
                .map(|key| async move { (key.clone(), replicator.replicate(key).await) });
            let results = join_all(futures).await;
            for (key, result) in results {
                match result {
                    Ok(outcome) => {
                        aggregator.record_key_processed(&key, outcome.operation, outcome.bytes)
                    }
                    Err(e) => aggregator.record_error(&e),
                }
            }
        }
    }
}

async fn wait_while_running(running: &AtomicBool) {
    // Poll at a modest cadence rather than spinning; a real kick via
    // `Notify` will normally win this select well before the tick fires.
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        interval.tick().await;
        if !running.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::replicator::test_support::FakeReplicator;

    #[tokio::test]
    async fn concurrent_enqueues_of_the_same_key_coalesce() {
        let queue = PendingQueue::new();
        let replicator = Arc::new(FakeReplicator::default());
        let aggregator = Arc::new(Aggregator::new());
        let running = Arc::new(AtomicBool::new(true));

        // Several updates to the same key arrive before the drain worker
        // gets a chance to run.
        queue.enqueue("hot-key".to_string()).await;
        queue.enqueue("hot-key".to_string()).await;
        queue.enqueue("hot-key".to_string()).await;

        let worker_replicator = replicator.clone();
        let worker_aggregator = aggregator.clone();
        let worker_running = running.clone();
        let worker_queue = queue.clone();
        let handle = tokio::spawn(async move {
            worker_queue
                .run(worker_replicator, worker_aggregator, worker_running)
                .await;
        });

        // Give the drain a moment to process the single coalesced pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.store(false, Ordering::SeqCst);
        queue.enqueue(String::new()).await; // wake the worker out of select
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        let counts = replicator.call_counts.lock().unwrap();
        assert_eq!(counts.get("hot-key").copied().unwrap_or(0), 1);
    }

    #[tokio::test]
    async fn per_key_failures_do_not_abort_the_drain() {
        let queue = PendingQueue::new();
        let replicator = Arc::new(FakeReplicator::default());
        replicator
            .fail_keys
            .lock()
            .unwrap()
            .insert("bad-key".to_string());
        let aggregator = Arc::new(Aggregator::new());
        let running = Arc::new(AtomicBool::new(true));

        queue.enqueue("bad-key".to_string()).await;
        queue.enqueue("good-key".to_string()).await;

        let worker_replicator = replicator.clone();
        let worker_aggregator = aggregator.clone();
        let worker_running = running.clone();
        let worker_queue = queue.clone();
        let handle = tokio::spawn(async move {
            worker_queue
                .run(worker_replicator, worker_aggregator, worker_running)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        running.store(false, Ordering::SeqCst);
        queue.enqueue(String::new()).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        let counts = replicator.call_counts.lock().unwrap();
        assert_eq!(counts.get("good-key").copied(), Some(1));
        assert_eq!(counts.get("bad-key").copied(), Some(1));

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.processed, 1); // only good-key counted
        assert_eq!(snapshot.errors.len(), 1);
    }
}
