use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fred::clients::Client;
use fred::interfaces::ServerInterface;
use futures::future::join_all;
use keymigrate_errors::Result;
use keymigrate_metrics::Aggregator;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::replicator::KeyReplicator;

/// Default page size for one `SCAN` round trip.
pub const DEFAULT_BATCH_SIZE: u32 = 5000;
/// Default bounded concurrency when replicating the keys in one page.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Run the one-shot bulk sweep: page through the source's keyspace with
/// `SCAN`, replicate each page's keys with bounded concurrency, and
/// re-sample the source's total key count after every page so `total`
/// tracks a moving target. Stops early, without error, if `running` is
/// cleared (a `stop()` during Scanning).
pub async fn run_scan(
    source: Client,
    replicator: Arc<dyn KeyReplicator>,
    aggregator: Arc<Aggregator>,
    running: Arc<AtomicBool>,
    batch_size: u32,
    chunk_size: usize,
) -> Result<()> {
    // No type filter: the sweep must cover every container kind, not just
    // one, so the `ScanType` argument stays `None`.
    let mut pages = source.scan("*", Some(batch_size), None);

    while let Some(page) = pages.next().await {
        if !running.load(Ordering::SeqCst) {
            debug!("scan stopped before cursor exhausted");
            return Ok(());
        }

        let mut page = page?;
        let keys: Vec<String> = page
            .take_results()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|k| k.as_str().map(|s| s.to_string()))
            .collect();

        for chunk in keys.chunks(chunk_size.max(1)) {
            if !running.load(Ordering::SeqCst) {
                return Ok(());
            }
            replicate_chunk(&*replicator, chunk, &aggregator).await;
        }

        if let Ok(total) = source.dbsize::<i64>().await {
            aggregator.set_total(total.max(0) as u64);
        }

        // Drive the scan cursor forward; fred's `ScanResult` requires an
        // explicit continuation so the caller controls backpressure
        // between pages.
        let _ = page.next();
    }

    info!("bulk scan complete");
    aggregator.scan_complete();
    Ok(())
}

async fn replicate_chunk(replicator: &dyn KeyReplicator, chunk: &[String], aggregator: &Aggregator) {
    let futures = chunk
        .iter()
        .map(|key| async move { (key.clone(), replicator.replicate(key).await) });
    let results = join_all(futures).await;
    for (key, result) in results {
        match result {
            Ok(outcome) => aggregator.record_key_processed(&key, outcome.operation, outcome.bytes),
            Err(e) => aggregator.record_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::replicator::test_support::FakeReplicator;

    #[tokio::test]
    async fn replicate_chunk_counts_successes_and_records_failures() {
        let replicator = Arc::new(FakeReplicator::default());
        replicator.fail_keys.lock().unwrap().insert("bad".into());
        let aggregator = Aggregator::new();

        replicate_chunk(
            &*replicator,
            &["a".to_string(), "bad".to_string(), "b".to_string()],
            &aggregator,
        )
        .await;

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.errors.len(), 1);
    }

    #[test]
    fn running_flag_can_short_circuit_before_any_scan_work() {
        let running = Arc::new(AtomicBool::new(false));
        assert!(!running.load(Ordering::SeqCst));
    }
}
