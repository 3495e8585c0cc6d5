use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fred::clients::{Client, SubscriberClient};
use fred::interfaces::{ConfigInterface, EventInterface, KeysInterface, PubsubInterface};
use keymigrate_errors::EngineError;
use keymigrate_metrics::{Aggregator, KeyOperation};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::queue::PendingQueue;
use crate::replicator::KeyReplicator;

/// Keyspace notification config flags the engine requires: keyspace
/// events (`K`), key events (`E`), and all event categories (`A`).
const REQUIRED_NOTIFY_FLAGS: &str = "KEA";

const KEYSPACE_PATTERN: &str = "__keyspace@0__:*";

fn classify(event: &str) -> Intent {
    match event {
        "del" | "unlink" => Intent::Delete,
        "expire" | "pexpire" | "expireat" | "pexpireat" | "persist" => Intent::ExpireSync,
        "lpush" | "rpush" | "lpop" | "rpop" | "lset" | "lrem" | "ltrim" | "linsert" => {
            Intent::RebuildList
        }
        "set" | "hset" | "sadd" | "zadd" => Intent::Enqueue,
        _ => Intent::Ignored,
    }
}

enum Intent {
    Delete,
    ExpireSync,
    RebuildList,
    Enqueue,
    Ignored,
}

/// Make sure the source emits keyspace notifications covering all keys,
/// key-events, and every event category, reconfiguring it if not.
/// Treated as a fatal `ConfigurationError` on failure: without this the
/// CDC phase cannot observe writes at all.
pub async fn ensure_notifications(source: &Client) -> keymigrate_errors::Result<()> {
    let current: String = source
        .config_get("notify-keyspace-events")
        .await
        .map_err(|e| EngineError::ConfigurationError(e.to_string()))?;

    let missing = REQUIRED_NOTIFY_FLAGS
        .chars()
        .any(|flag| !current.contains(flag));

    if !missing {
        return Ok(());
    }

    let mut combined: String = current.chars().filter(|c| !c.is_whitespace()).collect();
    for flag in REQUIRED_NOTIFY_FLAGS.chars() {
        if !combined.contains(flag) {
            combined.push(flag);
        }
    }

    debug!(flags = %combined, "enabling keyspace notifications on source");
    source
        .config_set("notify-keyspace-events", combined)
        .await
        .map_err(|e| EngineError::ConfigurationError(e.to_string()))
}

/// Handle to the running subscriber task. `fatal` flips to `true` if the
/// pub/sub stream closes or errors out of its receive loop; the lifecycle
/// controller polls it to decide whether to stop the whole migration (the
/// spec disables client-side pub/sub reconnection, so this is terminal).
pub struct SubscriberHandle {
    pub task: JoinHandle<()>,
    pub fatal: Arc<AtomicBool>,
}

/// Subscribe to the source's keyspace events and run the classify/apply
/// loop until the subscription drops or `running` is cleared. Registered
/// exactly once, after `ensure_notifications` has already confirmed (and
/// if necessary, fixed) the source's configuration.
pub fn spawn_subscriber(
    subscriber: SubscriberClient,
    source: Client,
    target: Client,
    replicator: Arc<dyn KeyReplicator>,
    queue: Arc<PendingQueue>,
    sync_enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    aggregator: Arc<Aggregator>,
) -> SubscriberHandle {
    let fatal = Arc::new(AtomicBool::new(false));
    let fatal_flag = fatal.clone();

    let task = tokio::spawn(async move {
        let mut messages = subscriber.message_rx();
        if let Err(e) = subscriber.psubscribe(KEYSPACE_PATTERN).await {
            error!(error = %e, "failed to subscribe to keyspace events");
            aggregator.record_error(&EngineError::SubscriberError(e.to_string()));
            fatal_flag.store(true, Ordering::SeqCst);
            return;
        }

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match messages.recv().await {
                Ok(message) => {
                    if !sync_enabled.load(Ordering::SeqCst) {
                        // Paused: drop the event rather than buffer it.
                        continue;
                    }
                    let Some(key) = message.channel.strip_prefix("__keyspace@0__:") else {
                        continue;
                    };
                    let event = match message.value.as_str() {
                        Some(s) => s.to_string(),
                        None => continue,
                    };
                    handle_event(
                        key,
                        &event,
                        &source,
                        &target,
                        &*replicator,
                        &queue,
                        &aggregator,
                    )
                    .await;
                }
                Err(e) => {
                    warn!(error = %e, "keyspace subscription closed");
                    aggregator.record_error(&EngineError::SubscriberError(e.to_string()));
                    fatal_flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    });

    SubscriberHandle { task, fatal }
}

async fn handle_event(
    key: &str,
    event: &str,
    source: &Client,
    target: &Client,
    replicator: &dyn KeyReplicator,
    queue: &PendingQueue,
    aggregator: &Aggregator,
) {
    match classify(event) {
        Intent::Delete => match target.del::<(), _>(key).await {
            Ok(_) => aggregator.record_key_processed(key, KeyOperation::Delete, key.len() as u64),
            Err(e) => aggregator.record_error(&EngineError::from(e).for_key(key)),
        },
        Intent::ExpireSync => apply_expire_sync(key, source, target, aggregator).await,
        Intent::RebuildList => match replicator.replicate(key).await {
            Ok(outcome) => {
                aggregator.record_key_processed(key, KeyOperation::ListUpdate, outcome.bytes)
            }
            Err(e) => aggregator.record_error(&e),
        },
        Intent::Enqueue => queue.enqueue(key.to_string()).await,
        Intent::Ignored => {}
    }
}

async fn apply_expire_sync(key: &str, source: &Client, target: &Client, aggregator: &Aggregator) {
    let ttl: keymigrate_errors::Result<i64> = source.ttl(key).await.map_err(Into::into);
    match ttl {
        Ok(ttl) if ttl > 0 => match target.expire::<(), _>(key, ttl, None).await {
            Ok(_) => aggregator.record_key_processed(key, KeyOperation::Expire, key.len() as u64),
            Err(e) => aggregator.record_error(&EngineError::from(e).for_key(key)),
        },
        Ok(_) => {}
        Err(e) => aggregator.record_error(&e.for_key(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_operations_per_spec_table() {
        assert!(matches!(classify("del"), Intent::Delete));
        assert!(matches!(classify("expire"), Intent::ExpireSync));
        assert!(matches!(classify("rpush"), Intent::RebuildList));
        assert!(matches!(classify("sadd"), Intent::Enqueue));
        assert!(matches!(classify("restore"), Intent::Ignored));
    }
}
