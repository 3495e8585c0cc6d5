use std::collections::HashMap;

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{
    HashesInterface, KeysInterface, ListInterface, SetsInterface, SortedSetsInterface,
};
use keymigrate_errors::{EngineError, Result};
use keymigrate_metrics::KeyOperation;
use tracing::{debug, trace};

use crate::key_kind::KeyKind;

/// No expiry, as reported by `TTL`.
const NO_EXPIRY: i64 = -1;
/// The key vanished between the exists-check and the `TTL` read.
const KEY_VANISHED: i64 = -2;

/// What replicating one key actually did, for the aggregator to turn
/// into a `keyProcessed` event and a byte count.
pub struct ReplicationOutcome {
    pub operation: KeyOperation,
    pub bytes: u64,
}

/// Copies one key's state from a source session to a target session. A
/// trait rather than a bare function so the scanner, subscriber, and
/// coalescing queue can all be driven by a fake in tests without a live
/// connection, the same way the teacher drives its query layer behind
/// `UpstreamDatabase`.
#[async_trait]
pub trait KeyReplicator: Send + Sync {
    async fn replicate(&self, key: &str) -> Result<ReplicationOutcome>;
}

/// The real implementation: an authenticated source/target [`Client`]
/// pair, following the five-step algorithm from the component design
/// (exists-check, type, TTL, dispatch-by-type, TTL-propagation).
pub struct FredReplicator {
    pub source: Client,
    pub target: Client,
}

#[async_trait]
impl KeyReplicator for FredReplicator {
    async fn replicate(&self, key: &str) -> Result<ReplicationOutcome> {
        replicate_key_inner(&self.source, &self.target, key)
            .await
            .map_err(|e| e.for_key(key))
    }
}

async fn replicate_key_inner(
    source: &Client,
    target: &Client,
    key: &str,
) -> Result<ReplicationOutcome> {
    let exists: bool = source.exists(key).await?;
    if !exists {
        return delete_on_target(target, key).await;
    }

    let type_tag: String = source.key_type(key).await?;
    let kind = KeyKind::from_type_tag(&type_tag);

    let ttl: i64 = source.ttl(key).await?;
    if ttl == KEY_VANISHED {
        return delete_on_target(target, key).await;
    }

    let mut bytes = key.len() as u64;
    match kind {
        KeyKind::Scalar => bytes += replicate_scalar(source, target, key).await?,
        KeyKind::Map => bytes += replicate_map(source, target, key).await?,
        KeyKind::UnorderedSet => bytes += replicate_set(source, target, key).await?,
        KeyKind::OrderedSet => bytes += replicate_zset(source, target, key).await?,
        KeyKind::List => bytes += replicate_list(source, target, key).await?,
        KeyKind::Other(tag) => return Err(EngineError::UnsupportedType(tag, key.to_string())),
    }

    if ttl > NO_EXPIRY {
        target.expire::<(), _>(key, ttl, None).await?;
    }

    Ok(ReplicationOutcome {
        operation: KeyOperation::Update,
        bytes,
    })
}

async fn delete_on_target(target: &Client, key: &str) -> Result<ReplicationOutcome> {
    trace!(key, "key absent on source, deleting on target");
    target.del::<(), _>(key).await?;
    Ok(ReplicationOutcome {
        operation: KeyOperation::Delete,
        bytes: key.len() as u64,
    })
}

async fn replicate_scalar(source: &Client, target: &Client, key: &str) -> Result<u64> {
    let value: Vec<u8> = source.get(key).await?;
    let len = value.len() as u64;
    target.set::<(), _, _>(key, value, None, None, false).await?;
    Ok(len)
}

async fn replicate_map(source: &Client, target: &Client, key: &str) -> Result<u64> {
    let fields: HashMap<String, Vec<u8>> = source.hgetall(key).await?;
    if fields.is_empty() {
        return Ok(0);
    }
    let bytes = fields
        .iter()
        .map(|(f, v)| f.len() as u64 + v.len() as u64)
        .sum();
    target.hset::<(), _, _>(key, fields).await?;
    Ok(bytes)
}

async fn replicate_set(source: &Client, target: &Client, key: &str) -> Result<u64> {
    let members: Vec<Vec<u8>> = source.smembers(key).await?;
    if members.is_empty() {
        return Ok(0);
    }
    let bytes = members.iter().map(|m| m.len() as u64).sum();
    target.sadd::<(), _, _>(key, members).await?;
    Ok(bytes)
}

async fn replicate_zset(source: &Client, target: &Client, key: &str) -> Result<u64> {
    // WITHSCORES, ascending by member score, the whole set.
    let members: Vec<(Vec<u8>, f64)> = source.zrange(key, 0, -1, None, false, None, true).await?;
    if members.is_empty() {
        return Ok(0);
    }
    let bytes = members.iter().map(|(m, _)| m.len() as u64).sum();
    let pairs: Vec<(f64, Vec<u8>)> = members.into_iter().map(|(m, s)| (s, m)).collect();
    target
        .zadd::<(), _, _>(key, None, None, false, false, pairs)
        .await?;
    Ok(bytes)
}

async fn replicate_list(source: &Client, target: &Client, key: &str) -> Result<u64> {
    let items: Vec<Vec<u8>> = source.lrange(key, 0, -1).await?;
    // Mandatory delete-then-append: lists accumulate if re-pushed without
    // first clearing, which would both duplicate and misorder elements.
    target.del::<(), _>(key).await?;
    if items.is_empty() {
        return Ok(0);
    }
    let bytes = items.iter().map(|i| i.len() as u64).sum();
    debug!(key, count = items.len(), "re-pushing list");
    target.rpush::<(), _, _>(key, items).await?;
    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// An in-memory stand-in for [`FredReplicator`], used to exercise the
    /// scanner/queue/subscriber concurrency and coalescing logic without a
    /// live connection. Tracks how many times each key was replicated so
    /// tests can assert the idempotence and coalescing invariants from the
    /// spec's testable-properties section.
    #[derive(Default)]
    pub struct FakeReplicator {
        pub state: Mutex<HashMap<String, u64>>,
        pub call_counts: Mutex<HashMap<String, u32>>,
        pub fail_keys: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl KeyReplicator for FakeReplicator {
        async fn replicate(&self, key: &str) -> Result<ReplicationOutcome> {
            *self
                .call_counts
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_insert(0) += 1;

            if self.fail_keys.lock().unwrap().contains(key) {
                return Err(EngineError::ConnectionReset("injected failure".into()).for_key(key));
            }

            self.state
                .lock()
                .unwrap()
                .entry(key.to_string())
                .and_modify(|v| *v += 1)
                .or_insert(1);

            Ok(ReplicationOutcome {
                operation: KeyOperation::Update,
                bytes: key.len() as u64,
            })
        }
    }
}
