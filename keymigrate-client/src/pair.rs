use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fred::clients::{RedisClient as Client, SubscriberClient};
use fred::interfaces::ClientLike;
use fred::types::RedisConfig as ClientConfig;
use fred::types::InfoKind;
use keymigrate_errors::{EngineError, Result};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;

/// How long a single liveness probe or connection attempt is allowed to
/// take before the engine gives up on it. There is no retry on top of
/// this: a timed-out validate() is a fatal, caller-visible failure.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The three sessions the engine owns for the lifetime of one migration:
/// a request/response session to the source, one to the target, and a
/// dedicated pub/sub session on the source (kept separate because the
/// wire protocol multiplexes subscriptions poorly with normal commands).
pub struct ConnectionPair {
    source_config: ConnectionConfig,
    target_config: ConnectionConfig,
    pub source: Client,
    pub target: Client,
    pub subscriber: SubscriberClient,
    closed: AtomicBool,
}

impl ConnectionPair {
    /// Open all three sessions. Any failure here tears down whatever
    /// sessions did open before returning the error.
    pub async fn connect(
        source_config: ConnectionConfig,
        target_config: ConnectionConfig,
    ) -> Result<Self> {
        let source = match Self::open_client(&source_config).await {
            Ok(c) => c,
            Err(e) => return Err(e),
        };

        let target = match Self::open_client(&target_config).await {
            Ok(c) => c,
            Err(e) => {
                let _ = source.quit().await;
                return Err(e);
            }
        };

        let subscriber = match Self::open_subscriber(&source_config).await {
            Ok(c) => c,
            Err(e) => {
                let _ = source.quit().await;
                let _ = target.quit().await;
                return Err(e);
            }
        };

        Ok(ConnectionPair {
            source_config,
            target_config,
            source,
            target,
            subscriber,
            closed: AtomicBool::new(false),
        })
    }

    async fn open_client(cfg: &ConnectionConfig) -> Result<Client> {
        let client_config: ClientConfig = cfg.to_client_config()?;
        let client = Client::new(client_config, None, None, None);
        client.connect();
        with_timeout(client.wait_for_connect()).await?;
        Ok(client)
    }

    async fn open_subscriber(cfg: &ConnectionConfig) -> Result<SubscriberClient> {
        let client_config: ClientConfig = cfg.to_client_config()?;
        let subscriber = SubscriberClient::new(client_config, None, None, None);
        subscriber.connect();
        with_timeout(subscriber.wait_for_connect()).await?;
        Ok(subscriber)
    }

    /// Pre-flight checks: both sides are alive, the target accepted
    /// authentication (implied by a successful post-connect ping), and
    /// source/target are not the same physical instance.
    pub async fn validate(&self) -> Result<()> {
        with_timeout(self.source.ping::<()>()).await?;
        with_timeout(self.target.ping::<()>()).await?;

        if self.is_same_instance().await? {
            return Err(EngineError::SameInstance);
        }

        Ok(())
    }

    async fn is_same_instance(&self) -> Result<bool> {
        let source_id = self.server_identity(&self.source).await;
        let target_id = self.server_identity(&self.target).await;

        match (source_id, target_id) {
            (Some(a), Some(b)) => Ok(a == b),
            _ => {
                debug!("falling back to host:port comparison for identity check");
                Ok(self.source_config.same_endpoint(&self.target_config))
            }
        }
    }

    /// Best-effort extraction of a stable server identity (the `run_id`
    /// line from `INFO server`). Returns `None` if the server doesn't
    /// expose one, in which case the caller falls back to host/port.
    async fn server_identity(&self, client: &Client) -> Option<String> {
        let info: String = with_timeout(client.info(Some(InfoKind::Server)))
            .await
            .ok()?;
        info.lines()
            .find_map(|line| line.strip_prefix("run_id:"))
            .map(|id| id.trim().to_string())
    }

    /// Close all three sessions. Safe to call more than once, and safe
    /// to call on a pair where one or more sessions never opened.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.source.quit().await {
            warn!(error = %e, "error closing source session");
        }
        if let Err(e) = self.target.quit().await {
            warn!(error = %e, "error closing target session");
        }
        if let Err(e) = self.subscriber.quit().await {
            warn!(error = %e, "error closing subscriber session");
        }
    }
}

async fn with_timeout<F, T>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, fred::error::RedisError>>,
{
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EngineError::Timeout(format!(
            "no response within {PROBE_TIMEOUT:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_endpoint_is_case_insensitive_on_host() {
        let a = ConnectionConfig::new("Redis-Host", 6379);
        let b = ConnectionConfig::new("redis-host", 6379);
        assert!(a.same_endpoint(&b));
    }

    #[test]
    fn different_ports_are_not_the_same_endpoint() {
        let a = ConnectionConfig::new("localhost", 6379);
        let b = ConnectionConfig::new("localhost", 6380);
        assert!(!a.same_endpoint(&b));
    }
}
