//! Error taxonomy for the key-value migration engine.
//!
//! One enum, [`EngineError`], covers every failure surface named in the
//! engine's design: connection/validation failures (fatal), lifecycle
//! misuse (caller-visible, non-fatal), and per-key replication failures
//! (recorded, non-fatal). Call sites distinguish kinds by matching on the
//! variant rather than inspecting message text.

use std::fmt;

use thiserror::Error;

/// Everything that can go wrong while standing up, running, or tearing
/// down a migration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source or target refused the TCP connection outright.
    #[error("connection refused: {0}")]
    ConnRefused(String),

    /// Authentication against the source or target was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A request to the source or target did not complete in time.
    #[error("connection timed out: {0}")]
    Timeout(String),

    /// The configured host could not be resolved.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// An established connection was reset mid-operation.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Source and target resolved to the same server instance.
    #[error("source and target are the same instance")]
    SameInstance,

    /// `start()` was called while the engine was already running.
    #[error("migration is already running")]
    AlreadyRunning,

    /// The replicator saw a key type outside the five supported kinds.
    #[error("unsupported key type {0:?} for key {key:?}", key = .1)]
    UnsupportedType(String, String),

    /// Replicating a single key failed; the key and the underlying cause
    /// are both retained for the error list and the `error` event.
    #[error("failed to replicate key {key:?}: {source}")]
    KeyReplicationFailed {
        key: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The change subscriber's receive loop failed.
    #[error("change subscriber error: {0}")]
    SubscriberError(String),

    /// The source's keyspace-notification configuration could not be
    /// brought into a usable state.
    #[error("failed to configure keyspace notifications: {0}")]
    ConfigurationError(String),
}

impl EngineError {
    /// Whether this error kind is fatal to the migration as a whole (as
    /// opposed to a per-key failure that the engine can continue past).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConnRefused(_)
                | EngineError::AuthFailed(_)
                | EngineError::Timeout(_)
                | EngineError::HostNotFound(_)
                | EngineError::ConnectionReset(_)
                | EngineError::SameInstance
                | EngineError::ConfigurationError(_)
        )
    }

    /// Wrap `self` as the cause of a [`EngineError::KeyReplicationFailed`]
    /// for the given key.
    pub fn for_key(self, key: impl Into<String>) -> EngineError {
        EngineError::KeyReplicationFailed {
            key: key.into(),
            source: Box::new(self),
        }
    }
}

/// Classify a [`fred`] client error into one of the connection-level
/// [`EngineError`] kinds. `fred` reports a single flat error type with a
/// `kind()` accessor; we bucket it the way the engine's callers need to
/// distinguish it, falling back to `ConnRefused` for anything we don't
/// have a more specific bucket for.
pub fn classify_client_error(err: &fred::error::RedisError) -> EngineError {
    use fred::error::RedisErrorKind;

    let detail = err.to_string();
    match err.kind() {
        RedisErrorKind::Auth => EngineError::AuthFailed(detail),
        RedisErrorKind::Timeout => EngineError::Timeout(detail),
        RedisErrorKind::IO => EngineError::ConnectionReset(detail),
        RedisErrorKind::Config | RedisErrorKind::Url | RedisErrorKind::Unknown => {
            EngineError::HostNotFound(detail)
        }
        _ => EngineError::ConnRefused(detail),
    }
}

impl From<fred::error::RedisError> for EngineError {
    fn from(err: fred::error::RedisError) -> Self {
        classify_client_error(&err)
    }
}

/// Convenience alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A lightweight, `Clone`-able summary of an [`EngineError`] suitable for
/// inclusion in [`crate`]-external progress snapshots, where the full
/// error (and its non-`Clone` source chain) would be awkward to carry
/// around.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub key: Option<String>,
    pub message: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{key}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<&EngineError> for ErrorRecord {
    fn from(err: &EngineError) -> Self {
        let key = match err {
            EngineError::KeyReplicationFailed { key, .. } => Some(key.clone()),
            _ => None,
        };
        ErrorRecord {
            key,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_spec_taxonomy() {
        assert!(EngineError::SameInstance.is_fatal());
        assert!(EngineError::AuthFailed("x".into()).is_fatal());
        assert!(!EngineError::AlreadyRunning.is_fatal());
        assert!(!EngineError::UnsupportedType("stream".into(), "k1".into()).is_fatal());
    }

    #[test]
    fn key_replication_failure_wraps_and_reports_key() {
        let inner = EngineError::ConnectionReset("boom".into());
        let wrapped = inner.for_key("my-key");
        let record = ErrorRecord::from(&wrapped);
        assert_eq!(record.key.as_deref(), Some("my-key"));
        assert!(record.message.contains("my-key"));
    }
}
