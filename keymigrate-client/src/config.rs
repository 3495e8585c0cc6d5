use fred::types::{RedisConfig as ClientConfig, Server, ServerConfig, TlsConfig};

use keymigrate_errors::Result;

/// Everything needed to open an authenticated session against one side of
/// a migration (the source or the target).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: bool,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionConfig {
            host: host.into(),
            port,
            password: None,
            tls: false,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Two configs address the same server iff host and port match,
    /// independent of case on the hostname.
    pub fn same_endpoint(&self, other: &ConnectionConfig) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }

    pub(crate) fn to_client_config(&self) -> Result<ClientConfig> {
        let tls = if self.tls {
            Some(TlsConfig::from(fred::types::TlsConnector::default_rustls()?))
        } else {
            None
        };
        Ok(ClientConfig {
            server: ServerConfig::Centralized {
                server: Server::new(self.host.clone(), self.port),
            },
            password: self.password.clone(),
            tls,
            ..Default::default()
        })
    }
}
