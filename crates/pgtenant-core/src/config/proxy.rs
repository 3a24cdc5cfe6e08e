//! Proxy listener and upstream connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the client-facing Postgres wire protocol listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on for incoming Postgres connections.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Maximum number of concurrent client connections.
    #[serde(default = "default_max_client_connections")]
    pub max_client_connections: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            max_client_connections: default_max_client_connections(),
        }
    }
}

impl ProxyConfig {
    /// The `host:port` string the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

/// How the proxy dials tenant backends.
///
/// The backend host itself comes from the deployment registry; these settings
/// cover everything the registry does not know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Postgres port used when a deployment's runtime host is an HTTP URL.
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Username presented to the backend. The password is always a freshly
    /// minted credential.
    #[serde(default = "default_username")]
    pub username: String,

    /// SSL mode for backend connections.
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Timeout in seconds when dialing a new backend connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// `application_name` reported to the backend.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            username: default_username(),
            ssl_mode: SslMode::default(),
            connect_timeout_seconds: default_connect_timeout(),
            application_name: default_application_name(),
        }
    }
}

impl UpstreamConfig {
    /// Dial timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// SSL mode for backend connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Disable SSL.
    Disable,
    /// Allow SSL but don't require it.
    Allow,
    /// Prefer SSL (default).
    #[default]
    Prefer,
    /// Require SSL.
    Require,
    /// Require SSL with CA verification.
    #[serde(rename = "verify-ca")]
    VerifyCa,
    /// Require SSL with full verification.
    #[serde(rename = "verify-full")]
    VerifyFull,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5433
}

fn default_max_client_connections() -> u32 {
    100
}

fn default_upstream_port() -> u16 {
    15432
}

fn default_username() -> String {
    "pgtenant".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_application_name() -> String {
    "pgtenant".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_port, 5433);
        assert_eq!(config.bind_address(), "0.0.0.0:5433");
    }

    #[test]
    fn test_upstream_partial_yaml_uses_defaults() {
        let config: UpstreamConfig = serde_yaml::from_str("username: reader\n").unwrap();
        assert_eq!(config.username, "reader");
        assert_eq!(config.port, 15432);
        assert_eq!(config.ssl_mode, SslMode::Prefer);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_ssl_mode_serialization() {
        let config = UpstreamConfig {
            ssl_mode: SslMode::VerifyFull,
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("verify-full"));
    }
}
