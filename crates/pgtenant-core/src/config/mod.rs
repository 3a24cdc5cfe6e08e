//! Configuration types for the pgtenant proxy.
//!
//! A single file (YAML, or TOML when the extension is `.toml`) configures the
//! listener, how backends are dialed, pool and credential lifetimes, keys, the
//! static project registry and observability.
//!
//! ```yaml
//! proxy:
//!   listen_port: 5433
//! credentials:
//!   ttl_seconds: 1800
//! pool:
//!   lifetime_margin_seconds: 60
//!   idle_timeout_seconds: 300
//! registry:
//!   projects:
//!     - { org: acme, name: sales, prod_deployment: dep-1, readers: ["*"] }
//!   deployments:
//!     - { id: dep-1, runtime_host: "http://localhost:8081", runtime_instance_id: inst-1 }
//! ```

pub mod biscuit;
pub mod pool;
pub mod proxy;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use biscuit::BiscuitConfig;
pub use pool::{CredentialsConfig, PoolConfig, PoolSettings};
pub use proxy::{ProxyConfig, SslMode, UpstreamConfig};
pub use registry::{DeploymentConfig, ProjectConfig, RegistryConfig};

/// Complete pgtenant configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PgTenantConfig {
    /// Client-facing listener.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// How backends are dialed.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Per-backend pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Scoped credential settings.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Biscuit key locations.
    #[serde(default)]
    pub biscuit: BiscuitConfig,

    /// Static project/deployment registry.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Usage tracking.
    #[serde(default)]
    pub usage: UsageConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Usage tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Whether served queries mark their deployment as used.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    /// Health check endpoint.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether the health endpoint is served.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the health endpoint.
    #[serde(default = "default_health_addr")]
    pub listen_addr: String,

    /// Port for the health endpoint.
    #[serde(default = "default_health_port")]
    pub port: u16,

    /// Path for the health endpoint.
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_health_addr(),
            port: default_health_port(),
            path: default_health_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    8081
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl PgTenantConfig {
    /// Load and validate configuration from a YAML or TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let config = if path.extension().is_some_and(|e| e == "toml") {
            Self::from_toml(&content)?
        } else {
            Self::from_yaml(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool_settings()?;
        self.registry.validate()?;
        if self.proxy.max_client_connections == 0 {
            return Err(ConfigError::Invalid(
                "proxy.max_client_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool timings derived from the pool and credential sections.
    pub fn pool_settings(&self) -> Result<PoolSettings, ConfigError> {
        PoolSettings::resolve(&self.pool, &self.credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_empty_yaml_is_all_defaults() {
        let config = PgTenantConfig::from_yaml("{}").unwrap();
        assert_eq!(config.proxy.listen_port, 5433);
        assert_eq!(config.credentials.ttl(), Duration::from_secs(1800));
        assert!(config.usage.enabled);
        assert!(!config.observability.health.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[proxy]
listen_port = 6543

[credentials]
ttl_seconds = 600

[pool]
lifetime_margin_seconds = 30
"#
        )
        .unwrap();

        let config = PgTenantConfig::from_file(file.path()).unwrap();
        assert_eq!(config.proxy.listen_port, 6543);
        assert_eq!(
            config.pool_settings().unwrap().max_conn_lifetime,
            Duration::from_secs(570)
        );
    }

    #[test]
    fn test_from_file_runs_validation() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "credentials:\n  ttl_seconds: 30\n").unwrap();

        let err = PgTenantConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
