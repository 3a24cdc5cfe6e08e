//! Connection pool and credential lifetime configuration.
//!
//! Pooled backend connections authenticate with a short-lived credential, so
//! the pool's maximum connection lifetime is derived from the credential TTL
//! rather than configured on its own: `max_conn_lifetime = ttl - margin`.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-backend connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum physical connections per pool entry.
    #[serde(default = "default_max_connections")]
    pub max_connections_per_entry: u32,

    /// Timeout in seconds when waiting for a free connection.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,

    /// How often idle connections are pinged.
    #[serde(default = "default_health_check_period")]
    pub health_check_period_seconds: u64,

    /// How long before credential expiry a connection is recycled.
    #[serde(default = "default_lifetime_margin")]
    pub lifetime_margin_seconds: u64,

    /// Idle connections unused for this long are closed. An entry left with
    /// no connections is removed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_entry: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout(),
            health_check_period_seconds: default_health_check_period(),
            lifetime_margin_seconds: default_lifetime_margin(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

/// Scoped credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Lifetime of each minted backend credential.
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
        }
    }
}

impl CredentialsConfig {
    /// Credential TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Resolved pool timings, ready for the pool to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum physical connections per pool entry.
    pub max_connections: u32,
    /// Maximum wait for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connection ping interval.
    pub health_check_period: Duration,
    /// Connections older than this are closed, never handed out.
    pub max_conn_lifetime: Duration,
    /// Idle connections unused for this long are closed.
    pub idle_timeout: Duration,
}

impl PoolSettings {
    /// Combine pool and credential configuration.
    ///
    /// Fails when the margin would leave no usable lifetime, or when any
    /// period is zero.
    pub fn resolve(pool: &PoolConfig, credentials: &CredentialsConfig) -> Result<Self, ConfigError> {
        if pool.max_connections_per_entry == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections_per_entry must be at least 1".to_string(),
            ));
        }
        if pool.health_check_period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "pool.health_check_period_seconds must be greater than 0".to_string(),
            ));
        }
        if pool.lifetime_margin_seconds == 0 {
            return Err(ConfigError::Invalid(
                "pool.lifetime_margin_seconds must be greater than 0".to_string(),
            ));
        }
        if pool.idle_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "pool.idle_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if pool.lifetime_margin_seconds >= credentials.ttl_seconds {
            return Err(ConfigError::Invalid(format!(
                "pool.lifetime_margin_seconds ({}) must be below credentials.ttl_seconds ({})",
                pool.lifetime_margin_seconds, credentials.ttl_seconds
            )));
        }

        Ok(Self {
            max_connections: pool.max_connections_per_entry,
            acquire_timeout: Duration::from_secs(pool.acquire_timeout_seconds),
            health_check_period: Duration::from_secs(pool.health_check_period_seconds),
            max_conn_lifetime: Duration::from_secs(
                credentials.ttl_seconds - pool.lifetime_margin_seconds,
            ),
            idle_timeout: Duration::from_secs(pool.idle_timeout_seconds),
        })
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout: Duration::from_secs(default_acquire_timeout()),
            health_check_period: Duration::from_secs(default_health_check_period()),
            max_conn_lifetime: Duration::from_secs(default_ttl() - default_lifetime_margin()),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_health_check_period() -> u64 {
    60
}

fn default_lifetime_margin() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    5 * 60
}

fn default_ttl() -> u64 {
    30 * 60
}
