// Configuration types shared across all pgtenant crates
pub mod config;

// Re-export commonly used config types for convenience
pub use config::{
    BiscuitConfig,
    ConfigError,
    CredentialsConfig,
    DeploymentConfig,
    HealthConfig,
    ObservabilityConfig,
    PgTenantConfig,
    PoolConfig,
    PoolSettings,
    ProjectConfig,
    ProxyConfig,
    RegistryConfig,
    SslMode,
    UpstreamConfig,
    UsageConfig,
};
