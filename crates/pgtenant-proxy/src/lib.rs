//! # pgtenant-proxy
//!
//! Tenant-aware Postgres wire protocol proxy.
//!
//! Clients connect with `database=<org>.<project>` (or `<org>/<project>`). The
//! proxy:
//! - Identifies the caller from the connection password
//! - Resolves the tenant to its production deployment on the first real query
//! - Mints a short-lived, read-only credential for each new backend connection
//! - Pools backend connections per (backend, tenant, caller) and recycles them
//!   before their credential expires
//! - Answers `SET`/`BEGIN`/`COMMIT`/`ROLLBACK` locally and forwards everything
//!   else, marking the deployment as used
//!
//! ## Architecture
//!
//! ```text
//! Client (psql, driver)
//!       │
//!       │ Postgres wire protocol, database = org.project
//!       ▼
//! ┌──────────────────────┐
//! │  pgtenant proxy      │
//! │  1. Identify caller  │  ← ClaimsService
//! │  2. Classify query   │
//! │  3. Resolve tenant   │  ← ProjectRegistry
//! │  4. Lease connection │  ← ConnectionPool → connect hook → TokenIssuer
//! │  5. Forward          │
//! │  6. Mark used        │  ← UsageTracker
//! └──────────┬───────────┘
//!            │
//!            ▼
//!   Tenant backend instance
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use pgtenant_biscuit::{KeyPair, TokenBuilder, TokenVerifier};
//! use pgtenant_core::{PoolSettings, ProxyConfig, RegistryConfig, UpstreamConfig};
//! use pgtenant_proxy::{
//!     BiscuitClaimsService, BiscuitTokenIssuer, BrokeredConnectionFactory, ConfigRegistry,
//!     ConnectionPool, CredentialBroker, PgDialer, PgTenantProxy, TenantResolver,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let keypair = KeyPair::generate()?;
//!     let registry = RegistryConfig::default();
//!
//!     let claims = Arc::new(BiscuitClaimsService::from_config(
//!         TokenVerifier::new(keypair.public_key()),
//!         &registry,
//!     ));
//!     let issuer = Arc::new(BiscuitTokenIssuer::new(TokenBuilder::new(keypair)));
//!     let resolver = Arc::new(TenantResolver::new(Arc::new(ConfigRegistry::from_config(&registry))));
//!     let broker = Arc::new(CredentialBroker::new(claims.clone(), issuer, Duration::from_secs(1800)));
//!
//!     let pool = Arc::new(ConnectionPool::new(
//!         PoolSettings::default(),
//!         Arc::new(BrokeredConnectionFactory::new(resolver.clone(), broker)),
//!         Arc::new(PgDialer::new(UpstreamConfig::default())),
//!     ));
//!
//!     let proxy = PgTenantProxy::new(ProxyConfig::default(), resolver, claims, pool, None);
//!     proxy.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod command;
pub mod connect;
pub mod credential;
pub mod error;
pub mod handler;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod tenant;
pub mod upstream;
pub mod usage;

pub use auth::{BiscuitClaimsService, BiscuitTokenIssuer};
pub use command::CommandKind;
pub use connect::{Authenticated, BrokeredConnectionFactory, ConnectContext, ConnectionFactory};
pub use credential::{CallerIdentity, ClaimsService, Credential, CredentialBroker, ScopedCredential, TokenIssuer};
pub use error::ProxyError;
pub use handler::{SessionContext, TenantQueryHandler, TenantServerHandlers, TenantStartupHandler};
pub use health::{HealthReport, HealthState, create_router as health_router, serve_health};
pub use pool::{ConnectionPool, Lease, PoolKey, PoolStats};
pub use proxy::PgTenantProxy;
pub use registry::ConfigRegistry;
pub use tenant::{BackendTarget, Deployment, Project, ProjectRegistry, TenantKey, TenantResolver};
pub use upstream::{Dialer, PgDialer, UpstreamAddress, UpstreamColumn, UpstreamConnection, UpstreamError, UpstreamRows};
pub use usage::{InMemoryUsageTracker, UsageRecord, UsageRecorder, UsageTracker};
