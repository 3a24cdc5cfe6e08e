//! Error types for the proxy crate.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the tenant proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The database parameter is not an `org.project` or `org/project` pair.
    #[error("invalid tenant identifier {0:?}: expected <org>.<project> or <org>/<project>")]
    InvalidTenant(String),

    /// No project with this name exists.
    #[error("tenant {tenant} not found")]
    TenantNotFound { tenant: String },

    /// The project exists but has no production deployment.
    #[error("tenant {tenant} has no production deployment")]
    TenantNotReady { tenant: String },

    /// The caller may not read from this tenant.
    #[error("permission denied for tenant {tenant}")]
    PermissionDenied { tenant: String },

    /// The token issuer could not mint a backend credential.
    #[error("failed to mint backend credential: {0}")]
    CredentialMintFailed(String),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Timed out waiting for a free pooled connection.
    #[error("timed out after {timeout:?} waiting for a connection to {dsn}")]
    AcquireTimeout { dsn: String, timeout: Duration },

    /// Failed to dial or authenticate against the backend.
    #[error("failed to connect to upstream: {0}")]
    UpstreamDialFailed(String),

    /// The backend rejected the query; the message is the backend's own.
    #[error("{message}")]
    UpstreamQueryFailed {
        code: Option<String>,
        message: String,
    },

    /// A collaborator lookup failed for a reason other than not-found.
    #[error("registry lookup failed: {0}")]
    Registry(String),

    /// Failed to bind to the listen address.
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// The SQLSTATE reported to the client for this error.
    pub fn sqlstate(&self) -> &str {
        match self {
            ProxyError::InvalidTenant(_) | ProxyError::TenantNotFound { .. } => "3D000",
            ProxyError::TenantNotReady { .. } => "57P03",
            ProxyError::PermissionDenied { .. } => "42501",
            ProxyError::CredentialMintFailed(_) => "28000",
            ProxyError::PoolClosed => "57P01",
            ProxyError::AcquireTimeout { .. } | ProxyError::UpstreamDialFailed(_) => "08006",
            ProxyError::UpstreamQueryFailed { code, .. } => code.as_deref().unwrap_or("XX000"),
            ProxyError::Registry(_)
            | ProxyError::BindFailed { .. }
            | ProxyError::Internal(_) => "XX000",
        }
    }
}
