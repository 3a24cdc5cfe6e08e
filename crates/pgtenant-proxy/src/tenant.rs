//! Tenant identifiers and their resolution to backend targets.

use crate::error::ProxyError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// An `(organization, project)` pair taken from the client's `database`
/// connection parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TenantKey {
    org: String,
    project: String,
}

impl TenantKey {
    /// Parse `org.project` or `org/project`.
    ///
    /// Exactly one separator is accepted and both segments must be non-empty.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let mut separators = raw.match_indices(['.', '/']);
        let (Some((at, sep)), None) = (separators.next(), separators.next()) else {
            return Err(ProxyError::InvalidTenant(raw.to_string()));
        };

        let org = &raw[..at];
        let project = &raw[at + sep.len()..];
        if org.is_empty() || project.is_empty() {
            return Err(ProxyError::InvalidTenant(raw.to_string()));
        }

        Ok(Self {
            org: org.to_string(),
            project: project.to_string(),
        })
    }

    pub fn new(org: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn project(&self) -> &str {
        &self.project
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.org, self.project)
    }
}

/// The backend serving a tenant, fixed at lookup time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendTarget {
    /// Deployment the target was resolved from.
    pub deployment_id: String,
    /// Runtime host, an HTTP URL or `host[:port]`.
    pub host: String,
    /// Instance on the runtime.
    pub instance_id: String,
    /// Audience minted credentials are scoped to.
    pub audience: String,
}

/// A project as known to the registry.
#[derive(Debug, Clone)]
pub struct Project {
    pub org: String,
    pub name: String,
    pub prod_deployment_id: Option<String>,
}

/// A running deployment as known to the registry.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    pub runtime_host: String,
    pub runtime_instance_id: String,
    pub runtime_audience: Option<String>,
}

/// Read-only view of the project/deployment registry.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn find_project_by_name(&self, org: &str, project: &str) -> anyhow::Result<Option<Project>>;

    async fn find_deployment(&self, id: &str) -> anyhow::Result<Option<Deployment>>;
}

/// Maps tenant keys to backend targets.
pub struct TenantResolver {
    registry: Arc<dyn ProjectRegistry>,
}

impl TenantResolver {
    pub fn new(registry: Arc<dyn ProjectRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve a raw `database` parameter.
    pub async fn resolve_raw(&self, raw: &str) -> Result<(TenantKey, BackendTarget), ProxyError> {
        let key = TenantKey::parse(raw)?;
        let target = self.resolve(&key).await?;
        Ok((key, target))
    }

    /// Resolve a tenant to its production backend.
    pub async fn resolve(&self, key: &TenantKey) -> Result<BackendTarget, ProxyError> {
        let project = self
            .registry
            .find_project_by_name(key.org(), key.project())
            .await
            .map_err(|e| ProxyError::Registry(e.to_string()))?
            .ok_or_else(|| ProxyError::TenantNotFound {
                tenant: key.to_string(),
            })?;

        let not_ready = || ProxyError::TenantNotReady {
            tenant: key.to_string(),
        };

        let deployment_id = project.prod_deployment_id.ok_or_else(not_ready)?;
        let deployment = self
            .registry
            .find_deployment(&deployment_id)
            .await
            .map_err(|e| ProxyError::Registry(e.to_string()))?
            .ok_or_else(not_ready)?;

        let audience = deployment
            .runtime_audience
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| deployment.runtime_host.clone());

        tracing::debug!(
            tenant = %key,
            deployment = %deployment.id,
            host = %deployment.runtime_host,
            "Resolved tenant"
        );

        Ok(BackendTarget {
            deployment_id: deployment.id,
            host: deployment.runtime_host,
            instance_id: deployment.runtime_instance_id,
            audience,
        })
    }
}
