//! Static project and deployment registry.
//!
//! Lists which `(organization, project)` pairs exist, which deployment serves
//! each project in production, and who may read it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::ConfigError;

/// Projects and deployments known to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Registered projects.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// Registered deployments.
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

/// A project owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Organization name.
    pub org: String,

    /// Project name, unique within the organization.
    pub name: String,

    /// Deployment currently serving production traffic, if any.
    #[serde(default)]
    pub prod_deployment: Option<String>,

    /// Callers allowed to read production data.
    ///
    /// Entries are user subjects, `service:<name>` for service callers, or
    /// `*` for any authenticated caller.
    #[serde(default)]
    pub readers: Vec<String>,
}

/// A running backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment identifier referenced by `prod_deployment`.
    pub id: String,

    /// Runtime host, either an HTTP URL or `host[:port]`.
    pub runtime_host: String,

    /// Instance identifier on the runtime; used as the backend database name.
    pub runtime_instance_id: String,

    /// Audience for minted credentials. Defaults to the runtime host.
    #[serde(default)]
    pub runtime_audience: Option<String>,
}

impl RegistryConfig {
    /// Reject duplicate projects or deployments and dangling deployment references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut projects = HashSet::new();
        for project in &self.projects {
            if project.org.is_empty() || project.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "registry project org and name must be non-empty".to_string(),
                ));
            }
            if !projects.insert((project.org.as_str(), project.name.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate registry project {}.{}",
                    project.org, project.name
                )));
            }
        }

        let mut deployments = HashSet::new();
        for deployment in &self.deployments {
            if !deployments.insert(deployment.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate registry deployment {}",
                    deployment.id
                )));
            }
        }

        for project in &self.projects {
            if let Some(id) = &project.prod_deployment
                && !deployments.contains(id.as_str())
            {
                return Err(ConfigError::Invalid(format!(
                    "project {}.{} references unknown deployment {}",
                    project.org, project.name, id
                )));
            }
        }

        Ok(())
    }
}
