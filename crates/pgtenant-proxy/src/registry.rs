//! Registry backed by the `registry` section of the configuration file.

use crate::tenant::{Deployment, Project, ProjectRegistry};
use async_trait::async_trait;
use pgtenant_core::RegistryConfig;
use std::collections::HashMap;

/// A static, in-memory [`ProjectRegistry`].
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    projects: HashMap<(String, String), Project>,
    deployments: HashMap<String, Deployment>,
}

impl ConfigRegistry {
    pub fn from_config(config: &RegistryConfig) -> Self {
        let projects = config
            .projects
            .iter()
            .map(|p| {
                (
                    (p.org.clone(), p.name.clone()),
                    Project {
                        org: p.org.clone(),
                        name: p.name.clone(),
                        prod_deployment_id: p.prod_deployment.clone(),
                    },
                )
            })
            .collect();

        let deployments = config
            .deployments
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    Deployment {
                        id: d.id.clone(),
                        runtime_host: d.runtime_host.clone(),
                        runtime_instance_id: d.runtime_instance_id.clone(),
                        runtime_audience: d.runtime_audience.clone(),
                    },
                )
            })
            .collect();

        Self {
            projects,
            deployments,
        }
    }

    /// Registered projects, sorted by `org.project`.
    pub fn projects(&self) -> Vec<&Project> {
        let mut projects: Vec<_> = self.projects.values().collect();
        projects.sort_by(|a, b| (&a.org, &a.name).cmp(&(&b.org, &b.name)));
        projects
    }
}

#[async_trait]
impl ProjectRegistry for ConfigRegistry {
    async fn find_project_by_name(&self, org: &str, project: &str) -> anyhow::Result<Option<Project>> {
        Ok(self
            .projects
            .get(&(org.to_string(), project.to_string()))
            .cloned())
    }

    async fn find_deployment(&self, id: &str) -> anyhow::Result<Option<Deployment>> {
        Ok(self.deployments.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtenant_core::{DeploymentConfig, ProjectConfig};

    #[tokio::test]
    async fn test_lookup() {
        let registry = ConfigRegistry::from_config(&RegistryConfig {
            projects: vec![
                ProjectConfig {
                    org: "zeta".into(),
                    name: "a".into(),
                    prod_deployment: None,
                    readers: vec![],
                },
                ProjectConfig {
                    org: "acme".into(),
                    name: "sales".into(),
                    prod_deployment: Some("dep-1".into()),
                    readers: vec![],
                },
            ],
            deployments: vec![DeploymentConfig {
                id: "dep-1".into(),
                runtime_host: "db.internal:5432".into(),
                runtime_instance_id: "inst-1".into(),
                runtime_audience: Some("https://runtime.example".into()),
            }],
        });

        let project = registry
            .find_project_by_name("acme", "sales")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.prod_deployment_id.as_deref(), Some("dep-1"));
        assert!(registry.find_project_by_name("acme", "x").await.unwrap().is_none());

        let deployment = registry.find_deployment("dep-1").await.unwrap().unwrap();
        assert_eq!(deployment.runtime_instance_id, "inst-1");

        let names: Vec<_> = registry.projects().iter().map(|p| p.org.as_str()).collect();
        assert_eq!(names, vec!["acme", "zeta"]);
    }
}
