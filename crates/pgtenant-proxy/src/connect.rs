//! The connect hook: what happens before each new physical connection.

use crate::credential::{CallerIdentity, Credential, CredentialBroker};
use crate::error::ProxyError;
use crate::tenant::{BackendTarget, TenantKey, TenantResolver};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything known about the logical caller asking for a connection.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub tenant: TenantKey,
    pub caller: CallerIdentity,
    /// Target resolved when the session first needed it.
    pub target: BackendTarget,
}

/// Result of the connect hook: where to dial and with which secret.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub target: BackendTarget,
    pub credential: Credential,
}

/// Invoked by the pool once per new physical connection, never per lease.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn authenticate(&self, ctx: &ConnectContext) -> Result<Authenticated, ProxyError>;
}

/// Re-resolves the tenant and mints a credential through the broker.
pub struct BrokeredConnectionFactory {
    resolver: Arc<TenantResolver>,
    broker: Arc<CredentialBroker>,
}

impl BrokeredConnectionFactory {
    pub fn new(resolver: Arc<TenantResolver>, broker: Arc<CredentialBroker>) -> Self {
        Self { resolver, broker }
    }
}

#[async_trait]
impl ConnectionFactory for BrokeredConnectionFactory {
    async fn authenticate(&self, ctx: &ConnectContext) -> Result<Authenticated, ProxyError> {
        let target = self.resolver.resolve(&ctx.tenant).await?;
        if target != ctx.target {
            tracing::info!(
                tenant = %ctx.tenant,
                previous = %ctx.target.host,
                current = %target.host,
                "Tenant target rotated"
            );
        }

        let credential = self.broker.mint(&ctx.caller, &ctx.tenant, &target).await?;

        tracing::debug!(
            tenant = %ctx.tenant,
            caller = %ctx.caller,
            host = %target.host,
            instance = %target.instance_id,
            "Connect hook authenticated new upstream connection"
        );

        Ok(Authenticated { target, credential })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{ClaimsService, ScopedCredential, TokenIssuer};
    use crate::registry::ConfigRegistry;
    use pgtenant_core::{DeploymentConfig, ProjectConfig, RegistryConfig};
    use std::time::Duration;

    struct AllowAll;

    #[async_trait]
    impl ClaimsService for AllowAll {
        async fn identify(&self, _secret: Option<&str>) -> CallerIdentity {
            CallerIdentity::default()
        }

        async fn has_read_access(&self, _caller: &CallerIdentity, _tenant: &TenantKey) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct EchoIssuer;

    #[async_trait]
    impl TokenIssuer for EchoIssuer {
        async fn issue_token(&self, request: &ScopedCredential) -> anyhow::Result<String> {
            Ok(format!("{}@{}", request.subject, request.instance_id))
        }
    }

    fn factory(instance_id: &str) -> BrokeredConnectionFactory {
        let registry = ConfigRegistry::from_config(&RegistryConfig {
            projects: vec![ProjectConfig {
                org: "acme".into(),
                name: "sales".into(),
                prod_deployment: Some("dep-2".into()),
                readers: vec![],
            }],
            deployments: vec![DeploymentConfig {
                id: "dep-2".into(),
                runtime_host: "http://localhost:8082".into(),
                runtime_instance_id: instance_id.into(),
                runtime_audience: None,
            }],
        });
        let resolver = Arc::new(TenantResolver::new(Arc::new(registry)));
        let broker = Arc::new(CredentialBroker::new(
            Arc::new(AllowAll),
            Arc::new(EchoIssuer),
            Duration::from_secs(60),
        ));
        BrokeredConnectionFactory::new(resolver, broker)
    }

    #[tokio::test]
    async fn test_hook_follows_rotated_target() {
        let ctx = ConnectContext {
            tenant: TenantKey::new("acme", "sales"),
            caller: CallerIdentity::User {
                subject: "alice".into(),
            },
            target: BackendTarget {
                deployment_id: "dep-1".into(),
                host: "http://localhost:8081".into(),
                instance_id: "inst-1".into(),
                audience: "http://localhost:8081".into(),
            },
        };

        let auth = factory("inst-2").authenticate(&ctx).await.unwrap();
        assert_eq!(auth.target.instance_id, "inst-2");
        assert_eq!(auth.credential.expose(), "alice@inst-2");
    }
}
