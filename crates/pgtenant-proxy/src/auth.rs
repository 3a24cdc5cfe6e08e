//! Biscuit-backed claims service and token issuer.

use crate::credential::{CallerIdentity, ClaimsService, ScopedCredential, TokenIssuer, strip_bearer};
use crate::tenant::TenantKey;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use pgtenant_biscuit::{PrincipalKind, ScopedClaims, TokenBuilder, TokenVerifier};
use pgtenant_core::RegistryConfig;
use std::collections::HashMap;

/// Reader entry granting access to every authenticated caller.
const ANY_READER: &str = "*";

/// Identifies callers from Biscuit access tokens presented as the password.
///
/// Read access comes from each project's `readers` list.
pub struct BiscuitClaimsService {
    verifier: TokenVerifier,
    readers: HashMap<(String, String), Vec<String>>,
}

impl BiscuitClaimsService {
    pub fn new(verifier: TokenVerifier, readers: HashMap<(String, String), Vec<String>>) -> Self {
        Self { verifier, readers }
    }

    pub fn from_config(verifier: TokenVerifier, registry: &RegistryConfig) -> Self {
        let readers = registry
            .projects
            .iter()
            .map(|p| ((p.org.clone(), p.name.clone()), p.readers.clone()))
            .collect();
        Self::new(verifier, readers)
    }
}

#[async_trait]
impl ClaimsService for BiscuitClaimsService {
    async fn identify(&self, secret: Option<&str>) -> CallerIdentity {
        let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
            return CallerIdentity::anonymous(None);
        };

        match self.verifier.verify_access(strip_bearer(secret)) {
            Ok(claims) => match claims.kind {
                PrincipalKind::User => CallerIdentity::User {
                    subject: claims.subject,
                },
                PrincipalKind::Service => CallerIdentity::Service {
                    subject: claims.subject,
                },
            },
            Err(e) => {
                tracing::debug!(error = %e, "Password is not an access token, treating caller as anonymous");
                CallerIdentity::anonymous(Some(secret.to_string()))
            }
        }
    }

    async fn has_read_access(&self, caller: &CallerIdentity, tenant: &TenantKey) -> anyhow::Result<bool> {
        let wanted = match caller {
            CallerIdentity::Anonymous { .. } => return Ok(false),
            CallerIdentity::User { subject } => subject.clone(),
            CallerIdentity::Service { subject } => format!("service:{subject}"),
        };

        let readers = self
            .readers
            .get(&(tenant.org().to_string(), tenant.project().to_string()));

        Ok(readers.is_some_and(|readers| {
            readers
                .iter()
                .any(|reader| reader == ANY_READER || *reader == wanted)
        }))
    }
}

/// Signs scoped credentials as Biscuit tokens.
pub struct BiscuitTokenIssuer {
    builder: TokenBuilder,
}

impl BiscuitTokenIssuer {
    pub fn new(builder: TokenBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl TokenIssuer for BiscuitTokenIssuer {
    async fn issue_token(&self, request: &ScopedCredential) -> anyhow::Result<String> {
        let ttl = chrono::Duration::from_std(request.ttl).context("credential TTL out of range")?;
        let claims = ScopedClaims {
            audience: request.audience.clone(),
            subject: request.subject.clone(),
            instance_id: request.instance_id.clone(),
            permissions: request.permissions.clone(),
            attributes: request.attributes.clone(),
            expires_at: Utc::now() + ttl,
        };

        Ok(self.builder.mint_scoped_credential(&claims)?)
    }
}
