//! Caller identities and the credential broker.
//!
//! The broker decides what secret a new backend connection authenticates
//! with. Anonymous callers can only forward the secret they presented;
//! authenticated callers get a freshly minted credential scoped to a single
//! backend instance with read-only permissions.

use crate::error::ProxyError;
use crate::tenant::{BackendTarget, TenantKey};
use async_trait::async_trait;
use pgtenant_biscuit::InstancePermission;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Who is on the other end of a client connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// No verifiable identity. Carries whatever password the client sent.
    Anonymous { presented_secret: Option<String> },
    /// A verified person.
    User { subject: String },
    /// A verified service account.
    Service { subject: String },
}

impl CallerIdentity {
    pub fn anonymous(presented_secret: Option<String>) -> Self {
        CallerIdentity::Anonymous { presented_secret }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, CallerIdentity::Anonymous { .. })
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            CallerIdentity::Anonymous { .. } => None,
            CallerIdentity::User { subject } | CallerIdentity::Service { subject } => Some(subject),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallerIdentity::Anonymous { .. } => "anonymous",
            CallerIdentity::User { .. } => "user",
            CallerIdentity::Service { .. } => "service",
        }
    }
}

impl Default for CallerIdentity {
    fn default() -> Self {
        CallerIdentity::Anonymous {
            presented_secret: None,
        }
    }
}

impl fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerIdentity::Anonymous { presented_secret } => f
                .debug_struct("Anonymous")
                .field("presented_secret", &presented_secret.as_ref().map(|_| "<redacted>"))
                .finish(),
            CallerIdentity::User { subject } => f.debug_struct("User").field("subject", subject).finish(),
            CallerIdentity::Service { subject } => {
                f.debug_struct("Service").field("subject", subject).finish()
            }
        }
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "{}:{}", self.kind(), subject),
            None => f.write_str(self.kind()),
        }
    }
}

/// Secret a backend connection authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    /// The raw secret, for handing to the backend.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

/// What a minted credential grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedCredential {
    pub audience: String,
    pub subject: String,
    pub ttl: Duration,
    pub instance_id: String,
    pub permissions: Vec<InstancePermission>,
    pub attributes: BTreeMap<String, String>,
}

/// Identifies callers and gates read access.
#[async_trait]
pub trait ClaimsService: Send + Sync {
    /// Identify the caller from the password presented at startup.
    async fn identify(&self, secret: Option<&str>) -> CallerIdentity;

    /// Whether the caller may read the tenant's production data.
    async fn has_read_access(&self, caller: &CallerIdentity, tenant: &TenantKey) -> anyhow::Result<bool>;
}

/// Signs scoped credentials.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self, request: &ScopedCredential) -> anyhow::Result<String>;
}

/// Produces the secret for each new physical backend connection.
pub struct CredentialBroker {
    claims: Arc<dyn ClaimsService>,
    issuer: Arc<dyn TokenIssuer>,
    ttl: Duration,
    permissions: Vec<InstancePermission>,
}

impl CredentialBroker {
    /// Broker minting credentials that live for `ttl` with read-only
    /// instance permissions.
    pub fn new(claims: Arc<dyn ClaimsService>, issuer: Arc<dyn TokenIssuer>, ttl: Duration) -> Self {
        Self {
            claims,
            issuer,
            ttl,
            permissions: InstancePermission::READ_ONLY.to_vec(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Produce a credential for one new connection to `target`.
    pub async fn mint(
        &self,
        caller: &CallerIdentity,
        tenant: &TenantKey,
        target: &BackendTarget,
    ) -> Result<Credential, ProxyError> {
        let subject = match caller {
            CallerIdentity::Anonymous { presented_secret } => {
                return Ok(passthrough_credential(presented_secret.as_deref()));
            }
            CallerIdentity::User { subject } | CallerIdentity::Service { subject } => subject,
        };

        let allowed = self
            .claims
            .has_read_access(caller, tenant)
            .await
            .map_err(|e| ProxyError::Registry(e.to_string()))?;
        if !allowed {
            tracing::warn!(tenant = %tenant, caller = %caller, "Read access denied");
            return Err(ProxyError::PermissionDenied {
                tenant: tenant.to_string(),
            });
        }

        let request = ScopedCredential {
            audience: target.audience.clone(),
            subject: subject.clone(),
            ttl: self.ttl,
            instance_id: target.instance_id.clone(),
            permissions: self.permissions.clone(),
            attributes: BTreeMap::from([
                ("subject".to_string(), subject.clone()),
                ("caller_kind".to_string(), caller.kind().to_string()),
                ("tenant".to_string(), tenant.to_string()),
            ]),
        };

        let token = self
            .issuer
            .issue_token(&request)
            .await
            .map_err(|e| ProxyError::CredentialMintFailed(e.to_string()))?;

        tracing::debug!(
            tenant = %tenant,
            caller = %caller,
            instance = %target.instance_id,
            ttl_secs = self.ttl.as_secs(),
            "Minted scoped credential"
        );

        Ok(Credential::new(token))
    }
}

/// `secret` without a case-insensitive `Bearer ` prefix.
pub(crate) fn strip_bearer(secret: &str) -> &str {
    const PREFIX: &str = "bearer ";
    let secret = secret.trim();
    match secret.get(..PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PREFIX) => secret[PREFIX.len()..].trim(),
        _ => secret,
    }
}

/// Forward what an anonymous client sent, minus a `Bearer ` prefix.
fn passthrough_credential(secret: Option<&str>) -> Credential {
    let Some(secret) = secret.map(str::trim).filter(|s| !s.is_empty()) else {
        return Credential::empty();
    };
    Credential::new(strip_bearer(secret))
}
