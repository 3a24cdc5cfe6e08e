//! Claims carried by access tokens and scoped credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::BiscuitError;

/// Whether an access token belongs to a person or a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Service,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Service => "service",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = BiscuitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PrincipalKind::User),
            "service" => Ok(PrincipalKind::Service),
            other => Err(BiscuitError::InvalidClaim {
                claim: "kind".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Claims in a caller access token, presented as the connection password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Who the caller is.
    pub subject: String,

    /// User or service.
    pub kind: PrincipalKind,

    /// When the token stops verifying.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessClaims {
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: PrincipalKind::User,
            expires_at: None,
        }
    }

    pub fn service(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: PrincipalKind::Service,
            expires_at: None,
        }
    }

    /// Expire the token after `ttl`.
    pub fn expires_in(mut self, ttl: chrono::Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }
}

/// Read permissions a scoped credential can grant on a backend instance.
///
/// The set is closed and read-only: a scoped credential cannot carry any
/// permission to modify the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePermission {
    /// Read instance metadata.
    ReadInstance,
    /// Read catalog objects.
    ReadObjects,
    /// Query the instance's OLAP engine.
    ReadOlap,
    /// Query metrics views.
    ReadMetrics,
}

impl InstancePermission {
    /// The minimal set needed to serve read queries.
    pub const READ_ONLY: [InstancePermission; 4] = [
        InstancePermission::ReadInstance,
        InstancePermission::ReadObjects,
        InstancePermission::ReadOlap,
        InstancePermission::ReadMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstancePermission::ReadInstance => "read_instance",
            InstancePermission::ReadObjects => "read_objects",
            InstancePermission::ReadOlap => "read_olap",
            InstancePermission::ReadMetrics => "read_metrics",
        }
    }
}

impl fmt::Display for InstancePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstancePermission {
    type Err = BiscuitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstancePermission::READ_ONLY
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| BiscuitError::InvalidClaim {
                claim: "permission".to_string(),
                value: s.to_string(),
            })
    }
}

/// Claims in a scoped backend credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedClaims {
    /// Backend the credential is valid for.
    pub audience: String,

    /// Caller the credential was minted on behalf of.
    pub subject: String,

    /// Instance the credential is valid for.
    pub instance_id: String,

    /// Granted instance permissions.
    pub permissions: Vec<InstancePermission>,

    /// Free-form caller attributes forwarded to the backend.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// When the credential stops verifying.
    pub expires_at: DateTime<Utc>,
}
