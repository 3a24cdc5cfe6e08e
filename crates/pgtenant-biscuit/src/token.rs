//! Token creation and verification.

use crate::claims::{AccessClaims, InstancePermission, ScopedClaims};
use crate::error::BiscuitError;
use crate::keys::KeyPair;
use biscuit_auth::builder::{AuthorizerBuilder, BiscuitBuilder};
use biscuit_auth::macros::{check, fact};
use biscuit_auth::{Authorizer, Biscuit, PublicKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Builder for signed Biscuit tokens.
pub struct TokenBuilder {
    keypair: KeyPair,
}

impl TokenBuilder {
    /// Create a new token builder with the given keypair.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Public key matching the signing key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Mint a caller access token.
    pub fn mint_access_token(&self, claims: &AccessClaims) -> Result<String, BiscuitError> {
        let mut builder = Biscuit::builder()
            .fact(fact!("subject({subject})", subject = claims.subject.clone()))
            .and_then(|b| b.fact(fact!("kind({kind})", kind = claims.kind.as_str().to_string())))
            .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?;

        if let Some(expires_at) = claims.expires_at {
            builder = with_expiry(builder, expires_at)?;
        }

        self.seal(builder)
    }

    /// Mint a scoped backend credential.
    ///
    /// The credential names exactly one audience and one instance and always
    /// expires.
    pub fn mint_scoped_credential(&self, claims: &ScopedClaims) -> Result<String, BiscuitError> {
        let mut builder = Biscuit::builder()
            .fact(fact!("audience({audience})", audience = claims.audience.clone()))
            .and_then(|b| b.fact(fact!("subject({subject})", subject = claims.subject.clone())))
            .and_then(|b| b.fact(fact!("instance({instance})", instance = claims.instance_id.clone())))
            .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?;

        for permission in &claims.permissions {
            builder = builder
                .fact(fact!("permission({permission})", permission = permission.as_str().to_string()))
                .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?;
        }

        for (key, value) in &claims.attributes {
            builder = builder
                .fact(fact!(
                    "attribute({key}, {value})",
                    key = key.clone(),
                    value = value.clone()
                ))
                .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?;
        }

        builder = with_expiry(builder, claims.expires_at)?;
        self.seal(builder)
    }

    fn seal(&self, builder: BiscuitBuilder) -> Result<String, BiscuitError> {
        let issued_at = Utc::now().timestamp();
        let biscuit = builder
            .fact(fact!("issued_at({issued_at})", issued_at = issued_at))
            .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?
            .build(self.keypair.inner())
            .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))?;

        biscuit
            .to_base64()
            .map_err(|e| BiscuitError::SerializationError(e.to_string()))
    }
}

/// Record the expiry as a fact and enforce it with a check.
fn with_expiry(builder: BiscuitBuilder, expires_at: DateTime<Utc>) -> Result<BiscuitBuilder, BiscuitError> {
    let expires_at = expires_at.timestamp();
    builder
        .fact(fact!("expires_at({expires_at})", expires_at = expires_at))
        .and_then(|b| {
            b.check(check!(
                "check if time($time), $time < {expires_at}",
                expires_at = expires_at
            ))
        })
        .map_err(|e| BiscuitError::TokenCreationFailed(e.to_string()))
}

/// Verifier for Biscuit tokens.
pub struct TokenVerifier {
    public_key: PublicKey,
}

impl TokenVerifier {
    /// Create a new token verifier with the given public key.
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    /// Verify a caller access token and extract its claims.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, BiscuitError> {
        let mut authorizer = self.authorize(token)?;

        let subject = query_string(&mut authorizer, "subject")?;
        let kind = query_string(&mut authorizer, "kind")?.parse()?;
        let expires_at = query_timestamp(&mut authorizer, "expires_at")?;

        Ok(AccessClaims {
            subject,
            kind,
            expires_at,
        })
    }

    /// Verify a scoped credential and extract its claims.
    pub fn verify_scoped(&self, token: &str) -> Result<ScopedClaims, BiscuitError> {
        let mut authorizer = self.authorize(token)?;

        let audience = query_string(&mut authorizer, "audience")?;
        let subject = query_string(&mut authorizer, "subject")?;
        let instance_id = query_string(&mut authorizer, "instance")?;

        let mut permissions = query_all::<(String,)>(&mut authorizer, "data($x) <- permission($x)")?
            .into_iter()
            .map(|(p,)| p.parse::<InstancePermission>())
            .collect::<Result<Vec<_>, _>>()?;
        permissions.sort();

        let attributes: BTreeMap<String, String> =
            query_all::<(String, String)>(&mut authorizer, "data($k, $v) <- attribute($k, $v)")?
                .into_iter()
                .collect();

        let expires_at = query_timestamp(&mut authorizer, "expires_at")?.ok_or_else(|| {
            BiscuitError::MissingClaim {
                claim: "expires_at".to_string(),
            }
        })?;

        Ok(ScopedClaims {
            audience,
            subject,
            instance_id,
            permissions,
            attributes,
            expires_at,
        })
    }

    fn authorize(&self, token: &str) -> Result<Authorizer, BiscuitError> {
        let biscuit = Biscuit::from_base64(token.trim(), self.public_key)
            .map_err(|e| BiscuitError::TokenParseFailed(e.to_string()))?;

        let now = Utc::now().timestamp();
        let mut authorizer = AuthorizerBuilder::new()
            .code(format!(
                r#"
                time({now});
                allow if true;
                "#
            ))
            .map_err(|e| BiscuitError::VerificationFailed(e.to_string()))?
            .build(&biscuit)
            .map_err(|e| BiscuitError::VerificationFailed(e.to_string()))?;

        authorizer
            .authorize()
            .map_err(|e| BiscuitError::VerificationFailed(e.to_string()))?;

        Ok(authorizer)
    }
}

fn query_all<T>(authorizer: &mut Authorizer, rule: &str) -> Result<Vec<T>, BiscuitError>
where
    T: TryFrom<biscuit_auth::builder::Fact, Error = biscuit_auth::error::Token>,
{
    let rule: biscuit_auth::builder::Rule = rule
        .parse()
        .map_err(|e: biscuit_auth::error::Token| BiscuitError::VerificationFailed(e.to_string()))?;

    authorizer
        .query(rule)
        .map_err(|e| BiscuitError::VerificationFailed(e.to_string()))
}

fn query_string(authorizer: &mut Authorizer, name: &str) -> Result<String, BiscuitError> {
    query_all::<(String,)>(authorizer, &format!("data($x) <- {name}($x)"))?
        .into_iter()
        .next()
        .map(|(s,)| s)
        .ok_or_else(|| BiscuitError::MissingClaim {
            claim: name.to_string(),
        })
}

fn query_timestamp(authorizer: &mut Authorizer, name: &str) -> Result<Option<DateTime<Utc>>, BiscuitError> {
    let Some((seconds,)) = query_all::<(i64,)>(authorizer, &format!("data($x) <- {name}($x)"))?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };

    DateTime::from_timestamp(seconds, 0)
        .map(Some)
        .ok_or_else(|| BiscuitError::InvalidClaim {
            claim: name.to_string(),
            value: seconds.to_string(),
        })
}

/// Inspect a token without verification (for debugging).
pub fn inspect_token_unverified(token: &str) -> Result<TokenInfo, BiscuitError> {
    let biscuit = biscuit_auth::UnverifiedBiscuit::from_base64(token.trim())
        .map_err(|e| BiscuitError::TokenParseFailed(e.to_string()))?;

    let blocks = (0..biscuit.block_count())
        .map(|i| {
            biscuit
                .print_block_source(i)
                .map_err(|e| BiscuitError::TokenParseFailed(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TokenInfo {
        block_count: biscuit.block_count(),
        blocks,
    })
}

/// Information about a token (for inspection).
pub struct TokenInfo {
    /// Number of blocks in the token.
    pub block_count: usize,
    /// Datalog source of each block.
    pub blocks: Vec<String>,
}
