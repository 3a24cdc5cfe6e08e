//! Biscuit key configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the proxy finds its Ed25519 keypair.
///
/// The public key verifies caller access tokens presented as connection
/// passwords; the private key signs the scoped credentials handed to backends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BiscuitConfig {
    /// Environment variable containing the public key (hex-encoded).
    #[serde(default)]
    pub public_key_env: Option<String>,

    /// Path to the public key file.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,

    /// Environment variable containing the private key (hex-encoded).
    #[serde(default)]
    pub private_key_env: Option<String>,

    /// Path to the private key file.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
}

impl BiscuitConfig {
    /// Resolve the public key from environment or file.
    pub fn resolve_public_key(&self) -> Result<Option<String>, std::io::Error> {
        resolve_key(self.public_key_env.as_deref(), self.public_key_file.as_ref())
    }

    /// Resolve the private key from environment or file.
    pub fn resolve_private_key(&self) -> Result<Option<String>, std::io::Error> {
        resolve_key(self.private_key_env.as_deref(), self.private_key_file.as_ref())
    }
}

fn resolve_key(env_var: Option<&str>, path: Option<&PathBuf>) -> Result<Option<String>, std::io::Error> {
    // Try environment variable first
    if let Some(env_var) = env_var
        && let Ok(key) = std::env::var(env_var)
    {
        return Ok(Some(key.trim().to_string()));
    }

    if let Some(path) = path
        && path.exists()
    {
        let key = std::fs::read_to_string(path)?;
        return Ok(Some(key.trim().to_string()));
    }

    Ok(None)
}
