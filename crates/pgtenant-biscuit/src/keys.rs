//! Ed25519 keypairs for signing and verifying tokens.

use crate::error::BiscuitError;
use biscuit_auth::{Algorithm, KeyPair as BiscuitKeyPair, PrivateKey, PublicKey};
use rand::RngCore;
use std::path::Path;

/// An Ed25519 keypair.
///
/// The proxy signs scoped credentials with the private half and verifies
/// caller access tokens with the public half.
pub struct KeyPair {
    inner: BiscuitKeyPair,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, BiscuitError> {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);

        let private_key = PrivateKey::from_bytes(&bytes, Algorithm::Ed25519)
            .map_err(|e| BiscuitError::KeyGenerationFailed(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Create a keypair from an existing private key.
    pub fn from_private_key(private_key: PrivateKey) -> Self {
        Self {
            inner: BiscuitKeyPair::from(&private_key),
        }
    }

    /// Load a keypair from a hex-encoded private key string.
    pub fn from_private_key_hex(hex: &str) -> Result<Self, BiscuitError> {
        let private_key = PrivateKey::from_bytes_hex(hex.trim(), Algorithm::Ed25519)
            .map_err(|e| BiscuitError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Load a keypair from a file holding a hex-encoded private key.
    pub fn load_from_file(path: &Path) -> Result<Self, BiscuitError> {
        let hex = std::fs::read_to_string(path)?;
        Self::from_private_key_hex(&hex)
    }

    pub(crate) fn inner(&self) -> &BiscuitKeyPair {
        &self.inner
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        self.inner.public()
    }

    /// Get the private key as hex string.
    pub fn private_key_hex(&self) -> String {
        self.inner.private().to_bytes_hex()
    }

    /// Get the public key as hex string.
    pub fn public_key_hex(&self) -> String {
        self.inner.public().to_bytes_hex()
    }

    /// Write both halves as hex files.
    pub fn save_to_files(
        &self,
        private_key_path: &Path,
        public_key_path: &Path,
    ) -> Result<(), BiscuitError> {
        std::fs::write(private_key_path, self.private_key_hex())?;
        std::fs::write(public_key_path, self.public_key_hex())?;
        Ok(())
    }
}

/// Load a public key from hex string (for verification-only scenarios).
pub fn load_public_key_hex(hex: &str) -> Result<PublicKey, BiscuitError> {
    PublicKey::from_bytes_hex(hex.trim(), Algorithm::Ed25519)
        .map_err(|e| BiscuitError::InvalidPublicKey(e.to_string()))
}

/// Load a public key from a file.
pub fn load_public_key_file(path: &Path) -> Result<PublicKey, BiscuitError> {
    let hex = std::fs::read_to_string(path)?;
    load_public_key_hex(&hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_keypair_hex_roundtrip() {
        let keypair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_private_key_hex(&keypair.private_key_hex()).unwrap();
        assert_eq!(keypair.public_key_hex(), restored.public_key_hex());
        assert_eq!(keypair.public_key_hex().len(), 64);
    }

    #[test]
    fn test_keypair_file_save_load() {
        let dir = tempdir().unwrap();
        let private_path = dir.path().join("private.key");
        let public_path = dir.path().join("public.key");

        let keypair = KeyPair::generate().unwrap();
        keypair.save_to_files(&private_path, &public_path).unwrap();

        let loaded = KeyPair::load_from_file(&private_path).unwrap();
        assert_eq!(keypair.public_key_hex(), loaded.public_key_hex());

        let public = load_public_key_file(&public_path).unwrap();
        assert_eq!(public.to_bytes_hex(), keypair.public_key_hex());
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(matches!(
            KeyPair::from_private_key_hex("not-hex"),
            Err(BiscuitError::InvalidPrivateKey(_))
        ));
        assert!(load_public_key_hex("zz").is_err());
    }
}
