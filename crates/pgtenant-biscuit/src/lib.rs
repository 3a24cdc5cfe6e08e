//! # pgtenant-biscuit
//!
//! Biscuit token handling for the pgtenant proxy.
//!
//! Two kinds of token are signed with the same Ed25519 keypair format:
//!
//! | Token | Presented by | Contains | Lifetime |
//! |-------|--------------|----------|----------|
//! | **Access token** | Client, as the connection password | Subject, principal kind | Long-lived or expiring |
//! | **Scoped credential** | Proxy, to the backend | Audience, instance, read permissions, attributes | Short-lived |

pub mod claims;
pub mod error;
pub mod keys;
pub mod token;

pub use biscuit_auth::PublicKey;
pub use claims::{AccessClaims, InstancePermission, PrincipalKind, ScopedClaims};
pub use error::BiscuitError;
pub use keys::{KeyPair, load_public_key_file, load_public_key_hex};
pub use token::{TokenBuilder, TokenInfo, TokenVerifier, inspect_token_unverified};
