//! Token management commands.
//!
//! `pgtenant token mint` - Mint a caller access token.
//! `pgtenant token inspect` - Inspect a token's contents.
//! `pgtenant token verify` - Verify an access token.

use anyhow::Context;
use pgtenant_biscuit::{
    AccessClaims, KeyPair, PrincipalKind, PublicKey, TokenBuilder, TokenVerifier, inspect_token_unverified,
    load_public_key_file, load_public_key_hex,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Resolve a private key from either a file path or a hex-encoded string.
fn resolve_private_key(key: Option<String>) -> anyhow::Result<KeyPair> {
    let key_str = key.context(
        "Private key not provided. Either pass --key <path> or set PGTENANT_PRIVATE_KEY env var",
    )?;

    let path = Path::new(&key_str);
    if path.exists() {
        return KeyPair::load_from_file(path)
            .with_context(|| format!("Failed to load private key from file: {}", path.display()));
    }

    KeyPair::from_private_key_hex(key_str.trim())
        .context("Failed to parse private key. Expected hex-encoded Ed25519 private key")
}

/// Resolve a public key from either a file path or a hex-encoded string.
fn resolve_public_key(key: Option<String>) -> anyhow::Result<PublicKey> {
    let key_str = key.context(
        "Public key not provided. Either pass --key <path> or set PGTENANT_PUBLIC_KEY env var",
    )?;

    let path = Path::new(&key_str);
    if path.exists() {
        return load_public_key_file(path)
            .with_context(|| format!("Failed to load public key from file: {}", path.display()));
    }

    load_public_key_hex(key_str.trim())
        .context("Failed to parse public key. Expected hex-encoded Ed25519 public key")
}

/// Parse a duration string like "24h", "7d", "30m" into chrono::Duration.
fn parse_duration(s: &str) -> anyhow::Result<chrono::Duration> {
    let s = s.trim().to_lowercase();
    let invalid = || format!("Invalid duration {s:?}. Expected a number with suffix d, h, m or s");

    let (number, unit) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s.as_str(), 'h'),
    };
    let n: i64 = number.parse().with_context(invalid)?;

    match unit {
        'd' => Ok(chrono::Duration::days(n)),
        'h' => Ok(chrono::Duration::hours(n)),
        'm' => Ok(chrono::Duration::minutes(n)),
        's' => Ok(chrono::Duration::seconds(n)),
        _ => anyhow::bail!(invalid()),
    }
}

/// Read the token from a file when given a path, otherwise use it as is.
fn read_token(token: String) -> anyhow::Result<String> {
    if Path::new(&token).exists() {
        let contents = fs::read_to_string(&token).with_context(|| format!("Failed to read token file {token}"))?;
        Ok(contents.trim().to_string())
    } else {
        Ok(token.trim().to_string())
    }
}

/// Mint an access token for a user or service caller.
pub fn mint(
    private_key: Option<String>,
    subject: String,
    kind: String,
    expires: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let keypair = resolve_private_key(private_key)?;
    let builder = TokenBuilder::new(keypair);

    let kind: PrincipalKind = kind.parse()?;
    let mut claims = match kind {
        PrincipalKind::User => AccessClaims::user(&subject),
        PrincipalKind::Service => AccessClaims::service(&subject),
    };
    if let Some(expires) = &expires {
        claims = claims.expires_in(parse_duration(expires)?);
    }

    let token = builder.mint_access_token(&claims)?;

    if let Some(output_path) = output {
        fs::write(&output_path, &token)?;
        println!("✔ Token written to: {}", output_path.display());
        println!("  Subject: {}", subject);
        println!("  Kind: {}", kind);
        match claims.expires_at {
            Some(at) => println!("  Expires: {}", at.to_rfc3339()),
            None => println!("  Expires: never"),
        }
    } else {
        println!("{}", token);
    }

    Ok(())
}

/// Inspect a token without verification.
pub fn inspect(token: String) -> anyhow::Result<()> {
    let token_str = read_token(token)?;
    let info = inspect_token_unverified(&token_str)?;

    println!("Token Information:");
    println!("  Block count: {}", info.block_count);
    for (i, block) in info.blocks.iter().enumerate() {
        println!();
        println!("Block {}:", i);
        for line in block.lines() {
            println!("  {}", line);
        }
    }

    Ok(())
}

/// Verify an access token.
pub fn verify(public_key: Option<String>, token: String) -> anyhow::Result<()> {
    let public_key = resolve_public_key(public_key)?;
    let verifier = TokenVerifier::new(public_key);
    let token_str = read_token(token)?;

    let claims = verifier
        .verify_access(&token_str)
        .context("✖ Token verification failed")?;

    println!("✔ Token is valid");
    println!();
    println!("Token Details:");
    println!("  Subject: {}", claims.subject);
    println!("  Kind: {}", claims.kind);
    match claims.expires_at {
        Some(at) => println!("  Expires: {}", at.to_rfc3339()),
        None => println!("  Expires: never"),
    }

    Ok(())
}
