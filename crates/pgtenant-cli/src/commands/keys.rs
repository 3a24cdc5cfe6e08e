//! Key management commands.
//!
//! `pgtenant keys generate` - Generate a new Biscuit keypair.

use anyhow::Context;
use pgtenant_biscuit::KeyPair;
use std::fs;
use std::path::{Path, PathBuf};

/// Generate a new Biscuit keypair.
pub fn generate(output: Option<PathBuf>) -> anyhow::Result<()> {
    let keypair = KeyPair::generate()?;

    if let Some(output_dir) = output {
        let (private_path, public_path) = write_keypair(&keypair, &output_dir)?;

        println!("✔ Generated Biscuit keypair:");
        println!("  Private key: {}", private_path.display());
        println!("  Public key:  {}", public_path.display());
        println!();
        println!("⚠️  Keep your private key secure! Never commit it to version control.");
        println!();
        println!("Reference them from the config file:");
        println!("  biscuit:");
        println!("    private_key_file: {}", private_path.display());
        println!("    public_key_file: {}", public_path.display());
        println!();
        println!("or export them for `pgtenant token`:");
        println!("  export PGTENANT_PRIVATE_KEY=$(cat {})", private_path.display());
        println!("  export PGTENANT_PUBLIC_KEY=$(cat {})", public_path.display());
    } else {
        println!("Private key (keep secure!):");
        println!("{}", keypair.private_key_hex());
        println!();
        println!("Public key:");
        println!("{}", keypair.public_key_hex());
        println!();
        println!("Use --output <dir> to save keys to files.");
    }

    Ok(())
}

fn write_keypair(keypair: &KeyPair, output_dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let private_path = output_dir.join("private.key");
    let public_path = output_dir.join("public.key");

    keypair
        .save_to_files(&private_path, &public_path)
        .with_context(|| format!("Failed to write keys to {}", output_dir.display()))?;

    Ok((private_path, public_path))
}
