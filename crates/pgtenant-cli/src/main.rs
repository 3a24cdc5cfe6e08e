use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "pgtenant", version, about = "Tenant-aware Postgres proxy")]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "info", "pgtenant_proxy=debug").
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server.
    Serve {
        /// Configuration file (YAML, or TOML by extension).
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Validate a configuration file and list the tenants it serves.
    Check {
        /// Configuration file (YAML, or TOML by extension).
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Biscuit key management.
    Keys {
        #[command(subcommand)]
        cmd: KeysCommand,
    },

    /// Caller access tokens.
    Token {
        #[command(subcommand)]
        cmd: TokenCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Generate a new Ed25519 keypair.
    Generate {
        /// Directory to write private.key and public.key into.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Mint an access token to present as the connection password.
    Mint {
        /// Caller subject (user name or service name).
        #[arg(long)]
        subject: String,

        /// Caller kind: user or service.
        #[arg(long, default_value = "user")]
        kind: String,

        /// Lifetime such as 24h, 7d, 30m. Omit for a token that does not expire.
        #[arg(long)]
        expires: Option<String>,

        /// Private key file or hex string.
        #[arg(long, env = "PGTENANT_PRIVATE_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Write the token to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Print a token's blocks without verifying it.
    Inspect {
        /// Token string or file containing it.
        token: String,
    },

    /// Verify an access token against a public key.
    Verify {
        /// Token string or file containing it.
        token: String,

        /// Public key file or hex string.
        #[arg(long, env = "PGTENANT_PUBLIC_KEY")]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.cmd {
        Command::Serve { config } => commands::serve::serve(config).await?,
        Command::Check { config } => commands::check::run(&config).await?,
        Command::Keys { cmd } => match cmd {
            KeysCommand::Generate { output } => commands::keys::generate(output)?,
        },
        Command::Token { cmd } => match cmd {
            TokenCommand::Mint {
                subject,
                kind,
                expires,
                key,
                output,
            } => commands::token::mint(key, subject, kind, expires, output)?,
            TokenCommand::Inspect { token } => commands::token::inspect(token)?,
            TokenCommand::Verify { token, key } => commands::token::verify(key, token)?,
        },
    }

    Ok(())
}
