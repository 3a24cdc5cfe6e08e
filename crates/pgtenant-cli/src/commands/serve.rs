//! Serve command for starting the pgtenant proxy.
//!
//! `pgtenant serve` - Start the Postgres proxy server (and the optional health
//! endpoint) and run until Ctrl-C or SIGTERM.

use anyhow::Context;
use pgtenant_biscuit::{KeyPair, PublicKey, TokenBuilder, TokenVerifier, load_public_key_hex};
use pgtenant_core::{BiscuitConfig, PgTenantConfig};
use pgtenant_proxy::{
    BiscuitClaimsService, BiscuitTokenIssuer, BrokeredConnectionFactory, ConfigRegistry, ConnectionPool,
    CredentialBroker, HealthState, InMemoryUsageTracker, PgDialer, PgTenantProxy, TenantResolver, UsageRecorder,
    health_router, serve_health,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Everything `serve` runs, wired from configuration.
pub struct Server {
    pub proxy: PgTenantProxy,
    pub usage: Option<Arc<InMemoryUsageTracker>>,
}

/// Start the proxy and block until shutdown.
pub async fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = PgTenantConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    tracing::info!(config = %config_path.display(), "Loaded configuration");

    let server = build(&config)?;

    let health = if config.observability.health.enabled {
        let health_config = &config.observability.health;
        let address = format!("{}:{}", health_config.listen_addr, health_config.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind health endpoint to {address}"))?;
        let router = health_router(
            &health_config.path,
            Arc::new(HealthState::new(server.proxy.pool().clone(), server.usage.clone())),
        );

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve_health(listener, router, async move {
            let _ = rx.await;
        }));
        Some((tx, handle))
    } else {
        None
    };

    tracing::info!(
        listen = %server.proxy.config().bind_address(),
        projects = config.registry.projects.len(),
        usage = config.usage.enabled,
        "Starting pgtenant proxy"
    );

    let result = server.proxy.run(shutdown_signal()).await;

    if let Some((tx, handle)) = health {
        let _ = tx.send(());
        match handle.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Health endpoint failed"),
            Err(e) => tracing::warn!(error = %e, "Health endpoint task failed"),
            Ok(Ok(())) => {}
        }
    }

    result?;
    tracing::info!("pgtenant proxy stopped");
    Ok(())
}

/// Wire the proxy and its collaborators from configuration.
pub fn build(config: &PgTenantConfig) -> anyhow::Result<Server> {
    let (keypair, verifying_key) = load_keys(&config.biscuit)?;
    let pool_settings = config.pool_settings()?;

    let claims = Arc::new(BiscuitClaimsService::from_config(
        TokenVerifier::new(verifying_key),
        &config.registry,
    ));
    let issuer = Arc::new(BiscuitTokenIssuer::new(TokenBuilder::new(keypair)));
    let resolver = Arc::new(TenantResolver::new(Arc::new(ConfigRegistry::from_config(
        &config.registry,
    ))));
    let broker = Arc::new(CredentialBroker::new(claims.clone(), issuer, config.credentials.ttl()));

    let pool = Arc::new(ConnectionPool::new(
        pool_settings,
        Arc::new(BrokeredConnectionFactory::new(resolver.clone(), broker)),
        Arc::new(PgDialer::new(config.upstream.clone())),
    ));

    let usage = config.usage.enabled.then(|| Arc::new(InMemoryUsageTracker::new()));
    let recorder = usage.clone().map(|tracker| UsageRecorder::new(tracker));

    let proxy = PgTenantProxy::new(config.proxy.clone(), resolver, claims, pool, recorder);
    Ok(Server { proxy, usage })
}

/// The signing keypair, and the key that verifies caller access tokens.
///
/// Access tokens are checked against the configured public key when one is
/// set, otherwise against the signing keypair's own public half.
pub(crate) fn load_keys(config: &BiscuitConfig) -> anyhow::Result<(KeyPair, PublicKey)> {
    let private_hex = config
        .resolve_private_key()
        .context("Failed to read Biscuit private key")?
        .context(
            "Biscuit private key not found. Configure biscuit.private_key_env or biscuit.private_key_file",
        )?;
    let keypair = KeyPair::from_private_key_hex(&private_hex).context("Failed to parse Biscuit private key")?;

    let verifying_key = match config
        .resolve_public_key()
        .context("Failed to read Biscuit public key")?
    {
        Some(hex) => load_public_key_hex(&hex).context("Failed to parse Biscuit public key")?,
        None => keypair.public_key(),
    };

    Ok((keypair, verifying_key))
}

/// Completes on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
