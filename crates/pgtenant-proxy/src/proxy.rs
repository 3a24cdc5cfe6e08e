//! Main proxy server implementation.
//!
//! Accepts Postgres wire protocol clients, one task per connection, and owns
//! the connection pool for its whole lifetime: the pool is closed only after
//! the accept loop has stopped and every connection task has been aborted.

use crate::credential::ClaimsService;
use crate::error::ProxyError;
use crate::handler::{SessionContext, TenantQueryHandler, TenantServerHandlers, TenantStartupHandler};
use crate::pool::ConnectionPool;
use crate::tenant::TenantResolver;
use crate::usage::UsageRecorder;
use pgtenant_core::ProxyConfig;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;

/// The pgtenant proxy server.
pub struct PgTenantProxy {
    config: ProxyConfig,
    resolver: Arc<TenantResolver>,
    claims: Arc<dyn ClaimsService>,
    pool: Arc<ConnectionPool>,
    usage: Option<UsageRecorder>,
}

impl PgTenantProxy {
    pub fn new(
        config: ProxyConfig,
        resolver: Arc<TenantResolver>,
        claims: Arc<dyn ClaimsService>,
        pool: Arc<ConnectionPool>,
        usage: Option<UsageRecorder>,
    ) -> Self {
        Self {
            config,
            resolver,
            claims,
            pool,
            usage,
        }
    }

    /// Get a reference to the proxy configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Create handlers for a new connection.
    ///
    /// The startup and query handlers share one session context.
    fn create_connection_handlers(&self) -> Arc<TenantServerHandlers> {
        let session = Arc::new(RwLock::new(SessionContext::default()));

        let startup_handler = Arc::new(TenantStartupHandler::new(self.claims.clone(), session.clone()));
        let query_handler = Arc::new(TenantQueryHandler::new(
            self.resolver.clone(),
            self.pool.clone(),
            self.usage.clone(),
            session,
        ));

        Arc::new(TenantServerHandlers::new(query_handler, startup_handler))
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let address = self.config.bind_address();
        TcpListener::bind(&address)
            .await
            .map_err(|source| ProxyError::BindFailed { address, source })
    }

    /// Bind and serve until `shutdown` completes.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve clients from `listener` until `shutdown` completes, then abort
    /// open connections and close the pool.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Internal(e.into()))?;
        tracing::info!(
            address = %local_addr,
            max_clients = self.config.max_client_connections,
            "Proxy server listening"
        );

        let limit = Arc::new(Semaphore::new(self.config.max_client_connections as usize));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let Ok(permit) = limit.clone().try_acquire_owned() else {
                        tracing::warn!(peer = %peer_addr, "Client connection limit reached, refusing connection");
                        drop(socket);
                        continue;
                    };

                    tracing::debug!(peer = %peer_addr, "New connection");
                    let handlers = self.create_connection_handlers();

                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = pgwire::tokio::process_socket(socket, None, handlers).await {
                            tracing::error!(peer = %peer_addr, error = ?e, "Connection error");
                        }
                        tracing::debug!(peer = %peer_addr, "Connection closed");
                    });
                }
            }
        }

        tracing::info!(connections = tasks.len(), "Shutting down proxy server");
        tasks.shutdown().await;
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{Authenticated, ConnectionFactory};
    use crate::connect::ConnectContext;
    use crate::credential::CallerIdentity;
    use crate::registry::ConfigRegistry;
    use crate::tenant::{BackendTarget, TenantKey};
    use crate::upstream::{Dialer, UpstreamConnection, UpstreamError};
    use async_trait::async_trait;
    use pgtenant_core::{PoolSettings, RegistryConfig};

    struct NoClaims;

    #[async_trait]
    impl ClaimsService for NoClaims {
        async fn identify(&self, secret: Option<&str>) -> CallerIdentity {
            CallerIdentity::anonymous(secret.map(str::to_string))
        }

        async fn has_read_access(&self, _caller: &CallerIdentity, _tenant: &TenantKey) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ConnectionFactory for Unreachable {
        async fn authenticate(&self, _ctx: &ConnectContext) -> Result<Authenticated, ProxyError> {
            Err(ProxyError::UpstreamDialFailed("unreachable".into()))
        }
    }

    #[async_trait]
    impl Dialer for Unreachable {
        fn dsn(&self, target: &BackendTarget) -> Result<String, UpstreamError> {
            Ok(target.host.clone())
        }

        async fn dial(&self, _auth: &Authenticated) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
            Err(UpstreamError::Connection("unreachable".into()))
        }
    }

    fn proxy(config: ProxyConfig) -> PgTenantProxy {
        let registry = ConfigRegistry::from_config(&RegistryConfig::default());
        let pool = ConnectionPool::new(PoolSettings::default(), Arc::new(Unreachable), Arc::new(Unreachable));
        PgTenantProxy::new(
            config,
            Arc::new(TenantResolver::new(Arc::new(registry))),
            Arc::new(NoClaims),
            Arc::new(pool),
            None,
        )
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let proxy = proxy(ProxyConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        proxy.serve(listener, async {}).await.unwrap();
        assert!(proxy.pool().is_closed());
    }

    #[tokio::test]
    async fn test_bind_failure_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let proxy = proxy(ProxyConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: port,
            ..ProxyConfig::default()
        });

        let err = proxy.bind().await.unwrap_err();
        assert!(matches!(err, ProxyError::BindFailed { ref address, .. } if address.ends_with(&port.to_string())));
    }
}
