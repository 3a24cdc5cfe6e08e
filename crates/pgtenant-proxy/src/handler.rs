//! Postgres wire protocol handlers.
//!
//! The startup handler takes the client's password and `database` parameter;
//! the query handler classifies each simple-protocol query, answers session
//! and transaction commands locally, and forwards everything else to the
//! tenant's backend through the connection pool.

use crate::command::CommandKind;
use crate::connect::ConnectContext;
use crate::credential::{CallerIdentity, ClaimsService};
use crate::error::ProxyError;
use crate::pool::ConnectionPool;
use crate::tenant::{BackendTarget, TenantResolver};
use crate::upstream::{UpstreamError, UpstreamRows};
use crate::usage::UsageRecorder;
use async_trait::async_trait;
use futures::Sink;
use futures::sink::SinkExt;
use futures::stream;
use pgwire::api::auth::{
    DefaultServerParameterProvider, StartupHandler, finish_authentication, protocol_negotiation,
    save_startup_parameters_to_metadata,
};
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, QueryResponse, Response, Tag};
use pgwire::api::{ClientInfo, ClientPortalStore, PgWireConnectionState, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Per-connection state shared by the startup and query handlers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Connection ID.
    pub connection_id: String,
    /// Client address.
    pub client_addr: Option<String>,
    /// Caller identified at startup.
    pub caller: CallerIdentity,
    /// Raw `database` startup parameter.
    pub database: Option<String>,
    /// Target resolved on the first forwarded query.
    pub connect: Option<ConnectContext>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            client_addr: None,
            caller: CallerIdentity::default(),
            database: None,
            connect: None,
        }
    }
}

/// Requests a cleartext password and identifies the caller from it.
///
/// Startup never rejects a client: an unverifiable password makes the
/// caller anonymous, and the backend decides what anonymous callers may do.
pub struct TenantStartupHandler {
    claims: Arc<dyn ClaimsService>,
    session: Arc<RwLock<SessionContext>>,
    parameter_provider: DefaultServerParameterProvider,
}

impl TenantStartupHandler {
    pub fn new(claims: Arc<dyn ClaimsService>, session: Arc<RwLock<SessionContext>>) -> Self {
        Self {
            claims,
            session,
            parameter_provider: DefaultServerParameterProvider::default(),
        }
    }
}

#[async_trait]
impl StartupHandler for TenantStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let password = pwd.into_password()?.password;
                let caller = self.claims.identify(Some(&password)).await;

                // psql and most drivers default the database to the user name.
                let metadata = client.metadata();
                let database = metadata
                    .get("database")
                    .or_else(|| metadata.get("user"))
                    .cloned();

                let mut session = self.session.write().await;
                session.client_addr = Some(client.socket_addr().to_string());
                session.caller = caller;
                session.database = database;

                tracing::info!(
                    connection_id = %session.connection_id,
                    peer = ?session.client_addr,
                    caller = %session.caller,
                    database = ?session.database,
                    "Client authenticated"
                );
                drop(session);

                finish_authentication(client, &self.parameter_provider).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Dispatches simple-protocol queries.
pub struct TenantQueryHandler {
    resolver: Arc<TenantResolver>,
    pool: Arc<ConnectionPool>,
    usage: Option<UsageRecorder>,
    session: Arc<RwLock<SessionContext>>,
}

impl TenantQueryHandler {
    pub fn new(
        resolver: Arc<TenantResolver>,
        pool: Arc<ConnectionPool>,
        usage: Option<UsageRecorder>,
        session: Arc<RwLock<SessionContext>>,
    ) -> Self {
        Self {
            resolver,
            pool,
            usage,
            session,
        }
    }

    /// Handle one query string. Forwarded text gets one response per
    /// result set the backend returned.
    pub async fn handle(&self, query: &str) -> Vec<Response> {
        match CommandKind::classify(query) {
            CommandKind::Empty => vec![Response::EmptyQuery],
            CommandKind::SessionNoop(tag) | CommandKind::Transactional(tag) => {
                tracing::debug!(tag, "Answered locally");
                vec![Response::Execution(Tag::new(tag))]
            }
            CommandKind::Query => match self.forward(query).await {
                Ok(sets) if sets.is_empty() => vec![Response::EmptyQuery],
                Ok(sets) => sets.into_iter().map(query_response).collect(),
                Err(e) => vec![error_response(&e)],
            },
        }
    }

    /// The session's connect context, resolving the tenant on first use.
    async fn connect_context(&self) -> Result<ConnectContext, ProxyError> {
        if let Some(ctx) = &self.session.read().await.connect {
            return Ok(ctx.clone());
        }

        let mut session = self.session.write().await;
        if let Some(ctx) = &session.connect {
            return Ok(ctx.clone());
        }

        let raw = session.database.clone().unwrap_or_default();
        let (tenant, target) = self.resolver.resolve_raw(&raw).await?;
        let ctx = ConnectContext {
            tenant,
            caller: session.caller.clone(),
            target,
        };
        session.connect = Some(ctx.clone());
        Ok(ctx)
    }

    /// Point the session at the target its last connection was dialed to.
    async fn adopt_target(&self, ctx: &ConnectContext, dialed: &BackendTarget) {
        let mut session = self.session.write().await;
        if let Some(connect) = session.connect.as_mut()
            && connect.target != *dialed
        {
            tracing::info!(
                tenant = %ctx.tenant,
                from = %connect.target.deployment_id,
                to = %dialed.deployment_id,
                "Tenant served from a new deployment"
            );
            connect.target = dialed.clone();
        }
    }

    // pgwire drives this future from the connection task and offers no
    // disconnect notification, so a client that hangs up mid-query leaves the
    // upstream query running until it completes. Aborting the connection task
    // (shutdown) drops the lease and discards the connection.
    async fn forward(&self, query: &str) -> Result<Vec<UpstreamRows>, ProxyError> {
        let start = Instant::now();
        let ctx = self.connect_context().await?;

        let mut lease = self.pool.acquire(&ctx).await.inspect_err(|e| {
            tracing::warn!(tenant = %ctx.tenant, error = %e, "Failed to acquire upstream connection");
        })?;
        let result = lease.query(query).await;
        let dialed = lease.target().cloned().unwrap_or_else(|| ctx.target.clone());
        drop(lease);

        if dialed != ctx.target {
            self.adopt_target(&ctx, &dialed).await;
        }

        let reached_backend = !matches!(&result, Err(UpstreamError::Connection(_)));
        if reached_backend && let Some(usage) = &self.usage {
            usage.record(&dialed);
        }

        match result {
            Ok(sets) => {
                tracing::debug!(
                    tenant = %ctx.tenant,
                    deployment = %dialed.deployment_id,
                    sets = sets.len(),
                    rows = sets.iter().map(|set| set.rows.len()).sum::<usize>(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Query forwarded"
                );
                Ok(sets)
            }
            Err(e) => {
                tracing::warn!(tenant = %ctx.tenant, error = %e, "Upstream query failed");
                Err(match e {
                    UpstreamError::Query { code, message } => ProxyError::UpstreamQueryFailed { code, message },
                    UpstreamError::Connection(message) => ProxyError::UpstreamQueryFailed {
                        code: Some("08006".to_string()),
                        message,
                    },
                })
            }
        }
    }
}

fn pg_type(type_oid: u32) -> Type {
    Type::from_oid(type_oid).unwrap_or(Type::TEXT)
}

/// Column descriptions and rows in upstream order, or the empty marker when
/// no rows came back.
fn query_response(result: UpstreamRows) -> Response {
    if result.rows.is_empty() {
        return Response::EmptyQuery;
    }

    let fields: Vec<FieldInfo> = result
        .columns
        .iter()
        .map(|c| {
            FieldInfo::new(
                c.name.clone(),
                c.table_oid,
                c.column_ordinal,
                pg_type(c.type_oid),
                FieldFormat::Text,
            )
        })
        .collect();
    let schema = Arc::new(fields);

    let rows: Vec<PgWireResult<DataRow>> = result
        .rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for value in row {
                encoder.encode_field(&value)?;
            }
            Ok(encoder.take_row())
        })
        .collect();

    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn error_response(e: &ProxyError) -> Response {
    Response::Error(Box::new(ErrorInfo::new(
        "ERROR".to_owned(),
        e.sqlstate().to_owned(),
        e.to_string(),
    )))
}

#[async_trait]
impl SimpleQueryHandler for TenantQueryHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        Ok(self.handle(query).await)
    }
}

/// Handlers for one client connection.
pub struct TenantServerHandlers {
    query_handler: Arc<TenantQueryHandler>,
    startup_handler: Arc<TenantStartupHandler>,
}

impl TenantServerHandlers {
    pub fn new(query_handler: Arc<TenantQueryHandler>, startup_handler: Arc<TenantStartupHandler>) -> Self {
        Self {
            query_handler,
            startup_handler,
        }
    }
}

impl PgWireServerHandlers for TenantServerHandlers {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.query_handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.startup_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{Authenticated, ConnectionFactory};
    use crate::credential::Credential;
    use crate::registry::ConfigRegistry;
    use crate::upstream::{Dialer, UpstreamColumn, UpstreamConnection};
    use crate::tenant::BackendTarget;
    use crate::usage::InMemoryUsageTracker;
    use pgtenant_core::{DeploymentConfig, PoolSettings, ProjectConfig, RegistryConfig};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Upstream {
        connects: AtomicUsize,
        queries: AtomicUsize,
        /// Deployment the connect hook resolves to instead of the session's.
        moved_to: Mutex<Option<String>>,
    }

    struct Factory(Arc<Upstream>);

    #[async_trait]
    impl ConnectionFactory for Factory {
        async fn authenticate(&self, ctx: &ConnectContext) -> Result<Authenticated, ProxyError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            let mut target = ctx.target.clone();
            if let Some(deployment) = self.0.moved_to.lock().unwrap().clone() {
                target.host = format!("{deployment}.internal");
                target.deployment_id = deployment;
            }
            Ok(Authenticated {
                target,
                credential: Credential::new("minted"),
            })
        }
    }

    struct Dial(Arc<Upstream>);

    struct Conn(Arc<Upstream>);

    #[async_trait]
    impl UpstreamConnection for Conn {
        async fn query(&mut self, sql: &str) -> Result<Vec<UpstreamRows>, UpstreamError> {
            self.0.queries.fetch_add(1, Ordering::SeqCst);
            match sql.trim_end_matches(';') {
                "SELECT 1" => Ok(vec![int_rows("?column?", &["1"])]),
                "SELECT 1; SELECT 2, 3" => Ok(vec![
                    int_rows("a", &["1"]),
                    UpstreamRows {
                        columns: vec![int_column("b"), int_column("c")],
                        rows: vec![vec![Some("2".into()), Some("3".into())]],
                    },
                ]),
                "SELECT nothing" => Ok(vec![UpstreamRows::default()]),
                _ => Err(UpstreamError::Query {
                    code: Some("42P01".into()),
                    message: "relation \"missing\" does not exist".into(),
                }),
            }
        }

        async fn ping(&mut self) -> Result<(), UpstreamError> {
            Ok(())
        }

        async fn close(self: Box<Self>) {}
    }

    #[async_trait]
    impl Dialer for Dial {
        fn dsn(&self, target: &BackendTarget) -> Result<String, UpstreamError> {
            Ok(format!("postgres://{}/{}", target.host, target.instance_id))
        }

        async fn dial(&self, _auth: &Authenticated) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
            Ok(Box::new(Conn(self.0.clone())))
        }
    }

    fn int_column(name: &str) -> UpstreamColumn {
        UpstreamColumn {
            name: name.into(),
            type_oid: 23,
            table_oid: None,
            column_ordinal: None,
        }
    }

    fn int_rows(name: &str, values: &[&str]) -> UpstreamRows {
        UpstreamRows {
            columns: vec![int_column(name)],
            rows: values.iter().map(|v| vec![Some(v.to_string())]).collect(),
        }
    }

    fn handler(database: &str) -> (TenantQueryHandler, Arc<Upstream>, Arc<InMemoryUsageTracker>) {
        handler_with(database, PoolSettings::default())
    }

    fn handler_with(
        database: &str,
        settings: PoolSettings,
    ) -> (TenantQueryHandler, Arc<Upstream>, Arc<InMemoryUsageTracker>) {
        let registry = ConfigRegistry::from_config(&RegistryConfig {
            projects: vec![ProjectConfig {
                org: "acme".into(),
                name: "sales".into(),
                prod_deployment: Some("dep-1".into()),
                readers: vec!["*".into()],
            }],
            deployments: vec![DeploymentConfig {
                id: "dep-1".into(),
                runtime_host: "http://localhost:8081".into(),
                runtime_instance_id: "inst-1".into(),
                runtime_audience: None,
            }],
        });

        let upstream = Arc::new(Upstream::default());
        let pool = Arc::new(ConnectionPool::new(
            settings,
            Arc::new(Factory(upstream.clone())),
            Arc::new(Dial(upstream.clone())),
        ));
        let usage = Arc::new(InMemoryUsageTracker::new());
        let session = Arc::new(RwLock::new(SessionContext {
            database: Some(database.to_string()),
            caller: CallerIdentity::User {
                subject: "alice".into(),
            },
            ..SessionContext::default()
        }));

        let handler = TenantQueryHandler::new(
            Arc::new(TenantResolver::new(Arc::new(registry))),
            pool,
            Some(UsageRecorder::new(usage.clone())),
            session,
        );
        (handler, upstream, usage)
    }

    async fn settle(usage: &InMemoryUsageTracker, deployment: &str, expected: u64) {
        for _ in 0..100 {
            if usage.queries(deployment) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_meta_commands_never_reach_upstream() {
        let (handler, upstream, _) = handler("acme.sales");

        for sql in ["BEGIN;", "commit", "ROLLBACK ;", "SET search_path TO public", "   "] {
            let responses = handler.handle(sql).await;
            assert!(
                matches!(responses.as_slice(), [Response::Execution(_) | Response::EmptyQuery]),
                "{sql:?}"
            );
        }

        assert_eq!(upstream.connects.load(Ordering::SeqCst), 0);
        assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_select_forwards_and_records_usage() {
        let (handler, upstream, usage) = handler("acme.sales");

        assert!(matches!(handler.handle("SELECT 1;").await.as_slice(), [Response::Query(_)]));
        assert!(matches!(handler.handle("SELECT 1;").await.as_slice(), [Response::Query(_)]));

        assert_eq!(upstream.queries.load(Ordering::SeqCst), 2);
        assert_eq!(upstream.connects.load(Ordering::SeqCst), 1);
        settle(&usage, "dep-1", 2).await;
        assert_eq!(usage.queries("dep-1"), 2);
    }

    #[tokio::test]
    async fn test_each_statement_gets_its_own_response() {
        let (handler, upstream, _) = handler("acme.sales");

        let sets = handler.forward("SELECT 1; SELECT 2, 3").await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].columns.len(), 2);

        let responses = handler.handle("SELECT 1; SELECT 2, 3").await;
        assert!(matches!(responses.as_slice(), [Response::Query(_), Response::Query(_)]));
        assert_eq!(upstream.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_usage_follows_the_dialed_deployment() {
        // Every lease dials, so the second query runs after the move.
        let (handler, upstream, usage) = handler_with(
            "acme.sales",
            PoolSettings {
                max_conn_lifetime: Duration::ZERO,
                ..PoolSettings::default()
            },
        );

        handler.forward("SELECT 1").await.unwrap();
        *upstream.moved_to.lock().unwrap() = Some("dep-2".into());
        handler.forward("SELECT 1").await.unwrap();

        settle(&usage, "dep-1", 1).await;
        settle(&usage, "dep-2", 1).await;
        assert_eq!(usage.queries("dep-1"), 1);
        assert_eq!(usage.queries("dep-2"), 1);

        let session = handler.session.read().await;
        let target = &session.connect.as_ref().unwrap().target;
        assert_eq!(target.deployment_id, "dep-2");
        assert_eq!(target.host, "dep-2.internal");
    }

    #[tokio::test]
    async fn test_zero_rows_is_empty_marker() {
        let (handler, _, _) = handler("acme.sales");
        assert!(matches!(handler.handle("SELECT nothing").await.as_slice(), [Response::EmptyQuery]));
    }

    #[tokio::test]
    async fn test_upstream_error_is_verbatim() {
        let (handler, _, _) = handler("acme.sales");

        assert!(matches!(handler.handle("SELECT * FROM missing").await.as_slice(), [Response::Error(_)]));

        let err = handler.forward("SELECT * FROM missing").await.unwrap_err();
        assert_eq!(err.sqlstate(), "42P01");
        assert_eq!(err.to_string(), "relation \"missing\" does not exist");
    }

    #[tokio::test]
    async fn test_resolution_error_does_not_dial_and_is_retried() {
        let (handler, upstream, _) = handler("invalidstring");

        for _ in 0..2 {
            let err = handler.forward("SELECT 1").await.unwrap_err();
            assert!(matches!(err, ProxyError::InvalidTenant(_)));
            assert_eq!(err.sqlstate(), "3D000");
        }
        assert!(matches!(handler.handle("SELECT 1").await.as_slice(), [Response::Error(_)]));
        assert_eq!(upstream.connects.load(Ordering::SeqCst), 0);
        assert!(handler.session.read().await.connect.is_none());
    }
}
