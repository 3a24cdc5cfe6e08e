//! End-to-end tests for the pgtenant proxy.
//!
//! A real proxy listens on a loopback port and is driven with sqlx as the
//! client. The registry and claims service are the shipped config/Biscuit
//! implementations; the backend is an in-memory dialer, so no database is
//! required.
//!
//! Run with: cargo test --package pgtenant-proxy --test integration_tests

use async_trait::async_trait;
use pgtenant_biscuit::{AccessClaims, KeyPair, TokenBuilder, TokenVerifier};
use pgtenant_core::{DeploymentConfig, PoolSettings, ProjectConfig, ProxyConfig, RegistryConfig};
use pgtenant_proxy::{
    Authenticated, BackendTarget, BiscuitClaimsService, BrokeredConnectionFactory, ConfigRegistry, ConnectionPool,
    CredentialBroker, Dialer, InMemoryUsageTracker, PgTenantProxy, ScopedCredential, TenantResolver, TokenIssuer,
    UpstreamColumn, UpstreamConnection, UpstreamError, UpstreamRows, UsageRecorder,
};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, Connection, Executor, PgConnection, Row};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Everything the in-memory backend observed.
#[derive(Default)]
struct Backend {
    dials: AtomicUsize,
    queries: Mutex<Vec<String>>,
    credentials: Mutex<Vec<String>>,
}

impl Backend {
    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }
}

struct MemoryDialer(Arc<Backend>);

struct MemoryConnection(Arc<Backend>);

#[async_trait]
impl Dialer for MemoryDialer {
    fn dsn(&self, target: &BackendTarget) -> Result<String, UpstreamError> {
        Ok(format!("postgres://{}/{}", target.host, target.instance_id))
    }

    async fn dial(&self, auth: &Authenticated) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        assert_eq!(auth.target.instance_id, "inst-1");
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        self.0
            .credentials
            .lock()
            .unwrap()
            .push(auth.credential.expose().to_string());
        Ok(Box::new(MemoryConnection(self.0.clone())))
    }
}

#[async_trait]
impl UpstreamConnection for MemoryConnection {
    async fn query(&mut self, sql: &str) -> Result<Vec<UpstreamRows>, UpstreamError> {
        self.0.queries.lock().unwrap().push(sql.to_string());
        let mut sets = Vec::new();
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sets.push(match statement {
                "SELECT 1" => UpstreamRows {
                    columns: vec![UpstreamColumn {
                        name: "?column?".into(),
                        type_oid: 23,
                        table_oid: None,
                        column_ordinal: None,
                    }],
                    rows: vec![vec![Some("1".into())]],
                },
                "SELECT name FROM regions" => UpstreamRows {
                    columns: vec![UpstreamColumn {
                        name: "name".into(),
                        type_oid: 25,
                        table_oid: None,
                        column_ordinal: None,
                    }],
                    rows: vec![
                        vec![Some("north".into())],
                        vec![Some("south".into())],
                        vec![None],
                    ],
                },
                _ => {
                    return Err(UpstreamError::Query {
                        code: Some("42P01".into()),
                        message: "relation \"missing\" does not exist".into(),
                    });
                }
            });
        }
        Ok(sets)
    }

    async fn ping(&mut self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

/// Counts mints and hands out distinguishable credentials.
#[derive(Default)]
struct CountingIssuer {
    mints: AtomicUsize,
}

#[async_trait]
impl TokenIssuer for CountingIssuer {
    async fn issue_token(&self, request: &ScopedCredential) -> anyhow::Result<String> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("scoped-{}-{n}", request.subject))
    }
}

struct Harness {
    addr: SocketAddr,
    builder: TokenBuilder,
    backend: Arc<Backend>,
    issuer: Arc<CountingIssuer>,
    usage: Arc<InMemoryUsageTracker>,
    proxy: Arc<PgTenantProxy>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    async fn start() -> Self {
        let registry = RegistryConfig {
            projects: vec![
                ProjectConfig {
                    org: "acme".into(),
                    name: "sales".into(),
                    prod_deployment: Some("dep-1".into()),
                    readers: vec!["alice".into()],
                },
                ProjectConfig {
                    org: "acme".into(),
                    name: "unready".into(),
                    prod_deployment: None,
                    readers: vec!["*".into()],
                },
            ],
            deployments: vec![DeploymentConfig {
                id: "dep-1".into(),
                runtime_host: "http://localhost:8081".into(),
                runtime_instance_id: "inst-1".into(),
                runtime_audience: None,
            }],
        };

        let keypair = KeyPair::generate().unwrap();
        let claims = Arc::new(BiscuitClaimsService::from_config(
            TokenVerifier::new(keypair.public_key()),
            &registry,
        ));
        let builder = TokenBuilder::new(keypair);

        let backend = Arc::new(Backend::default());
        let issuer = Arc::new(CountingIssuer::default());
        let usage = Arc::new(InMemoryUsageTracker::new());

        let resolver = Arc::new(TenantResolver::new(Arc::new(ConfigRegistry::from_config(&registry))));
        let broker = Arc::new(CredentialBroker::new(
            claims.clone(),
            issuer.clone(),
            Duration::from_secs(1800),
        ));
        let pool = Arc::new(ConnectionPool::new(
            PoolSettings::default(),
            Arc::new(BrokeredConnectionFactory::new(resolver.clone(), broker)),
            Arc::new(MemoryDialer(backend.clone())),
        ));

        let proxy = Arc::new(PgTenantProxy::new(
            ProxyConfig::default(),
            resolver,
            claims,
            pool,
            Some(UsageRecorder::new(usage.clone())),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let server = tokio::spawn({
            let proxy = proxy.clone();
            async move {
                proxy
                    .serve(listener, async {
                        let _ = rx.await;
                    })
                    .await
                    .unwrap();
            }
        });

        Self {
            addr,
            builder,
            backend,
            issuer,
            usage,
            proxy,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    fn user_token(&self, subject: &str) -> String {
        self.builder.mint_access_token(&AccessClaims::user(subject)).unwrap()
    }

    async fn connect(&self, database: &str, password: &str) -> PgConnection {
        PgConnectOptions::new()
            .host(&self.addr.ip().to_string())
            .port(self.addr.port())
            .username("client")
            .password(password)
            .database(database)
            .ssl_mode(PgSslMode::Disable)
            .connect()
            .await
            .unwrap()
    }

    async fn wait_for_usage(&self, deployment_id: &str, expected: u64) -> u64 {
        for _ in 0..200 {
            if self.usage.queries(deployment_id) >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.usage.queries(deployment_id)
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_begin_then_select_one() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("alice")).await;

    let result = conn.execute(sqlx::raw_sql("BEGIN;")).await.unwrap();
    assert_eq!(result.rows_affected(), 0);
    assert!(harness.backend.queries().is_empty());
    assert_eq!(harness.backend.dials.load(Ordering::SeqCst), 0);

    let rows = conn.fetch_all(sqlx::raw_sql("SELECT 1;")).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<i32, _>(0).unwrap(), 1);
    assert_eq!(harness.backend.queries(), vec!["SELECT 1;"]);
    assert_eq!(harness.wait_for_usage("dep-1", 1).await, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_session_and_transaction_commands_are_local() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme/sales", &harness.user_token("alice")).await;

    for sql in ["SET search_path TO public", "begin", "COMMIT;", "rollback ;", "set DateStyle = 'ISO'"] {
        conn.execute(sqlx::raw_sql(sql)).await.unwrap();
    }

    assert!(harness.backend.queries().is_empty());
    assert_eq!(harness.issuer.mints.load(Ordering::SeqCst), 0);
    assert_eq!(harness.usage.queries("dep-1"), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_rows_stream_in_order_and_connection_is_reused() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("alice")).await;

    let rows = conn
        .fetch_all(sqlx::raw_sql("SELECT name FROM regions"))
        .await
        .unwrap();
    let names: Vec<Option<String>> = rows.iter().map(|row| row.try_get(0).unwrap()).collect();
    assert_eq!(names, vec![Some("north".into()), Some("south".into()), None]);

    conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();

    assert_eq!(harness.backend.dials.load(Ordering::SeqCst), 1);
    assert_eq!(harness.issuer.mints.load(Ordering::SeqCst), 1);
    assert_eq!(harness.backend.credentials(), vec!["scoped-alice-1"]);

    harness.stop().await;
}

#[tokio::test]
async fn test_multi_statement_query_returns_every_result_set() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("alice")).await;

    let rows = conn
        .fetch_all(sqlx::raw_sql("SELECT 1; SELECT name FROM regions"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].try_get::<i32, _>(0).unwrap(), 1);
    assert_eq!(rows[1].try_get::<String, _>(0).unwrap(), "north");

    harness.stop().await;
}

#[tokio::test]
async fn test_bearer_prefixed_access_token_gets_minted_credential() {
    let mut harness = Harness::start().await;
    let password = format!("Bearer {}", harness.user_token("alice"));
    let mut conn = harness.connect("acme.sales", &password).await;

    conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();
    assert_eq!(harness.backend.credentials(), vec!["scoped-alice-1"]);

    harness.stop().await;
}

#[tokio::test]
async fn test_upstream_error_is_reported_verbatim() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("alice")).await;

    let err = conn
        .fetch_all(sqlx::raw_sql("SELECT * FROM missing"))
        .await
        .unwrap_err();
    let db = err.as_database_error().expect("database error");
    assert_eq!(db.code().as_deref(), Some("42P01"));
    assert_eq!(db.message(), "relation \"missing\" does not exist");

    // The session survives and the backend was reached.
    let rows = conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(harness.wait_for_usage("dep-1", 2).await, 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_tenant_errors_fail_the_query_not_the_connection() {
    let mut harness = Harness::start().await;
    let token = harness.user_token("alice");

    for (database, code) in [
        ("invalidstring", "3D000"),
        ("acme.noexist", "3D000"),
        ("acme.unready", "57P03"),
    ] {
        let mut conn = harness.connect(database, &token).await;

        for _ in 0..2 {
            let err = conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap_err();
            let db = err.as_database_error().expect("database error");
            assert_eq!(db.code().as_deref(), Some(code), "{database}");
        }

        // Meta commands never need the tenant.
        conn.execute(sqlx::raw_sql("BEGIN")).await.unwrap();
        conn.close().await.unwrap();
    }

    assert_eq!(harness.backend.dials.load(Ordering::SeqCst), 0);
    assert_eq!(harness.issuer.mints.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_permission_denied_before_dial() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("mallory")).await;

    let err = conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap_err();
    let db = err.as_database_error().expect("database error");
    assert_eq!(db.code().as_deref(), Some("42501"));
    assert_eq!(harness.backend.dials.load(Ordering::SeqCst), 0);
    assert_eq!(harness.issuer.mints.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_anonymous_secret_is_passed_through() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", "Bearer backend-native-secret").await;

    conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();

    assert_eq!(harness.backend.credentials(), vec!["backend-native-secret"]);
    assert_eq!(harness.issuer.mints.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_callers_get_separate_pool_entries() {
    let mut harness = Harness::start().await;
    let mut alice = harness.connect("acme.sales", &harness.user_token("alice")).await;
    let mut anonymous = harness.connect("acme.sales", "native").await;

    alice.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();
    anonymous.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();
    alice.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();

    assert_eq!(harness.backend.dials.load(Ordering::SeqCst), 2);
    assert_eq!(harness.proxy.pool().stats().entries, 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_pool_and_clients() {
    let mut harness = Harness::start().await;
    let mut conn = harness.connect("acme.sales", &harness.user_token("alice")).await;
    conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.unwrap();
    assert_eq!(harness.proxy.pool().stats().idle, 1);

    harness.stop().await;

    assert!(harness.proxy.pool().is_closed());
    assert_eq!(harness.proxy.pool().stats().entries, 0);
    assert!(conn.fetch_all(sqlx::raw_sql("SELECT 1")).await.is_err());
}
