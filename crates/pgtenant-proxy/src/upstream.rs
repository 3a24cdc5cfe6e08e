//! Physical connections to tenant backends.
//!
//! [`Dialer`] opens authenticated connections and [`UpstreamConnection`] runs
//! query text on one. [`PgDialer`] is the sqlx implementation: it speaks the
//! simple query protocol only and keeps no server-side prepared statements.

use crate::connect::Authenticated;
use crate::tenant::BackendTarget;
use async_trait::async_trait;
use futures::TryStreamExt;
use pgtenant_core::{SslMode, UpstreamConfig};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, Connection, Either, Row};
use thiserror::Error;

/// Errors from a backend connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The connection could not be established or was lost.
    #[error("{0}")]
    Connection(String),

    /// The backend executed the query and returned an error.
    #[error("{message}")]
    Query {
        code: Option<String>,
        message: String,
    },
}

impl UpstreamError {
    /// Whether the connection is unusable after this error.
    pub fn is_connection(&self) -> bool {
        matches!(self, UpstreamError::Connection(_))
    }
}

impl From<sqlx::Error> for UpstreamError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => UpstreamError::Query {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnNotFound(_) => UpstreamError::Query {
                code: None,
                message: e.to_string(),
            },
            other => UpstreamError::Connection(other.to_string()),
        }
    }
}

/// Column description as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamColumn {
    pub name: String,
    pub type_oid: u32,
    pub table_oid: Option<i32>,
    pub column_ordinal: Option<i16>,
}

/// One statement's fully buffered result set. Values are in text format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamRows {
    pub columns: Vec<UpstreamColumn>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// An open, authenticated connection to one backend.
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Run query text with the simple protocol, one result set per statement.
    async fn query(&mut self, sql: &str) -> Result<Vec<UpstreamRows>, UpstreamError>;

    /// Check the connection is still alive.
    async fn ping(&mut self) -> Result<(), UpstreamError>;

    /// Close the connection gracefully.
    async fn close(self: Box<Self>);
}

/// Opens connections to backends.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// The DSN connections to `target` are pooled under.
    fn dsn(&self, target: &BackendTarget) -> Result<String, UpstreamError>;

    /// Open a connection authenticated with `auth.credential`.
    async fn dial(&self, auth: &Authenticated) -> Result<Box<dyn UpstreamConnection>, UpstreamError>;
}

/// Host and port a backend's Postgres endpoint listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddress {
    pub host: String,
    pub port: u16,
}

impl UpstreamAddress {
    /// Derive the Postgres endpoint from a runtime host.
    ///
    /// `postgres://` URLs and bare `host[:port]` keep their port (5432 when
    /// absent). Any other URL scheme names the runtime's HTTP endpoint, so
    /// its host is dialed on `default_port`.
    pub fn parse(runtime_host: &str, default_port: u16) -> Result<Self, UpstreamError> {
        let invalid = |reason: &str| UpstreamError::Connection(format!("invalid runtime host {runtime_host:?}: {reason}"));

        if runtime_host.contains("://") {
            let url = url::Url::parse(runtime_host).map_err(|e| invalid(&e.to_string()))?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| invalid("missing host"))?
                .to_string();
            let port = match url.scheme() {
                "postgres" | "postgresql" => url.port().unwrap_or(5432),
                _ => default_port,
            };
            return Ok(Self { host, port });
        }

        match runtime_host.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid("bad port"))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None if !runtime_host.is_empty() => Ok(Self {
                host: runtime_host.to_string(),
                port: 5432,
            }),
            _ => Err(invalid("missing host")),
        }
    }

    /// `postgres://host:port/<instance>`.
    pub fn dsn(&self, instance_id: &str) -> String {
        format!("postgres://{}:{}/{}", self.host, self.port, instance_id)
    }
}

/// sqlx-backed [`Dialer`].
pub struct PgDialer {
    config: UpstreamConfig,
}

impl PgDialer {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self, address: &UpstreamAddress, auth: &Authenticated) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&address.host)
            .port(address.port)
            .database(&auth.target.instance_id)
            .username(&self.config.username)
            .password(auth.credential.expose())
            .ssl_mode(pg_ssl_mode(self.config.ssl_mode))
            .application_name(&self.config.application_name)
            .statement_cache_capacity(0)
    }
}

#[async_trait]
impl Dialer for PgDialer {
    fn dsn(&self, target: &BackendTarget) -> Result<String, UpstreamError> {
        Ok(UpstreamAddress::parse(&target.host, self.config.port)?.dsn(&target.instance_id))
    }

    async fn dial(&self, auth: &Authenticated) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        let address = UpstreamAddress::parse(&auth.target.host, self.config.port)?;
        let options = self.connect_options(&address, auth);
        let timeout = self.config.connect_timeout();

        let conn = tokio::time::timeout(timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                UpstreamError::Connection(format!(
                    "timed out after {timeout:?} connecting to {}:{}",
                    address.host, address.port
                ))
            })?
            .map_err(|e| match UpstreamError::from(e) {
                // Authentication failures surface as database errors; at dial
                // time every failure means there is no connection.
                UpstreamError::Query { message, .. } => UpstreamError::Connection(message),
                other => other,
            })?;

        Ok(Box::new(PgUpstream { conn }))
    }
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

struct PgUpstream {
    conn: PgConnection,
}

#[async_trait]
impl UpstreamConnection for PgUpstream {
    async fn query(&mut self, sql: &str) -> Result<Vec<UpstreamRows>, UpstreamError> {
        simple_query(&mut self.conn, sql).await
    }

    async fn ping(&mut self) -> Result<(), UpstreamError> {
        self.conn.ping().await.map_err(UpstreamError::from)
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "Error closing upstream connection");
        }
    }
}

/// Run `sql` and split the rows at each statement's completion.
async fn simple_query<'c>(conn: &'c mut PgConnection, sql: &'c str) -> Result<Vec<UpstreamRows>, UpstreamError> {
    let mut results = Vec::new();
    let mut current = UpstreamRows::default();

    let mut stream = sqlx::raw_sql(sql).fetch_many(conn);
    while let Some(step) = stream.try_next().await? {
        match step {
            Either::Left(_) => results.push(std::mem::take(&mut current)),
            Either::Right(row) => push_row(&mut current, &row)?,
        }
    }
    // A trailing set without a completion message still belongs to the reply.
    if !current.rows.is_empty() {
        results.push(current);
    }
    Ok(results)
}

fn push_row(set: &mut UpstreamRows, row: &PgRow) -> Result<(), UpstreamError> {
    if set.rows.is_empty() {
        set.columns = row
            .columns()
            .iter()
            .map(|c| UpstreamColumn {
                name: c.name().to_string(),
                type_oid: c.type_info().oid().map(|oid| oid.0).unwrap_or(TEXT_OID),
                table_oid: None,
                column_ordinal: None,
            })
            .collect();
    }

    let values = (0..row.len())
        .map(|i| row.try_get_unchecked::<Option<String>, _>(i))
        .collect::<Result<Vec<_>, _>>()?;
    set.rows.push(values);
    Ok(())
}

const TEXT_OID: u32 = 25;
