//! Per-backend connection pooling with credential-bound lifetimes.
//!
//! The pool keeps one [`PoolEntry`] per `(DSN, tenant, caller)`. Each entry
//! bounds its concurrent leases with a semaphore and keeps returned
//! connections in an idle queue. A new physical connection is only opened
//! when no idle one is available, and only then is the connect hook run, so
//! each physical connection authenticates with its own credential.
//!
//! Connections are recycled once they reach `max_conn_lifetime`, which is
//! configured below the credential TTL. A background task per entry pings
//! idle connections every `health_check_period` and drops dead, expired or
//! long-idle ones. Once an entry holds no connections and no leases it is
//! removed from the pool and its task stops.

use crate::connect::{ConnectContext, ConnectionFactory};
use crate::credential::CallerIdentity;
use crate::error::ProxyError;
use crate::tenant::{BackendTarget, TenantKey};
use crate::upstream::{Dialer, UpstreamConnection, UpstreamError, UpstreamRows};
use pgtenant_core::PoolSettings;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of a pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub dsn: String,
    pub tenant: TenantKey,
    pub caller: CallerIdentity,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} as {})", self.dsn, self.tenant, self.caller)
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub entries: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: bool,
}

struct PooledConnection {
    id: u64,
    conn: Box<dyn UpstreamConnection>,
    /// Target the connect hook dialed, which may differ from the lease request.
    target: BackendTarget,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn is_expired(&self, max_lifetime: std::time::Duration) -> bool {
        self.created_at.elapsed() >= max_lifetime
    }

    fn is_idle_for(&self, idle_timeout: std::time::Duration) -> bool {
        self.last_used.elapsed() >= idle_timeout
    }
}

fn close_in_background(pooled: PooledConnection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(pooled.conn.close());
        }
        Err(_) => drop(pooled),
    }
}

/// Connections to one backend for one caller.
struct PoolEntry {
    key: PoolKey,
    pool: Weak<Mutex<PoolState>>,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    dialer: Arc<dyn Dialer>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    closed: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
    next_id: Arc<AtomicU64>,
}

impl PoolEntry {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire(self: &Arc<Self>, ctx: &ConnectContext) -> Result<Lease, ProxyError> {
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ProxyError::PoolClosed),
            Err(_) => {
                return Err(ProxyError::AcquireTimeout {
                    dsn: self.key.dsn.clone(),
                    timeout: self.settings.acquire_timeout,
                });
            }
        };

        if self.is_closed() {
            return Err(ProxyError::PoolClosed);
        }

        let pooled = match self.take_idle() {
            Some(pooled) => pooled,
            None => self.connect(ctx).await?,
        };

        Ok(Lease {
            pooled: Some(pooled),
            entry: self.clone(),
            dirty: false,
            _permit: permit,
        })
    }

    /// Most recently returned live connection, discarding expired ones.
    fn take_idle(&self) -> Option<PooledConnection> {
        loop {
            let pooled = lock(&self.idle).pop_back()?;
            if pooled.is_expired(self.settings.max_conn_lifetime) {
                tracing::debug!(pool = %self.key, connection_id = pooled.id, "Recycling expired connection");
                close_in_background(pooled);
                continue;
            }
            return Some(pooled);
        }
    }

    async fn connect(&self, ctx: &ConnectContext) -> Result<PooledConnection, ProxyError> {
        let auth = self.factory.authenticate(ctx).await?;
        let conn = self.dialer.dial(&auth).await.map_err(|e| {
            tracing::warn!(tenant = %ctx.tenant, dsn = %self.key.dsn, error = %e, "Upstream dial failed");
            ProxyError::UpstreamDialFailed(e.to_string())
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            pool = %self.key,
            connection_id = id,
            deployment = %auth.target.deployment_id,
            "Opened upstream connection"
        );

        let now = Instant::now();
        Ok(PooledConnection {
            id,
            conn,
            target: auth.target,
            created_at: now,
            last_used: now,
        })
    }

    fn release(&self, mut pooled: PooledConnection, dirty: bool) {
        if dirty || self.is_closed() || pooled.is_expired(self.settings.max_conn_lifetime) {
            tracing::debug!(
                pool = %self.key,
                connection_id = pooled.id,
                dirty,
                "Discarding connection on release"
            );
            close_in_background(pooled);
            return;
        }
        pooled.last_used = Instant::now();
        lock(&self.idle).push_back(pooled);
    }

    fn start_health_check(self: &Arc<Self>) {
        let entry = Arc::downgrade(self);
        let period = self.settings.health_check_period;
        let handle = tokio::spawn(health_check_loop(entry, period));
        *lock(&self.health_task) = Some(handle);
    }

    async fn check_idle(&self) {
        let candidates: Vec<_> = lock(&self.idle).drain(..).collect();
        let mut healthy = Vec::with_capacity(candidates.len());

        for mut pooled in candidates {
            if pooled.is_expired(self.settings.max_conn_lifetime) {
                tracing::debug!(pool = %self.key, connection_id = pooled.id, "Recycling expired connection");
                pooled.conn.close().await;
                continue;
            }
            if pooled.is_idle_for(self.settings.idle_timeout) {
                tracing::debug!(pool = %self.key, connection_id = pooled.id, "Closing idle connection");
                pooled.conn.close().await;
                continue;
            }
            match pooled.conn.ping().await {
                Ok(()) => healthy.push(pooled),
                Err(e) => {
                    tracing::warn!(pool = %self.key, connection_id = pooled.id, error = %e, "Dropping dead upstream connection");
                    pooled.conn.close().await;
                }
            }
        }

        if self.is_closed() {
            for pooled in healthy {
                pooled.conn.close().await;
            }
        } else {
            lock(&self.idle).extend(healthy);
        }
    }

    /// Remove this entry from the pool when nothing uses it.
    ///
    /// Returns whether the entry is gone and its health check should stop.
    fn evict_if_unused(self: &Arc<Self>) -> bool {
        let Some(state) = self.pool.upgrade() else {
            return true;
        };
        let mut state = lock(&state);

        // References are only handed out under the state lock, so the map and
        // the running health check hold the only two when the entry is unused.
        if Arc::strong_count(self) > 2 || !lock(&self.idle).is_empty() {
            return false;
        }
        if !state.entries.get(&self.key).is_some_and(|e| Arc::ptr_eq(e, self)) {
            return true;
        }

        state.entries.remove(&self.key);
        self.closed.store(true, Ordering::Release);
        lock(&self.health_task).take();
        tracing::debug!(pool = %self.key, "Removed unused pool entry");
        true
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
        if let Some(handle) = lock(&self.health_task).take() {
            handle.abort();
        }

        let idle: Vec<_> = lock(&self.idle).drain(..).collect();
        for pooled in idle {
            pooled.conn.close().await;
        }
    }

    fn stats(&self) -> (usize, usize) {
        let idle = lock(&self.idle).len();
        let leased = (self.settings.max_connections as usize).saturating_sub(self.semaphore.available_permits());
        (idle, leased)
    }
}

async fn health_check_loop(entry: Weak<PoolEntry>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(entry) = entry.upgrade() else {
            break;
        };
        if entry.is_closed() {
            break;
        }
        entry.check_idle().await;
        if entry.evict_if_unused() {
            break;
        }
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns the connection to its entry. A lease dropped
/// while a query is in flight discards the connection instead.
pub struct Lease {
    pooled: Option<PooledConnection>,
    entry: Arc<PoolEntry>,
    dirty: bool,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Identifier of the physical connection behind this lease.
    pub fn connection_id(&self) -> Option<u64> {
        self.pooled.as_ref().map(|p| p.id)
    }

    /// Target the leased connection was dialed to.
    pub fn target(&self) -> Option<&BackendTarget> {
        self.pooled.as_ref().map(|p| &p.target)
    }

    /// Run query text on the leased connection.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<UpstreamRows>, UpstreamError> {
        let Some(pooled) = self.pooled.as_mut() else {
            return Err(UpstreamError::Connection("lease already released".to_string()));
        };

        self.dirty = true;
        let result = pooled.conn.query(sql).await;
        // A backend error leaves the connection usable; a transport error does not.
        self.dirty = matches!(&result, Err(e) if e.is_connection());
        result
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.entry.release(pooled, self.dirty);
        }
    }
}

struct PoolState {
    closed: bool,
    entries: HashMap<PoolKey, Arc<PoolEntry>>,
}

/// All pool entries of a proxy.
pub struct ConnectionPool {
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    dialer: Arc<dyn Dialer>,
    next_id: Arc<AtomicU64>,
    state: Arc<Mutex<PoolState>>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn ConnectionFactory>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            settings,
            factory,
            dialer,
            next_id: Arc::new(AtomicU64::new(1)),
            state: Arc::new(Mutex::new(PoolState {
                closed: false,
                entries: HashMap::new(),
            })),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Lease a connection to the caller's tenant backend.
    pub async fn acquire(&self, ctx: &ConnectContext) -> Result<Lease, ProxyError> {
        let dsn = self
            .dialer
            .dsn(&ctx.target)
            .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
        let key = PoolKey {
            dsn,
            tenant: ctx.tenant.clone(),
            caller: ctx.caller.clone(),
        };

        let entry = self.entry(key)?;
        entry.acquire(ctx).await
    }

    /// Get or create the entry for `key` in a single critical section.
    fn entry(&self, key: PoolKey) -> Result<Arc<PoolEntry>, ProxyError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ProxyError::PoolClosed);
        }
        if let Some(entry) = state.entries.get(&key) {
            return Ok(entry.clone());
        }

        tracing::info!(pool = %key, "Creating pool entry");
        let entry = Arc::new(PoolEntry {
            key: key.clone(),
            pool: Arc::downgrade(&self.state),
            settings: self.settings,
            factory: self.factory.clone(),
            dialer: self.dialer.clone(),
            semaphore: Arc::new(Semaphore::new(self.settings.max_connections as usize)),
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            health_task: Mutex::new(None),
            next_id: self.next_id.clone(),
        });
        entry.start_health_check();
        state.entries.insert(key, entry.clone());
        Ok(entry)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Close every entry. Later calls are no-ops.
    pub async fn close(&self) {
        let entries: Vec<_> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = entries.len();
        for entry in entries {
            entry.close().await;
        }
        tracing::info!(entries = count, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        let mut stats = PoolStats {
            entries: state.entries.len(),
            closed: state.closed,
            ..PoolStats::default()
        };
        for entry in state.entries.values() {
            let (idle, leased) = entry.stats();
            stats.idle += idle;
            stats.leased += leased;
        }
        stats
    }
}
