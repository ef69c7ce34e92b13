//! Engine: one connection pool and session factory for one target.
//!
//! The engine owns a per-dialect sqlx pool built from exactly one
//! [`ConnectionTarget`]. It lends sessions, tracks them through non-owning
//! weak handles, answers health checks and delegates DDL to opaque schema
//! objects.
//!
//! State machine: NOT_STARTED --start()--> STARTED --stop()--> NOT_STARTED.
//! Both transitions are idempotent and the engine is re-startable.
//!
//! Lock discipline: the pool slot is a `tokio::sync::RwLock` so `stop()`
//! waits for in-flight acquisitions; the tracking set and health cache use
//! std mutexes held only for short synchronous sections.

use crate::config::{ConnectionTarget, Dialect};
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::session::{Session, SessionConn, SessionHandle, SessionOptions, SessionSetup};
use futures_util::future::BoxFuture;
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How long a cached health report stays valid.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(1);

/// Inline wait during `stop()` for checked-out connections to come home.
const POOL_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    Mysql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::Mysql(_) => Dialect::Mysql,
            DbPool::Postgres(_) => Dialect::Postgres,
            DbPool::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn close(&self) {
        match self {
            DbPool::Mysql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            DbPool::Mysql(pool) => pool.size(),
            DbPool::Postgres(pool) => pool.size(),
            DbPool::Sqlite(pool) => pool.size(),
        }
    }

    pub fn num_idle(&self) -> usize {
        match self {
            DbPool::Mysql(pool) => pool.num_idle(),
            DbPool::Postgres(pool) => pool.num_idle(),
            DbPool::Sqlite(pool) => pool.num_idle(),
        }
    }

    async fn acquire_conn(&self) -> std::result::Result<SessionConn, sqlx::Error> {
        match self {
            DbPool::Mysql(pool) => Ok(SessionConn::Mysql(pool.acquire().await?)),
            DbPool::Postgres(pool) => Ok(SessionConn::Postgres(pool.acquire().await?)),
            DbPool::Sqlite(pool) => Ok(SessionConn::Sqlite(pool.acquire().await?)),
        }
    }

    /// Trivial round-trip used by health checks.
    async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
        match self {
            DbPool::Mysql(pool) => {
                sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
            }
            DbPool::Postgres(pool) => {
                sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
            }
        }
        Ok(())
    }
}

/// Health check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolInfo {
    /// Open connections.
    pub size: u32,
    /// Idle connections waiting in the pool.
    pub idle: usize,
    /// Configured hard cap.
    pub max: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub engine_alive: bool,
    pub connection_test: bool,
    pub active_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_info: Option<PoolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Engine {
    target: ConnectionTarget,
    pool: RwLock<Option<DbPool>>,
    /// Non-owning references to lent sessions; pruned lazily.
    sessions: Mutex<Vec<Weak<SessionHandle>>>,
    last_schema: Mutex<Option<Arc<dyn Schema>>>,
    health_cache: Mutex<Option<(Instant, HealthReport)>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dialect", &self.target.dialect)
            .field("database", &self.target.database)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine for one target. Validates the target; no pool is
    /// created until [`start`](Self::start).
    pub fn new(target: ConnectionTarget) -> Result<Self> {
        target.validate()?;
        Ok(Self {
            target,
            pool: RwLock::new(None),
            sessions: Mutex::new(Vec::new()),
            last_schema: Mutex::new(None),
            health_cache: Mutex::new(None),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.target.dialect
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Build the pool and session factory. Idempotent: a second call on a
    /// started engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            debug!(dialect = %self.target.dialect, "Engine already started");
            return Ok(());
        }
        let pool = build_pool(&self.target).await?;
        if self.target.pool.echo_pool {
            info!(
                dialect = %self.target.dialect,
                database = %self.target.database,
                max_connections = self.target.pool.max_connections(self.target.dialect),
                "Connection pool created"
            );
        }
        *slot = Some(pool);
        info!(dialect = %self.target.dialect, "Engine started");
        Ok(())
    }

    /// Dispose the pool and force-close tracked sessions. Best-effort:
    /// never raises, idempotent, and the engine can be started again.
    ///
    /// Returns even while sessions are still checked out: their handles are
    /// marked closed here, and the pool drain completes in the background as
    /// each borrower's close/drop returns its connection.
    pub async fn stop(&self) {
        let pool = self.pool.write().await.take();
        let closed = self.close_all_sessions();
        if closed > 0 {
            warn!(count = closed, "Force-closed sessions during engine stop");
        }
        if let Some(pool) = pool {
            // close() resolves only once every connection is returned, so
            // bound the inline wait instead of blocking on borrowers.
            if tokio::time::timeout(POOL_DRAIN_TIMEOUT, pool.close())
                .await
                .is_err()
            {
                warn!(
                    dialect = %self.target.dialect,
                    "Pool drain still waiting on outstanding sessions"
                );
                let pool = pool.clone();
                tokio::spawn(async move { pool.close().await });
            }
            if self.target.pool.echo_pool {
                info!(dialect = %self.target.dialect, "Connection pool disposed");
            }
        }
        if let Ok(mut cache) = self.health_cache.lock() {
            *cache = None;
        }
        info!(dialect = %self.target.dialect, "Engine stopped");
    }

    /// Pure state read: has `start()` run without a matching `stop()`?
    pub async fn is_alive(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Acquire a tracked session with the target's default settings.
    ///
    /// Fails with an engine error before `start()`; acquisition or setup
    /// failure wraps as a session error.
    pub async fn get_session(&self) -> Result<Session> {
        self.get_session_with(&SessionOptions::default()).await
    }

    /// Acquire a tracked session with explicit options.
    pub async fn get_session_with(&self, opts: &SessionOptions) -> Result<Session> {
        // Option validation runs before the pool is touched.
        opts.validate(self.target.dialect)?;

        let conn = {
            let slot = self.pool.read().await;
            let pool = slot
                .as_ref()
                .ok_or_else(|| Error::engine("get_session", "engine is not started"))?;
            pool.acquire_conn()
                .await
                .map_err(|e| Error::session("get_session", e.to_string()))?
        };

        let mut session = Session::new(conn, self.target.dialect, self.target.pool.echo);
        let setup = self.session_setup(opts);
        if let Err(e) = session.begin(&setup).await {
            session.close().await;
            return Err(e);
        }
        self.track(session.handle());
        Ok(session)
    }

    fn session_setup(&self, opts: &SessionOptions) -> SessionSetup {
        let timeout_ms = opts.timeout_ms().or(match self.target.dialect {
            Dialect::Sqlite => None,
            Dialect::Mysql | Dialect::Postgres => self.target.statement_timeout_ms,
        });
        SessionSetup {
            timeout_ms,
            isolation: opts.isolation.or(self.target.pool.isolation_level),
            default_busy_timeout_ms: self.target.busy_timeout_ms,
        }
    }

    /// Run `f` inside a scoped session with guaranteed release.
    ///
    /// Normal exit commits iff `opts.auto_commit` resolves true (the flag
    /// inherits the target's `autocommit` policy when unset); an error exit
    /// rolls back and returns the original error unchanged. The session is
    /// closed on every path.
    pub async fn session_scope<T, F>(&self, opts: SessionOptions, f: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>> + Send,
    {
        let auto_commit = opts
            .auto_commit
            .unwrap_or_else(|| self.target.pool.autocommit_or_default());
        let mut session = self.get_session_with(&opts).await?;
        let outcome = f(&mut session).await;
        match outcome {
            Ok(value) => {
                if auto_commit {
                    if let Err(e) = session.commit().await {
                        session.close().await;
                        return Err(e);
                    }
                }
                session.close().await;
                Ok(value)
            }
            Err(err) => {
                if session.in_transaction() {
                    if let Err(rb) = session.rollback().await {
                        warn!(session = %session.id(), error = %rb, "Rollback failed");
                    }
                }
                session.close().await;
                Err(err)
            }
        }
    }

    fn track(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|weak| weak.upgrade().is_some_and(|h| !h.is_closed()));
        sessions.push(Arc::downgrade(&handle));
    }

    /// Count of still-live lent sessions, pruning dead entries.
    pub fn get_active_session_count(&self) -> usize {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|weak| weak.upgrade().is_some_and(|h| !h.is_closed()));
        sessions.len()
    }

    /// Force-close every tracked session and return how many were marked.
    ///
    /// Ownership of each session stays with its borrower: the mark makes
    /// further statements fail and the owner's close/drop releases the
    /// connection. Never raises; safe with zero sessions.
    pub fn close_all_sessions(&self) -> usize {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut closed = 0;
        for weak in sessions.iter() {
            if let Some(handle) = weak.upgrade() {
                if !handle.is_closed() {
                    handle.mark_closed();
                    closed += 1;
                    debug!(session = %handle.id(), "Session force-closed");
                }
            }
        }
        sessions.clear();
        closed
    }

    /// Engine and connection health.
    ///
    /// Reports `Stopped` when never started (or stopped), `Healthy` /
    /// `Unhealthy` from a trivial round-trip, and `Error` for unexpected
    /// failures. Reports are cached for a short TTL when `use_cache`.
    pub async fn health_check(&self, use_cache: bool) -> HealthReport {
        if use_cache {
            if let Ok(cache) = self.health_cache.lock() {
                if let Some((at, report)) = cache.as_ref() {
                    if at.elapsed() < HEALTH_CACHE_TTL {
                        return report.clone();
                    }
                }
            }
        }
        let report = self.health_check_uncached().await;
        if let Ok(mut cache) = self.health_cache.lock() {
            *cache = Some((Instant::now(), report.clone()));
        }
        report
    }

    async fn health_check_uncached(&self) -> HealthReport {
        let active_sessions = self.get_active_session_count();
        let slot = self.pool.read().await;
        let Some(pool) = slot.as_ref() else {
            return HealthReport {
                status: HealthStatus::Stopped,
                engine_alive: false,
                connection_test: false,
                active_sessions,
                pool_info: None,
                error: None,
            };
        };
        let pool_info = Some(PoolInfo {
            size: pool.size(),
            idle: pool.num_idle(),
            max: self.target.pool.max_connections(self.target.dialect),
        });
        match pool.ping().await {
            Ok(()) => HealthReport {
                status: HealthStatus::Healthy,
                engine_alive: true,
                connection_test: true,
                active_sessions,
                pool_info,
                error: None,
            },
            Err(err) => {
                let status = match &err {
                    sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed => HealthStatus::Unhealthy,
                    _ => HealthStatus::Error,
                };
                warn!(error = %err, "Health check round-trip failed");
                HealthReport {
                    status,
                    engine_alive: true,
                    connection_test: false,
                    active_sessions,
                    pool_info,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Create all objects of `schema` through a dedicated session and cache
    /// the schema for a later `drop_tables(None)`.
    pub async fn create_tables(&self, schema: Arc<dyn Schema>) -> Result<()> {
        if !self.is_alive().await {
            return Err(Error::engine("create_tables", "engine is not started"));
        }
        self.run_ddl("create_tables", |session| {
            let schema = Arc::clone(&schema);
            Box::pin(async move { schema.create_all(session).await })
        })
        .await?;
        if let Ok(mut cached) = self.last_schema.lock() {
            *cached = Some(schema);
        }
        Ok(())
    }

    /// Drop all objects of `schema`, or of the most recently cached schema
    /// when `schema` is None.
    pub async fn drop_tables(&self, schema: Option<Arc<dyn Schema>>) -> Result<()> {
        if !self.is_alive().await {
            return Err(Error::engine("drop_tables", "engine is not started"));
        }
        let schema = match schema {
            Some(schema) => schema,
            None => self
                .last_schema
                .lock()
                .ok()
                .and_then(|cached| cached.clone())
                .ok_or_else(|| {
                    Error::engine("drop_tables", "no schema given and none cached")
                })?,
        };
        self.run_ddl("drop_tables", |session| {
            let schema = Arc::clone(&schema);
            Box::pin(async move { schema.drop_all(session).await })
        })
        .await?;
        if let Ok(mut cached) = self.last_schema.lock() {
            *cached = Some(schema);
        }
        Ok(())
    }

    async fn run_ddl<F>(&self, operation: &str, f: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<()>> + Send,
    {
        let mut session = self.get_session().await?;
        let result = f(&mut session).await;
        let result = match result {
            Ok(()) => session.commit().await,
            Err(err) => {
                if session.in_transaction() {
                    if let Err(rb) = session.rollback().await {
                        warn!(operation, error = %rb, "DDL rollback failed");
                    }
                }
                Err(err)
            }
        };
        session.close().await;
        result
    }
}

/// Build the per-dialect pool for a target.
async fn build_pool(target: &ConnectionTarget) -> Result<DbPool> {
    let dialect = target.dialect;
    let policy = &target.pool;
    let max_connections = policy.max_connections(dialect);
    let min_connections = policy.pool_size_or_default(dialect);
    let acquire_timeout = Duration::from_secs(policy.acquire_timeout_or_default());
    let max_lifetime = policy.recycle_or_default(dialect).map(Duration::from_secs);
    let wrap = |e: sqlx::Error| Error::engine("start", format!("failed to create pool: {e}"));

    match dialect {
        Dialect::Mysql => {
            let mut options = MySqlConnectOptions::new()
                .host(target.host.as_deref().unwrap_or("localhost"))
                .port(target.port.unwrap_or(3306))
                .database(&target.database)
                .charset("utf8mb4");
            if let Some(username) = &target.username {
                options = options.username(username);
            }
            if let Some(password) = &target.password {
                options = options.password(password);
            }
            let pool = MySqlPoolOptions::new()
                .min_connections(min_connections)
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .max_lifetime(max_lifetime)
                .test_before_acquire(policy.pre_ping_or_default())
                .connect_with(options)
                .await
                .map_err(wrap)?;
            Ok(DbPool::Mysql(pool))
        }
        Dialect::Postgres => {
            let mut options = PgConnectOptions::new()
                .host(target.host.as_deref().unwrap_or("localhost"))
                .port(target.port.unwrap_or(5432))
                .database(&target.database);
            if let Some(username) = &target.username {
                options = options.username(username);
            }
            if let Some(password) = &target.password {
                options = options.password(password);
            }
            if let Some(name) = &target.application_name {
                options = options.application_name(name);
            }
            let mut server_settings: Vec<(String, String)> = policy
                .connect_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if let Some(ms) = target.statement_timeout_ms {
                server_settings.push(("statement_timeout".to_string(), ms.to_string()));
            }
            if !server_settings.is_empty() {
                options = options.options(server_settings);
            }
            let pool = PgPoolOptions::new()
                .min_connections(min_connections)
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .max_lifetime(max_lifetime)
                .test_before_acquire(policy.pre_ping_or_default())
                .connect_with(options)
                .await
                .map_err(wrap)?;
            Ok(DbPool::Postgres(pool))
        }
        Dialect::Sqlite => {
            let mut options = SqliteConnectOptions::new()
                .filename(&target.database)
                .create_if_missing(true)
                .busy_timeout(Duration::from_millis(
                    target
                        .busy_timeout_ms
                        .unwrap_or(crate::config::DEFAULT_BUSY_TIMEOUT_MS),
                ));
            for (key, value) in &policy.connect_args {
                options = options.pragma(key.clone(), value.clone());
            }
            let pool = SqlitePoolOptions::new()
                .min_connections(min_connections)
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .max_lifetime(max_lifetime)
                .test_before_acquire(policy.pre_ping_or_default())
                .connect_with(options)
                .await
                .map_err(wrap)?;
            Ok(DbPool::Sqlite(pool))
        }
    }
}
