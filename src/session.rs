//! Sessions: one pooled connection with an explicit transaction.
//!
//! A `Session` is a unit of work. It is owned by exactly one caller at a
//! time (`&mut` access enforces exclusivity) and is released on every exit
//! path - committed or rolled back, then returned to the pool. The engine
//! keeps only a non-owning [`SessionHandle`] for diagnostics and
//! force-close.

use crate::config::{Dialect, IsolationLevel, DEFAULT_BUSY_TIMEOUT_MS};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, MySql, Postgres, Row, Sqlite};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Options applied when a session is acquired through a scoped block.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Statement/busy timeout in seconds. Must be in (0, 3600] when set.
    pub timeout_secs: Option<f64>,
    /// Commit on normal scope exit. Unset inherits the target's
    /// `autocommit` pool policy (true unless overridden there).
    pub auto_commit: Option<bool>,
    /// Parity flag; statements execute eagerly, so there is nothing to
    /// flush separately.
    pub auto_flush: Option<bool>,
    /// Isolation level for this session's transaction.
    pub isolation: Option<IsolationLevel>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            auto_commit: None,
            auto_flush: None,
            isolation: None,
        }
    }
}

impl SessionOptions {
    /// Convenience constructor with an explicit timeout.
    pub fn with_timeout(secs: f64) -> Self {
        Self {
            timeout_secs: Some(secs),
            ..Self::default()
        }
    }

    /// Check option values against the active dialect. Runs before the pool
    /// is touched.
    pub fn validate(&self, dialect: Dialect) -> Result<()> {
        if let Some(secs) = self.timeout_secs {
            if !(secs > 0.0 && secs <= 3600.0) {
                return Err(Error::configuration(
                    "timeout",
                    format!("must be in (0, 3600] seconds, got {secs}"),
                ));
            }
        }
        if let Some(level) = self.isolation {
            if !dialect.supports_isolation(level) {
                return Err(Error::configuration(
                    "isolation_level",
                    format!("{dialect} does not support {}", level.as_sql()),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn timeout_ms(&self) -> Option<u64> {
        self.timeout_secs.map(|s| (s * 1000.0).round() as u64)
    }
}

/// Non-owning tracking handle for a lent session.
///
/// The engine holds `Weak` references to these; ownership of the session
/// (and its connection) stays with the borrowing caller.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    closed: AtomicBool,
}

impl SessionHandle {
    fn new(id: String) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Force-close marker. The owner's next statement fails and its
    /// close/drop releases the connection.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Bind parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

pub(crate) enum SessionConn {
    Mysql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

/// Per-session setup computed by the engine from the target and options.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionSetup {
    pub timeout_ms: Option<u64>,
    pub isolation: Option<IsolationLevel>,
    /// Busy timeout the connection should be restored to on close (SQLite).
    pub default_busy_timeout_ms: Option<u64>,
}

pub struct Session {
    id: String,
    dialect: Dialect,
    conn: Option<SessionConn>,
    in_tx: bool,
    echo: bool,
    /// Statements run on close to undo session-scoped settings before the
    /// connection returns to the pool.
    reset_statements: Vec<String>,
    handle: Arc<SessionHandle>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .field("open", &self.conn.is_some())
            .field("in_tx", &self.in_tx)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(conn: SessionConn, dialect: Dialect, echo: bool) -> Self {
        let id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        Self {
            handle: Arc::new(SessionHandle::new(id.clone())),
            id,
            dialect,
            conn: Some(conn),
            in_tx: false,
            echo,
            reset_statements: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some() && !self.handle.is_closed()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    pub(crate) fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    /// Apply timeouts/isolation and open the transaction.
    pub(crate) async fn begin(&mut self, setup: &SessionSetup) -> Result<()> {
        let statements = self.setup_statements(setup);
        for sql in statements {
            self.exec_raw(&sql)
                .await
                .map_err(|e| Error::session("session.begin", e.to_string()))?;
        }
        self.in_tx = true;
        debug!(session = %self.id, dialect = %self.dialect, "Session started");
        Ok(())
    }

    fn setup_statements(&mut self, setup: &SessionSetup) -> Vec<String> {
        let mut statements = Vec::new();
        match self.dialect {
            Dialect::Sqlite => {
                if let Some(ms) = setup.timeout_ms {
                    statements.push(format!("PRAGMA busy_timeout = {ms}"));
                    let default_ms = setup
                        .default_busy_timeout_ms
                        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
                    self.reset_statements
                        .push(format!("PRAGMA busy_timeout = {default_ms}"));
                }
                if setup.isolation == Some(IsolationLevel::ReadUncommitted) {
                    statements.push("PRAGMA read_uncommitted = 1".to_string());
                    self.reset_statements
                        .push("PRAGMA read_uncommitted = 0".to_string());
                }
                statements.push("BEGIN".to_string());
            }
            Dialect::Mysql => {
                if let Some(level) = setup.isolation {
                    // One-shot form: applies to the next transaction only,
                    // nothing leaks across pool checkouts.
                    statements.push(format!(
                        "SET TRANSACTION ISOLATION LEVEL {}",
                        level.as_sql()
                    ));
                }
                if let Some(ms) = setup.timeout_ms {
                    statements.push(format!("SET SESSION max_execution_time = {ms}"));
                    statements.push(format!(
                        "SET SESSION innodb_lock_wait_timeout = {}",
                        (ms / 1000).max(1)
                    ));
                    self.reset_statements
                        .push("SET SESSION max_execution_time = DEFAULT".to_string());
                    self.reset_statements
                        .push("SET SESSION innodb_lock_wait_timeout = DEFAULT".to_string());
                }
                statements.push("START TRANSACTION".to_string());
            }
            Dialect::Postgres => {
                statements.push("BEGIN".to_string());
                if let Some(level) = setup.isolation {
                    statements.push(format!(
                        "SET TRANSACTION ISOLATION LEVEL {}",
                        level.as_sql()
                    ));
                }
                if let Some(ms) = setup.timeout_ms {
                    // SET LOCAL resets itself when the transaction ends.
                    statements.push(format!("SET LOCAL statement_timeout = {ms}"));
                }
            }
        }
        statements
    }

    fn closed_error(&self, operation: &str) -> Error {
        if self.handle.is_closed() {
            Error::session(operation, format!("session {} was force-closed", self.id))
        } else {
            Error::session(operation, format!("session {} is closed", self.id))
        }
    }

    fn log_statement(&self, sql: &str) {
        if self.echo {
            info!(session = %self.id, sql, "SQL");
        } else {
            debug!(session = %self.id, sql, "SQL");
        }
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        if self.handle.is_closed() || self.conn.is_none() {
            return Err(self.closed_error("execute"));
        }
        self.log_statement(sql);
        let dialect = self.dialect;
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::session("execute", "session is closed"));
        };
        match conn {
            SessionConn::Mysql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                query
                    .execute(&mut **conn)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(|e| Error::from_sqlx("execute", dialect, e))
            }
            SessionConn::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                query
                    .execute(&mut **conn)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(|e| Error::from_sqlx("execute", dialect, e))
            }
            SessionConn::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                query
                    .execute(&mut **conn)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(|e| Error::from_sqlx("execute", dialect, e))
            }
        }
    }

    /// Fetch all rows as JSON maps keyed by column name.
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Map<String, Value>>> {
        if self.handle.is_closed() || self.conn.is_none() {
            return Err(self.closed_error("fetch_all"));
        }
        self.log_statement(sql);
        let dialect = self.dialect;
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::session("fetch_all", "session is closed"));
        };
        match conn {
            SessionConn::Mysql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let rows: Vec<MySqlRow> = query
                    .fetch_all(&mut **conn)
                    .await
                    .map_err(|e| Error::from_sqlx("fetch_all", dialect, e))?;
                Ok(rows.iter().map(mysql_row_to_map).collect())
            }
            SessionConn::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let rows: Vec<PgRow> = query
                    .fetch_all(&mut **conn)
                    .await
                    .map_err(|e| Error::from_sqlx("fetch_all", dialect, e))?;
                Ok(rows.iter().map(pg_row_to_map).collect())
            }
            SessionConn::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows: Vec<SqliteRow> = query
                    .fetch_all(&mut **conn)
                    .await
                    .map_err(|e| Error::from_sqlx("fetch_all", dialect, e))?;
                Ok(rows.iter().map(sqlite_row_to_map).collect())
            }
        }
    }

    /// Fetch the first column of the first row as an integer, if any row
    /// matched.
    pub async fn fetch_scalar_i64(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>> {
        let rows = self.fetch_all(sql, params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_i64))
    }

    /// Commit the open transaction.
    pub async fn commit(&mut self) -> Result<()> {
        if self.handle.is_closed() {
            return Err(Error::transaction(
                "commit",
                format!("session {} was force-closed", self.id),
            ));
        }
        if self.conn.is_none() || !self.in_tx {
            return Err(Error::transaction("commit", "no open transaction"));
        }
        self.exec_raw("COMMIT")
            .await
            .map_err(|e| Error::transaction("commit", e.to_string()))?;
        self.in_tx = false;
        debug!(session = %self.id, "Transaction committed");
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.conn.is_none() || !self.in_tx {
            return Err(Error::transaction("rollback", "no open transaction"));
        }
        self.exec_raw("ROLLBACK")
            .await
            .map_err(|e| Error::transaction("rollback", e.to_string()))?;
        self.in_tx = false;
        debug!(session = %self.id, "Transaction rolled back");
        Ok(())
    }

    /// Release the session: roll back anything still open, undo
    /// session-scoped settings and return the connection to the pool.
    /// Best-effort and idempotent; never raises.
    pub async fn close(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if self.in_tx {
            if let Err(e) = self.exec_raw("ROLLBACK").await {
                warn!(session = %self.id, error = %e, "Rollback on close failed");
            }
            self.in_tx = false;
        }
        let resets = std::mem::take(&mut self.reset_statements);
        for sql in resets {
            if let Err(e) = self.exec_raw(&sql).await {
                warn!(session = %self.id, error = %e, "Session reset failed");
            }
        }
        self.conn = None;
        self.handle.mark_closed();
        debug!(session = %self.id, "Session closed");
    }

    /// Raw statement path used by lifecycle operations; bypasses the
    /// force-close guard so close() can still roll back.
    async fn exec_raw(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(sqlx::Error::PoolClosed);
        };
        match conn {
            SessionConn::Mysql(c) => {
                sqlx::query(sql).execute(&mut **c).await?;
            }
            SessionConn::Postgres(c) => {
                sqlx::query(sql).execute(&mut **c).await?;
            }
            SessionConn::Sqlite(c) => {
                sqlx::query(sql).execute(&mut **c).await?;
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.handle.mark_closed();
        if let Some(conn) = self.conn.take() {
            if self.in_tx || !self.reset_statements.is_empty() {
                // The connection carries an open transaction or dirty
                // session settings; detach it so the pool never lends it
                // out again. The server rolls back on disconnect.
                warn!(
                    session = %self.id,
                    "Session dropped without close(); detaching connection"
                );
                match conn {
                    SessionConn::Mysql(c) => drop(c.detach()),
                    SessionConn::Postgres(c) => drop(c.detach()),
                    SessionConn::Sqlite(c) => drop(c.detach()),
                }
            }
        }
    }
}

fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

fn sqlite_row_to_map(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map(|b| Value::from(format!("<{} bytes>", b.len())))
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(col.name().to_string(), value);
    }
    map
}

fn mysql_row_to_map(row: &MySqlRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<u64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map(|b| Value::from(format!("<{} bytes>", b.len())))
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(col.name().to_string(), value);
    }
    map
}

fn pg_row_to_map(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i16>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f32>, _>(i) {
            v.map(|f| Value::from(f64::from(f))).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(col.name().to_string(), value);
    }
    map
}
