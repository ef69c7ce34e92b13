//! Thread-safe session and connection management for SQL databases
//! (SQLite, PostgreSQL, MySQL).
//!
//! One [`Engine`] per database target owns a connection pool and lends
//! scoped [`Session`]s with commit/rollback/timeout policy. The [`scope`]
//! wrappers add declarative transaction policies including contention-aware
//! retry, and [`Manager`] ties a process-wide default engine to
//! configuration.

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod retry;
pub mod schema;
pub mod scope;
pub mod session;

pub use classify::{DialectFamily, DriverFault, is_contention_error};
pub use config::{ConnectionTarget, Dialect, IsolationLevel, PoolPolicy};
pub use engine::{DbPool, Engine, HealthReport, HealthStatus, PoolInfo};
pub use error::{Error, Result};
pub use manager::{InitOptions, Manager};
pub use retry::RetryPolicy;
pub use schema::{Schema, SqlSchema};
pub use session::{Session, SessionHandle, SessionOptions, SqlValue};
