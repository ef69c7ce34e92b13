//! Error types for the session engine.
//!
//! All errors carry the name of the operation that failed; configuration
//! errors additionally name the offending field. Contention is not a
//! separate variant - it is a cross-cutting label over query and connection
//! faults, exposed through [`Error::is_contention`].

use crate::classify::{self, DriverFault};
use crate::config::Dialect;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad construction parameter. Always synchronous, never retried.
    #[error("Invalid configuration for '{field}': {message}")]
    Configuration { field: String, message: String },

    /// Physical connection failure.
    #[error("Connection failed in {operation}: {fault}")]
    Connection { operation: String, fault: DriverFault },

    /// Engine not started, or pool construction failure.
    #[error("Engine error in {operation}: {message}")]
    Engine { operation: String, message: String },

    /// Session acquisition or setup failure.
    #[error("Session error in {operation}: {message}")]
    Session { operation: String, message: String },

    /// Statement failure or statement timeout on a live session.
    #[error("Query failed in {operation}: {fault}")]
    Query { operation: String, fault: DriverFault },

    /// Commit or rollback failure.
    #[error("Transaction error in {operation}: {message}")]
    Transaction { operation: String, message: String },

    #[error("Manager is not initialized - call initialize() first")]
    NotInitialized,

    #[error("Manager is already initialized - pass force=true to replace the engine")]
    AlreadyInitialized,
}

impl Error {
    /// Create a configuration error naming the offending field.
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a connection error wrapping a normalized driver fault.
    pub fn connection(operation: impl Into<String>, fault: DriverFault) -> Self {
        Self::Connection {
            operation: operation.into(),
            fault,
        }
    }

    /// Create an engine error.
    pub fn engine(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a session error.
    pub fn session(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a query error wrapping a normalized driver fault.
    pub fn query(operation: impl Into<String>, fault: DriverFault) -> Self {
        Self::Query {
            operation: operation.into(),
            fault,
        }
    }

    /// Create a transaction error.
    pub fn transaction(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transaction {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map an sqlx error raised while talking to `dialect`.
    ///
    /// Pool acquisition problems become session errors, transport problems
    /// become connection errors, and everything the server itself rejected
    /// becomes a query error carrying the normalized fault.
    pub fn from_sqlx(operation: impl Into<String>, dialect: Dialect, err: sqlx::Error) -> Self {
        let operation = operation.into();
        match &err {
            sqlx::Error::PoolTimedOut => {
                Self::session(operation, "timed out acquiring a pooled connection")
            }
            sqlx::Error::PoolClosed => Self::session(operation, "connection pool is closed"),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_) => {
                Self::connection(operation, DriverFault::from_sqlx(dialect, &err))
            }
            _ => Self::query(operation, DriverFault::from_sqlx(dialect, &err)),
        }
    }

    /// Is this transient contention (deadlock, lock timeout, serialization
    /// failure) worth retrying?
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Query { fault, .. } | Self::Connection { fault, .. } => {
                classify::is_contention_error(fault)
            }
            _ => false,
        }
    }

    /// Configuration and manager-state errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::NotInitialized | Self::AlreadyInitialized
        )
    }

    /// The driver fault behind this error, if one was captured.
    pub fn fault(&self) -> Option<&DriverFault> {
        match self {
            Self::Query { fault, .. } | Self::Connection { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
