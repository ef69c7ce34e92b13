//! Contention classification for driver errors.
//!
//! Deadlocks, lock-wait timeouts and serialization failures are transient:
//! the statement that hit them usually succeeds when retried. Each dialect
//! reports them differently, so driver errors are first normalized into a
//! [`DriverFault`] and then classified by a single function.

use crate::config::Dialect;

/// Dialect family a driver fault originated from.
///
/// Wider than [`Dialect`]: SQL Server has no shipped driver but its
/// contention codes are still recognized so faults forwarded from external
/// sources classify correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectFamily {
    Postgres,
    /// Includes MariaDB.
    MySql,
    SqlServer,
    Sqlite,
}

impl From<Dialect> for DialectFamily {
    fn from(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Postgres => Self::Postgres,
            Dialect::Mysql => Self::MySql,
            Dialect::Sqlite => Self::Sqlite,
        }
    }
}

impl std::fmt::Display for DialectFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgresql"),
            Self::MySql => write!(f, "mysql"),
            Self::SqlServer => write!(f, "sqlserver"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl DialectFamily {
    /// Numeric/SQLSTATE codes this family raises for transient contention.
    ///
    /// PostgreSQL: 40001 serialization failure, 40P01 deadlock detected.
    /// MySQL/MariaDB: 1205 lock wait timeout, 1213 deadlock.
    /// SQL Server: 1205 deadlock victim, 1222 lock request timeout.
    /// SQLite: 5 SQLITE_BUSY, 6 SQLITE_LOCKED.
    pub fn contention_codes(&self) -> &'static [&'static str] {
        match self {
            Self::Postgres => &["40001", "40P01"],
            Self::MySql => &["1205", "1213"],
            Self::SqlServer => &["1205", "1222"],
            Self::Sqlite => &["5", "6"],
        }
    }
}

/// A driver error normalized to what classification needs: which dialect
/// family raised it, the error code if the driver reported one, and the
/// message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFault {
    pub family: DialectFamily,
    /// Driver error code or SQLSTATE, when reported.
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for DriverFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{} {}] {}", self.family, code, self.message),
            None => write!(f, "[{}] {}", self.family, self.message),
        }
    }
}

impl DriverFault {
    /// Create a fault with an explicit code.
    pub fn new(
        family: impl Into<DialectFamily>,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            family: family.into(),
            code,
            message: message.into(),
        }
    }

    /// Normalize an sqlx error raised while talking to `dialect`.
    pub fn from_sqlx(dialect: Dialect, err: &sqlx::Error) -> Self {
        let family = DialectFamily::from(dialect);
        match err {
            sqlx::Error::Database(db_err) => Self {
                family,
                code: db_err.code().map(|c| c.into_owned()),
                message: db_err.message().to_string(),
            },
            other => Self {
                family,
                code: None,
                message: other.to_string(),
            },
        }
    }
}

/// Message substrings that indicate contention regardless of dialect.
const CONTENTION_PHRASES: &[&str] = &[
    "deadlock",
    "lock timeout",
    "serialization failure",
    "database is locked",
];

/// Decide whether a driver fault is transient contention (deadlock,
/// lock-wait timeout, serialization failure).
///
/// The code check is scoped to the fault's own dialect family, so a SQLite
/// busy code never matches while classifying a PostgreSQL fault. When no
/// code matched, falls back to a case-insensitive substring search of the
/// message for the shared contention phrases and the family's own codes.
/// Total: no input makes this panic, and no match means `false`.
pub fn is_contention_error(fault: &DriverFault) -> bool {
    let codes = fault.family.contention_codes();

    if let Some(code) = &fault.code {
        // SQLite extended result codes embed the primary code in the low byte
        // (e.g. 517 SQLITE_BUSY_SNAPSHOT -> 5).
        if fault.family == DialectFamily::Sqlite {
            if let Ok(n) = code.parse::<u32>() {
                if n & 0xff == 5 || n & 0xff == 6 {
                    return true;
                }
            }
        }
        if codes.iter().any(|c| code == c) {
            return true;
        }
    }

    let message = fault.message.to_lowercase();
    if CONTENTION_PHRASES.iter().any(|p| message.contains(p)) {
        return true;
    }
    // Single-digit SQLite codes would match almost any message; those faults
    // are covered by the "database is locked" phrase instead.
    codes
        .iter()
        .filter(|c| c.len() > 1)
        .any(|c| message.contains(&c.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(family: DialectFamily, code: Option<&str>, message: &str) -> DriverFault {
        DriverFault {
            family,
            code: code.map(String::from),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_postgres_contention_codes() {
        for code in ["40001", "40P01"] {
            assert!(is_contention_error(&fault(
                DialectFamily::Postgres,
                Some(code),
                "aborted"
            )));
        }
    }

    #[test]
    fn test_mysql_contention_codes() {
        for code in ["1205", "1213"] {
            assert!(is_contention_error(&fault(
                DialectFamily::MySql,
                Some(code),
                "aborted"
            )));
        }
    }

    #[test]
    fn test_sqlserver_contention_codes() {
        for code in ["1205", "1222"] {
            assert!(is_contention_error(&fault(
                DialectFamily::SqlServer,
                Some(code),
                "aborted"
            )));
        }
    }

    #[test]
    fn test_sqlite_contention_codes() {
        for code in ["5", "6"] {
            assert!(is_contention_error(&fault(
                DialectFamily::Sqlite,
                Some(code),
                "aborted"
            )));
        }
    }

    #[test]
    fn test_sqlite_extended_busy_code() {
        // 517 = SQLITE_BUSY_SNAPSHOT
        assert!(is_contention_error(&fault(
            DialectFamily::Sqlite,
            Some("517"),
            "snapshot"
        )));
    }

    #[test]
    fn test_codes_scoped_to_family() {
        // SQLite busy code must not classify a PostgreSQL fault.
        assert!(!is_contention_error(&fault(
            DialectFamily::Postgres,
            Some("5"),
            "some unrelated failure"
        )));
        // PostgreSQL serialization code means nothing to MySQL.
        assert!(!is_contention_error(&fault(
            DialectFamily::MySql,
            Some("40001"),
            "some unrelated failure"
        )));
    }

    #[test]
    fn test_message_fallback_phrases() {
        assert!(is_contention_error(&fault(
            DialectFamily::Postgres,
            None,
            "ERROR: Deadlock detected while waiting for lock"
        )));
        assert!(is_contention_error(&fault(
            DialectFamily::MySql,
            None,
            "Lock Timeout exceeded; try restarting transaction"
        )));
        assert!(is_contention_error(&fault(
            DialectFamily::Postgres,
            None,
            "could not serialize access: serialization failure"
        )));
        assert!(is_contention_error(&fault(
            DialectFamily::Sqlite,
            None,
            "database is locked"
        )));
    }

    #[test]
    fn test_message_fallback_family_codes() {
        assert!(is_contention_error(&fault(
            DialectFamily::Postgres,
            None,
            "aborted with SQLSTATE 40001"
        )));
    }

    #[test]
    fn test_unrelated_errors_do_not_match() {
        assert!(!is_contention_error(&fault(
            DialectFamily::Postgres,
            Some("42P01"),
            "relation \"users\" does not exist"
        )));
        assert!(!is_contention_error(&fault(
            DialectFamily::MySql,
            Some("1064"),
            "You have an error in your SQL syntax"
        )));
        assert!(!is_contention_error(&fault(
            DialectFamily::Sqlite,
            None,
            "no such table: users"
        )));
    }

    #[test]
    fn test_classifier_total_on_odd_input() {
        assert!(!is_contention_error(&fault(DialectFamily::Sqlite, None, "")));
        assert!(!is_contention_error(&fault(
            DialectFamily::Sqlite,
            Some("not-a-number"),
            ""
        )));
    }

    #[test]
    fn test_display_includes_family_and_code() {
        let f = fault(DialectFamily::Postgres, Some("40P01"), "deadlock detected");
        let s = f.to_string();
        assert!(s.contains("postgresql"));
        assert!(s.contains("40P01"));
    }
}
