//! Opaque schema objects for DDL delegation.
//!
//! The engine never inspects a schema; it hands it a live session and the
//! schema issues its own DDL. ORM layers implement [`Schema`] on their
//! metadata object; [`SqlSchema`] covers the plain statement-list case.

use crate::error::Result;
use crate::session::Session;
use async_trait::async_trait;

/// A schema that can create and drop its objects over a session.
#[async_trait]
pub trait Schema: Send + Sync {
    async fn create_all(&self, session: &mut Session) -> Result<()>;
    async fn drop_all(&self, session: &mut Session) -> Result<()>;
}

/// Statement-list schema: ordered CREATE statements and their matching
/// DROP statements.
#[derive(Debug, Clone, Default)]
pub struct SqlSchema {
    create_statements: Vec<String>,
    drop_statements: Vec<String>,
}

impl SqlSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table (or any object) by its create/drop statement pair.
    /// Drops run in reverse registration order.
    pub fn object(mut self, create: impl Into<String>, drop: impl Into<String>) -> Self {
        self.create_statements.push(create.into());
        self.drop_statements.push(drop.into());
        self
    }
}

#[async_trait]
impl Schema for SqlSchema {
    async fn create_all(&self, session: &mut Session) -> Result<()> {
        for sql in &self.create_statements {
            session.execute(sql, &[]).await?;
        }
        Ok(())
    }

    async fn drop_all(&self, session: &mut Session) -> Result<()> {
        for sql in self.drop_statements.iter().rev() {
            session.execute(sql, &[]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_registration_order() {
        let schema = SqlSchema::new()
            .object("CREATE TABLE a (id INTEGER)", "DROP TABLE a")
            .object("CREATE TABLE b (id INTEGER)", "DROP TABLE b");
        assert_eq!(schema.create_statements.len(), 2);
        assert_eq!(schema.drop_statements.len(), 2);
        assert!(schema.create_statements[0].contains("TABLE a"));
        // drop_all iterates in reverse, so the last registered drops first
        assert!(schema.drop_statements.last().unwrap().contains("TABLE b"));
    }
}
