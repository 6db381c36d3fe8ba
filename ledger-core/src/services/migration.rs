//! Migration service - manages database schema migrations
//!
//! Migrations are SQL files embedded at compile time. Each applied migration
//! is recorded in sys_migrations so that running them again is a no-op.

use anyhow::{Context, Result};
use duckdb::Connection;
use tracing::debug;

use crate::migrations::MIGRATIONS;

/// Name of the migration that creates sys_migrations itself
const BOOTSTRAP: &str = "000_migrations.sql";

/// Result of running migrations
#[derive(Debug)]
pub struct MigrationResult {
    /// Names of newly applied migrations
    pub applied: Vec<String>,
    /// Count of migrations that were already applied
    pub already_applied: usize,
}

/// Applies a fixed, ordered set of migrations to one connection
pub struct MigrationService<'a> {
    conn: &'a Connection,
    migrations: &'static [(&'static str, &'static str)],
}

impl<'a> MigrationService<'a> {
    /// Migration service for the ledger database
    pub fn new(conn: &'a Connection) -> Self {
        Self::with_migrations(conn, MIGRATIONS)
    }

    /// Migration service for another database (e.g. the event log)
    pub fn with_migrations(
        conn: &'a Connection,
        migrations: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self { conn, migrations }
    }

    /// Run all pending migrations in order
    pub fn run_pending(&self) -> Result<MigrationResult> {
        let mut newly_applied = Vec::new();

        if !self.migrations_table_exists()? {
            if let Some((name, sql)) = self.migrations.iter().find(|(n, _)| *n == BOOTSTRAP) {
                self.apply(name, sql)?;
                newly_applied.push(name.to_string());
            }
        }

        let applied = self.get_applied()?;
        let already_applied = applied.len() - newly_applied.len();

        for (name, sql) in self.migrations.iter() {
            if applied.iter().any(|a| a == name) {
                continue;
            }
            self.apply(name, sql)?;
            newly_applied.push(name.to_string());
        }

        Ok(MigrationResult {
            applied: newly_applied,
            already_applied,
        })
    }

    fn apply(&self, name: &str, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .with_context(|| format!("Migration {} failed", name))?;
        self.conn
            .execute("INSERT INTO sys_migrations (migration_name) VALUES (?)", [name])?;
        debug!(migration = name, "applied migration");
        Ok(())
    }

    fn migrations_table_exists(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'sys_migrations'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Names of already applied migrations
    pub fn get_applied(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT migration_name FROM sys_migrations ORDER BY migration_name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Names of migrations not applied yet
    pub fn get_pending(&self) -> Result<Vec<String>> {
        let applied = self.get_applied()?;
        Ok(self
            .migrations
            .iter()
            .filter(|(name, _)| !applied.iter().any(|a| a == name))
            .map(|(name, _)| name.to_string())
            .collect())
    }
}
