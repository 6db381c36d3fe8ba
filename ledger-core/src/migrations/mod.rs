//! Database migrations - embedded SQL files
//!
//! Migrations are compiled into the binary with include_str! and applied in
//! order by [`crate::services::MigrationService`].

/// Ledger database migrations, in application order.
/// Format: (filename, sql_content)
///
/// New migrations get the next NNN_ prefix and are appended here.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("000_migrations.sql", include_str!("000_migrations.sql")),
    ("001_accounts.sql", include_str!("001_accounts.sql")),
    ("002_ledger_entries.sql", include_str!("002_ledger_entries.sql")),
];
