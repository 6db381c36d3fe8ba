//! Event log database migrations - embedded SQL files

/// Migrations for logs.duckdb, in application order.
/// Format: (filename, sql_content)
pub const LOG_MIGRATIONS: &[(&str, &str)] = &[
    ("000_migrations.sql", include_str!("000_migrations.sql")),
    ("001_initial_schema.sql", include_str!("001_initial_schema.sql")),
];
