//! Schema migration framework for the tenantry control plane.
//!
//! This module provides a versioned, idempotent migration system for evolving
//! the control-plane Postgres schema (the tenant registry). Migrations are
//! forward-only and tracked in a dedicated `schema_migrations` table.
//!
//! Tenant databases are not migrated here; they receive idempotent delta
//! scripts from the [`crate::scripts`] catalog instead.
//!
//! # Design Principles
//!
//! 1. **Idempotent**: All migrations use `IF NOT EXISTS` / `IF EXISTS` clauses
//! 2. **Versioned**: Each migration has a unique version number
//! 3. **Forward-only**: No rollback support
//! 4. **Atomic**: Each migration runs in a transaction
//! 5. **Exclusive**: A session-level `pg_advisory_lock` serialises runners
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantry_core::migrations::run_migrations;
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/tenantry_control").await?;
//! run_migrations(&pool).await?;
//! ```
//!
//! Migrations should be run by a single actor (the `tenantry migrate` CLI
//! command or an init step), not by every API instance on startup.

use crate::{Result, TenancyError};
use sqlx::{PgPool, Row};

mod v1_0_0;
mod v1_1_0;
mod v1_2_0;

/// Migration version number.
/// Format: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
pub type MigrationVersion = i64;

/// Key for `pg_advisory_lock`, shared by every tenantry process.
pub const MIGRATION_LOCK_KEY: i64 = 0x7465_6e61_6e74;

/// A schema migration.
pub struct Migration {
    /// Version number (must be unique and monotonically increasing)
    pub version: MigrationVersion,
    /// Human-readable description
    pub description: &'static str,
    /// SQL to execute (should be idempotent)
    pub sql: &'static str,
}

/// All available migrations in order.
/// Add new migrations to the end of this array.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        v1_0_0::migration(),
        v1_1_0::migration(),
        v1_2_0::migration(),
    ]
}

/// Latest version known to this build.
pub fn latest_version() -> MigrationVersion {
    all_migrations().last().map(|m| m.version).unwrap_or(0)
}

/// Initialize the migrations tracking table.
async fn init_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Get the current schema version (highest applied migration).
pub async fn get_schema_version(pool: &PgPool) -> Result<MigrationVersion> {
    init_migrations_table(pool).await?;

    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Check if a specific migration has been applied.
pub async fn is_migration_applied(pool: &PgPool, version: MigrationVersion) -> Result<bool> {
    init_migrations_table(pool).await?;

    let applied: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE version = $1)")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(applied)
}

/// Run all pending migrations.
///
/// This function is idempotent - it will only apply migrations that haven't
/// been applied yet. Each migration runs in its own transaction.
///
/// # Concurrency
///
/// Holds a session-level advisory lock for the duration of the run. A second
/// runner blocks until the first finishes and then finds nothing to apply.
/// The lock is released when the session ends, so a crashed runner cannot
/// leave it held.
///
/// # Returns
///
/// The number of migrations applied.
pub async fn run_migrations(pool: &PgPool) -> Result<usize> {
    init_migrations_table(pool).await?;

    let mut lock_conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *lock_conn)
        .await?;

    let result = run_migrations_inner(pool).await;

    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *lock_conn)
        .await
    {
        tracing::warn!("Failed to release migration lock: {}", e);
    }

    result
}

/// Internal migration runner (called while holding lock).
async fn run_migrations_inner(pool: &PgPool) -> Result<usize> {
    let mut applied_count = 0;

    for migration in all_migrations() {
        if is_migration_applied(pool, migration.version).await? {
            tracing::debug!(
                version = migration.version,
                description = migration.description,
                "Migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );

        let mut tx = pool.begin().await?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                TenancyError::Other(format!("Migration {} failed: {}", migration.version, e))
            })?;

        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(version = migration.version, "Migration applied successfully");
        applied_count += 1;
    }

    Ok(applied_count)
}

/// Get list of applied migrations with their timestamps.
pub async fn get_migration_history(
    pool: &PgPool,
) -> Result<Vec<(MigrationVersion, String, chrono::DateTime<chrono::Utc>)>> {
    init_migrations_table(pool).await?;

    let rows = sqlx::query(
        "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("version")?,
                row.try_get("description")?,
                row.try_get("applied_at")?,
            ))
        })
        .collect()
}

/// Check if the schema needs migration.
pub async fn needs_migration(pool: &PgPool) -> Result<bool> {
    let current = get_schema_version(pool).await?;
    Ok(current < latest_version())
}
