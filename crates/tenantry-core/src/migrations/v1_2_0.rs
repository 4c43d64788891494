//! Migration v1.2.0: Provisioning ownership.
//!
//! Database and role names become unique across every row, soft-deleted ones
//! included, so a reused subdomain never maps onto a retired tenant's
//! database. Adds `provisioning_started_at`, the claim a provisioning run
//! takes on a tenant so two processes never build the same database at once.

use super::Migration;

/// Version number: 1_002_000 represents v1.2.0
pub const VERSION: i64 = 1_002_000;

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.2.0: Provisioning ownership",
        sql: SQL,
    }
}

const SQL: &str = r#"
ALTER TABLE tenants ADD COLUMN IF NOT EXISTS provisioning_started_at TIMESTAMPTZ;

DROP INDEX IF EXISTS tenants_database_name_idx;

CREATE UNIQUE INDEX IF NOT EXISTS tenants_database_name_idx
    ON tenants (database_name);

CREATE UNIQUE INDEX IF NOT EXISTS tenants_database_user_idx
    ON tenants (database_user);
"#;
