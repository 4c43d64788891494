//! Migration v1.1.0: Provisioning diagnostics.
//!
//! Adds `provisioning_error`, the message from the most recent rolled-back
//! provisioning attempt, so operators can find tenants needing re-provisioning
//! without trawling logs.

use super::Migration;

/// Version number: 1_001_000 represents v1.1.0
pub const VERSION: i64 = 1_001_000;

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.1.0: Provisioning diagnostics",
        sql: SQL,
    }
}

const SQL: &str = r#"
ALTER TABLE tenants ADD COLUMN IF NOT EXISTS provisioning_error TEXT;

-- Operators query for verified tenants without a database
CREATE INDEX IF NOT EXISTS tenants_unprovisioned_idx
    ON tenants (created_at) WHERE database_created_on IS NULL AND deleted_at IS NULL;
"#;
