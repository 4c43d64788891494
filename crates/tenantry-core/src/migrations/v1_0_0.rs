//! Migration v1.0.0: Tenant registry.
//!
//! Creates the `tenants` table holding identity, credentials, and provisioning
//! state for every tenant. Uniqueness of routing and contact fields is enforced
//! only among non-deleted rows, so a soft-deleted tenant's subdomain can be
//! reused.

use super::Migration;

/// Version number: 1_000_000 represents v1.0.0
pub const VERSION: i64 = 1_000_000;

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.0.0: Tenant registry",
        sql: SQL,
    }
}

const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    organization_name TEXT NOT NULL,
    subdomain_name TEXT NOT NULL,
    email TEXT NOT NULL,
    contact_number TEXT NOT NULL,
    database_name TEXT NOT NULL,
    database_user TEXT NOT NULL,
    database_password TEXT NOT NULL,
    is_verified BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT FALSE,
    otp TEXT,
    otp_expires_at TIMESTAMPTZ,
    database_created_on TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS tenants_subdomain_live_idx
    ON tenants (subdomain_name) WHERE deleted_at IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS tenants_organization_live_idx
    ON tenants (organization_name) WHERE deleted_at IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS tenants_email_live_idx
    ON tenants (email) WHERE deleted_at IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS tenants_contact_live_idx
    ON tenants (contact_number) WHERE deleted_at IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS tenants_database_name_idx
    ON tenants (database_name) WHERE deleted_at IS NULL;

-- Fleet-wide iteration (delta rollout) scans active tenants
CREATE INDEX IF NOT EXISTS tenants_active_idx
    ON tenants (is_active) WHERE deleted_at IS NULL;
"#;
