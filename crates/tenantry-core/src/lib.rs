//! Tenantry Core
//!
//! Core types, error taxonomy, and control-plane schema for tenantry, a
//! database-per-tenant backend core.
//!
//! This crate has no runtime of its own. It defines:
//! - [`TenantRecord`] and the request types used to create, filter, and patch it
//! - [`TenancyError`], the error type shared by every tenantry crate
//! - input [`validation`] for subdomains and Postgres identifiers
//! - [`secrets`] for at-rest encryption of generated database passwords
//! - [`scripts`], the catalog of idempotent schema/function scripts
//! - control-plane schema [`migrations`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod migrations;
pub mod scripts;
pub mod secrets;
pub mod validation;

pub use scripts::{DeltaScript, ScriptCatalog};

// ============================================================================
// Tenant Registry Types
// ============================================================================

/// Identity and provisioning state for one tenant, as stored in the control plane.
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantRecord {
    /// Stable tenant identifier
    pub id: Uuid,
    /// Display name of the customer organization
    pub organization_name: String,
    /// Routing key, unique among non-deleted tenants
    pub subdomain_name: String,
    /// Contact email of the tenant administrator
    pub email: String,
    /// Contact phone number of the tenant administrator
    pub contact_number: String,
    /// Name of the tenant's dedicated database
    pub database_name: String,
    /// Role owning the tenant's dedicated database
    pub database_user: String,
    /// Role password, encrypted with [`secrets::SecretBox`]
    #[serde(skip_serializing)]
    pub database_password: String,
    pub is_verified: bool,
    pub is_active: bool,
    /// One-time activation code, cleared after verification
    #[serde(skip_serializing)]
    pub otp: Option<String>,
    pub otp_expires_at: Option<DateTime<Utc>>,
    /// Set only once provisioning has fully succeeded
    pub database_created_on: Option<DateTime<Utc>>,
    /// Error from the last rolled-back provisioning attempt
    pub provisioning_error: Option<String>,
    /// Set while a provisioning run holds the tenant, cleared when it finishes
    pub provisioning_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TenantRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRecord")
            .field("id", &self.id)
            .field("organization_name", &self.organization_name)
            .field("subdomain_name", &self.subdomain_name)
            .field("database_name", &self.database_name)
            .field("database_user", &self.database_user)
            .field("is_verified", &self.is_verified)
            .field("is_active", &self.is_active)
            .field("database_created_on", &self.database_created_on)
            .field("deleted_at", &self.deleted_at)
            .finish_non_exhaustive()
    }
}

impl TenantRecord {
    /// Lifecycle state derived from the stored flags.
    pub fn lifecycle(&self) -> TenantLifecycle {
        TenantLifecycle::from_record(self)
    }

    /// Whether the tenant's dedicated database has been fully provisioned.
    pub fn is_provisioned(&self) -> bool {
        self.database_created_on.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the tenant may be routed to (active, verified, not deleted).
    pub fn is_routable(&self) -> bool {
        self.is_active && self.is_verified && !self.is_deleted()
    }
}

/// Lifecycle state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantLifecycle {
    /// Signed up, OTP not yet confirmed
    Pending,
    /// Verified and active, dedicated database not (yet) available
    Provisioning,
    /// Verified, active, and database provisioned
    Ready,
    /// Verified but deactivated
    Suspended,
    /// Soft-deleted
    Deleted,
}

impl TenantLifecycle {
    fn from_record(record: &TenantRecord) -> Self {
        if record.is_deleted() {
            TenantLifecycle::Deleted
        } else if !record.is_verified {
            TenantLifecycle::Pending
        } else if !record.is_active {
            TenantLifecycle::Suspended
        } else if record.is_provisioned() {
            TenantLifecycle::Ready
        } else {
            TenantLifecycle::Provisioning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantLifecycle::Pending => "pending",
            TenantLifecycle::Provisioning => "provisioning",
            TenantLifecycle::Ready => "ready",
            TenantLifecycle::Suspended => "suspended",
            TenantLifecycle::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TenantLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields required to insert a new pending tenant.
#[derive(Clone)]
pub struct NewTenant {
    pub organization_name: String,
    pub subdomain_name: String,
    pub email: String,
    pub contact_number: String,
    pub database_name: String,
    pub database_user: String,
    /// Already encrypted
    pub database_password: String,
    pub otp: Option<String>,
    pub otp_expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for NewTenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewTenant")
            .field("organization_name", &self.organization_name)
            .field("subdomain_name", &self.subdomain_name)
            .field("email", &self.email)
            .field("database_name", &self.database_name)
            .field("database_user", &self.database_user)
            .finish_non_exhaustive()
    }
}

impl NewTenant {
    /// Check that every required field is present.
    ///
    /// Returns `TenancyError::ValidationError` naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("organization_name", &self.organization_name),
            ("subdomain_name", &self.subdomain_name),
            ("email", &self.email),
            ("contact_number", &self.contact_number),
            ("database_name", &self.database_name),
            ("database_user", &self.database_user),
            ("database_password", &self.database_password),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TenancyError::ValidationError(format!(
                    "{} is required",
                    field
                )));
            }
        }

        validation::validate_email(&self.email)?;
        validation::validate_pg_identifier(&self.database_name, "database_name")?;
        validation::validate_pg_identifier(&self.database_user, "database_user")?;
        Ok(())
    }
}

/// Attribute-equality filter over tenant records.
///
/// All set fields are AND-combined. Soft-deleted tenants are excluded unless
/// `include_deleted` is set. An empty filter matches every non-deleted tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantFilter {
    pub id: Option<Uuid>,
    pub subdomain_name: Option<String>,
    pub organization_name: Option<String>,
    pub email: Option<String>,
    pub contact_number: Option<String>,
    pub is_verified: Option<bool>,
    pub is_active: Option<bool>,
    pub database_name: Option<String>,
    pub database_user: Option<String>,
    /// `Some(true)` = database_created_on is set, `Some(false)` = it is null
    pub provisioned: Option<bool>,
    /// Matches tenants with no provisioning claim, or a claim taken before
    /// this instant
    pub provisioning_claim_before: Option<DateTime<Utc>>,
    pub include_deleted: bool,
}

impl TenantFilter {
    /// Filter matching every non-deleted tenant.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter matching active tenants, the default scope for fleet-wide work.
    pub fn active() -> Self {
        Self {
            is_active: Some(true),
            ..Self::default()
        }
    }

    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_subdomain(subdomain: impl Into<String>) -> Self {
        Self {
            subdomain_name: Some(subdomain.into()),
            ..Self::default()
        }
    }

    /// Tenants, deleted or not, whose database has this name.
    pub fn by_database_name(name: impl Into<String>) -> Self {
        Self {
            database_name: Some(name.into()),
            include_deleted: true,
            ..Self::default()
        }
    }

    /// Tenants, deleted or not, whose role has this name.
    pub fn by_database_user(name: impl Into<String>) -> Self {
        Self {
            database_user: Some(name.into()),
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.is_verified = Some(verified);
        self
    }

    pub fn with_provisioned(mut self, provisioned: bool) -> Self {
        self.provisioned = Some(provisioned);
        self
    }

    pub fn with_claim_before(mut self, before: DateTime<Utc>) -> Self {
        self.provisioning_claim_before = Some(before);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &TenantRecord) -> bool {
        if !self.include_deleted && record.is_deleted() {
            return false;
        }
        if self.id.is_some_and(|id| id != record.id) {
            return false;
        }
        if let Some(ref subdomain) = self.subdomain_name {
            if subdomain != &record.subdomain_name {
                return false;
            }
        }
        if let Some(ref name) = self.organization_name {
            if name != &record.organization_name {
                return false;
            }
        }
        if let Some(ref email) = self.email {
            if email != &record.email {
                return false;
            }
        }
        if let Some(ref contact) = self.contact_number {
            if contact != &record.contact_number {
                return false;
            }
        }
        if let Some(ref name) = self.database_name {
            if name != &record.database_name {
                return false;
            }
        }
        if let Some(ref user) = self.database_user {
            if user != &record.database_user {
                return false;
            }
        }
        if self.is_verified.is_some_and(|v| v != record.is_verified) {
            return false;
        }
        if self.is_active.is_some_and(|v| v != record.is_active) {
            return false;
        }
        if self
            .provisioned
            .is_some_and(|p| p != record.is_provisioned())
        {
            return false;
        }
        if let (Some(before), Some(claimed)) =
            (self.provisioning_claim_before, record.provisioning_started_at)
        {
            if claimed >= before {
                return false;
            }
        }
        true
    }
}

/// Partial update of a tenant record.
///
/// `None` leaves a column untouched. For nullable columns the inner `Option`
/// is the new value, so `Some(None)` clears the column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantPatch {
    pub is_verified: Option<bool>,
    pub is_active: Option<bool>,
    pub otp: Option<Option<String>>,
    pub otp_expires_at: Option<Option<DateTime<Utc>>>,
    pub database_created_on: Option<Option<DateTime<Utc>>>,
    pub provisioning_error: Option<Option<String>>,
    pub provisioning_started_at: Option<Option<DateTime<Utc>>>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl TenantPatch {
    /// Patch applied after a successful OTP confirmation.
    pub fn verified() -> Self {
        Self {
            is_verified: Some(true),
            is_active: Some(true),
            otp: Some(None),
            otp_expires_at: Some(None),
            ..Self::default()
        }
    }

    /// Patch taking the provisioning claim on a tenant.
    pub fn provisioning_claimed(at: DateTime<Utc>) -> Self {
        Self {
            provisioning_started_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Patch stamping a successful provisioning run and releasing its claim.
    pub fn provisioned_at(at: DateTime<Utc>) -> Self {
        Self {
            database_created_on: Some(Some(at)),
            provisioning_error: Some(None),
            provisioning_started_at: Some(None),
            ..Self::default()
        }
    }

    /// Patch recording a rolled-back provisioning run and releasing its claim.
    pub fn provisioning_failed(error: impl Into<String>) -> Self {
        Self {
            database_created_on: Some(None),
            provisioning_error: Some(Some(error.into())),
            provisioning_started_at: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the patch to an in-memory record.
    pub fn apply_to(&self, record: &mut TenantRecord) {
        if let Some(v) = self.is_verified {
            record.is_verified = v;
        }
        if let Some(v) = self.is_active {
            record.is_active = v;
        }
        if let Some(ref v) = self.otp {
            record.otp = v.clone();
        }
        if let Some(v) = self.otp_expires_at {
            record.otp_expires_at = v;
        }
        if let Some(v) = self.database_created_on {
            record.database_created_on = v;
        }
        if let Some(ref v) = self.provisioning_error {
            record.provisioning_error = v.clone();
        }
        if let Some(v) = self.provisioning_started_at {
            record.provisioning_started_at = v;
        }
        if let Some(v) = self.deleted_at {
            record.deleted_at = v;
        }
        record.updated_at = Utc::now();
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur in tenantry operations
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict detected: {0}")]
    ConflictError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Tenant not found: {0}")]
    NotFound(String),

    #[error("Tenant database is still being set up: {0}")]
    NotProvisioned(String),

    #[error("Connection error for tenant '{tenant_id}': {message}")]
    ConnectionError { tenant_id: String, message: String },

    #[error("Provisioning failed for tenant '{tenant_id}' at step '{step}': {message}")]
    ProvisioningError {
        tenant_id: String,
        step: String,
        message: String,
    },

    #[error("Delta script '{script}' failed for tenant '{tenant_id}': {message}")]
    DeltaScriptError {
        tenant_id: String,
        script: String,
        message: String,
    },

    #[error("No tenant connection is bound to the current task")]
    NoActiveContext,

    #[error("Provisioning queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl TenancyError {
    /// Build a `ConnectionError` for a tenant.
    pub fn connection(tenant_id: impl fmt::Display, message: impl fmt::Display) -> Self {
        TenancyError::ConnectionError {
            tenant_id: tenant_id.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error is a Postgres unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            TenancyError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

/// Result type for tenantry operations
pub type Result<T> = std::result::Result<T, TenancyError>;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn record(subdomain: &str) -> TenantRecord {
        let now = Utc::now();
        TenantRecord {
            id: Uuid::new_v4(),
            organization_name: format!("{} Inc", subdomain),
            subdomain_name: subdomain.to_string(),
            email: format!("admin@{}.example.com", subdomain),
            contact_number: "+15550100".to_string(),
            database_name: subdomain.replace('-', "_"),
            database_user: subdomain.replace('-', "_"),
            database_password: "encrypted".to_string(),
            is_verified: false,
            is_active: false,
            otp: Some("123456".to_string()),
            otp_expires_at: None,
            database_created_on: None,
            provisioning_error: None,
            provisioning_started_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
