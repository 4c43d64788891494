//! Tenant Registry
//!
//! Durable store of tenant identity and lifecycle state in the control-plane
//! database. The registry never deletes rows physically; removal is a
//! `deleted_at` stamp.
//!
//! # Architecture
//!
//! ```text
//! Control Plane DB                      Per-Tenant Databases
//! ┌──────────────────────┐             ┌──────────────────┐
//! │ tenants              │────────────▶│ acme             │
//! │  database_name/user  │             ├──────────────────┤
//! │  database_password ◀─┼─ SecretBox  │ beta             │
//! │  database_created_on │             └──────────────────┘
//! └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = TenantRegistry::new(Arc::new(PgTenantStore::new(pg_pool)));
//!
//! let tenant = registry.create(new_tenant).await?;
//! let active = registry.find(&TenantFilter::active()).await?;
//! registry.update(&TenantFilter::by_id(tenant.id), &TenantPatch::verified()).await?;
//! ```

use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tenantry_core::secrets::SecretBox;
use tenantry_core::{NewTenant, Result, TenancyError, TenantFilter, TenantPatch, TenantRecord};
use tenantry_storage::{BoxFuture, CredentialProvider, TenantCredentials};
use tracing::{debug, info};
use uuid::Uuid;

/// Storage seam behind the registry.
///
/// [`PgTenantStore`] is the production implementation; tests use an
/// in-memory store.
pub trait TenantStore: Send + Sync {
    /// Insert a pending tenant.
    ///
    /// Fails with `ConflictError` if organization, email, contact number, or
    /// subdomain is taken by a non-deleted tenant, or if the database or role
    /// name was ever used by any tenant.
    fn create(&self, tenant: NewTenant) -> BoxFuture<'_, Result<TenantRecord>>;

    /// Tenants matching the filter, oldest first.
    fn find<'a>(&'a self, filter: &'a TenantFilter) -> BoxFuture<'a, Result<Vec<TenantRecord>>>;

    /// Apply `patch` to every tenant matching `filter`; true if any row changed.
    fn update<'a>(
        &'a self,
        filter: &'a TenantFilter,
        patch: &'a TenantPatch,
    ) -> BoxFuture<'a, Result<bool>>;
}

/// Cloneable handle to the tenant registry.
#[derive(Clone)]
pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self { store }
    }

    /// Insert a new pending tenant.
    ///
    /// # Errors
    ///
    /// - `ValidationError` if a required field is missing or malformed
    /// - `ConflictError` on a duplicate among non-deleted tenants
    pub async fn create(&self, tenant: NewTenant) -> Result<TenantRecord> {
        tenant.validate()?;
        let record = self.store.create(tenant).await?;
        info!(
            tenant_id = %record.id,
            subdomain = %record.subdomain_name,
            "Created pending tenant"
        );
        Ok(record)
    }

    pub async fn find(&self, filter: &TenantFilter) -> Result<Vec<TenantRecord>> {
        self.store.find(filter).await
    }

    pub async fn update(&self, filter: &TenantFilter, patch: &TenantPatch) -> Result<bool> {
        if patch.is_empty() {
            return Err(TenancyError::ValidationError("No fields to update".into()));
        }
        let updated = self.store.update(filter, patch).await?;
        debug!(filter = ?filter, updated, "Updated tenants");
        Ok(updated)
    }

    /// First tenant matching the filter.
    pub async fn find_one(&self, filter: &TenantFilter) -> Result<Option<TenantRecord>> {
        Ok(self.store.find(filter).await?.into_iter().next())
    }

    /// Non-deleted tenant by id.
    pub async fn get(&self, tenant_id: Uuid) -> Result<TenantRecord> {
        self.find_one(&TenantFilter::by_id(tenant_id))
            .await?
            .ok_or_else(|| TenancyError::NotFound(tenant_id.to_string()))
    }

    /// Non-deleted tenant by subdomain, regardless of activation.
    pub async fn get_by_subdomain(&self, subdomain: &str) -> Result<TenantRecord> {
        self.find_one(&TenantFilter::by_subdomain(subdomain))
            .await?
            .ok_or_else(|| TenancyError::NotFound(subdomain.to_string()))
    }

    /// Take the provisioning claim on a verified, unprovisioned tenant.
    ///
    /// Succeeds only if no claim is held or the held one is older than
    /// `stale_after`, so at most one run across every process builds a
    /// tenant's database at a time. The claim is released by the
    /// `provisioned_at` and `provisioning_failed` patches.
    pub async fn claim_provisioning(
        &self,
        tenant_id: Uuid,
        stale_after: chrono::Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let filter = TenantFilter::by_id(tenant_id)
            .with_verified(true)
            .with_provisioned(false)
            .with_claim_before(now - stale_after);
        let claimed = self
            .store
            .update(&filter, &TenantPatch::provisioning_claimed(now))
            .await?;
        debug!(tenant_id = %tenant_id, claimed, "Provisioning claim");
        Ok(claimed)
    }

    /// Ids of every tenant, deleted or not, whose database or role is named
    /// `name`.
    pub async fn database_identifier_owners(&self, name: &str) -> Result<Vec<Uuid>> {
        let mut owners: Vec<Uuid> = self
            .store
            .find(&TenantFilter::by_database_name(name))
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        for tenant in self.store.find(&TenantFilter::by_database_user(name)).await? {
            if !owners.contains(&tenant.id) {
                owners.push(tenant.id);
            }
        }
        Ok(owners)
    }

    /// Soft-delete a tenant.
    pub async fn soft_delete(&self, tenant_id: Uuid) -> Result<bool> {
        let patch = TenantPatch {
            is_active: Some(false),
            deleted_at: Some(Some(Utc::now())),
            ..TenantPatch::default()
        };
        let deleted = self.update(&TenantFilter::by_id(tenant_id), &patch).await?;
        if deleted {
            info!(tenant_id = %tenant_id, "Soft-deleted tenant");
        }
        Ok(deleted)
    }
}

// ============================================================================
// Credential lookup for the pool cache
// ============================================================================

/// Resolves tenant database credentials from the registry, decrypting the
/// stored password.
pub struct RegistryCredentials {
    registry: TenantRegistry,
    secrets: SecretBox,
}

impl RegistryCredentials {
    pub fn new(registry: TenantRegistry, secrets: SecretBox) -> Self {
        Self { registry, secrets }
    }
}

impl CredentialProvider for RegistryCredentials {
    fn credentials(&self, tenant_id: Uuid) -> BoxFuture<'_, Result<TenantCredentials>> {
        Box::pin(async move {
            let tenant = self.registry.get(tenant_id).await?;
            let database_password = self.secrets.decrypt(&tenant.database_password)?;
            Ok(TenantCredentials {
                tenant_id,
                database_name: tenant.database_name,
                database_user: tenant.database_user,
                database_password,
            })
        })
    }
}

// ============================================================================
// Postgres store
// ============================================================================

const TENANT_COLUMNS: &str = "id, organization_name, subdomain_name, email, contact_number, \
    database_name, database_user, database_password, is_verified, is_active, otp, \
    otp_expires_at, database_created_on, provisioning_error, provisioning_started_at, created_at, \
    updated_at, deleted_at";

/// Tenant registry backed by the control-plane `tenants` table.
#[derive(Debug, Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Map a unique violation to `ConflictError` naming the taken field.
    fn map_insert_error(err: sqlx::Error, tenant: &NewTenant) -> TenancyError {
        if let sqlx::Error::Database(ref db) = err {
            if db.code().as_deref() == Some("23505") {
                let field = match db.constraint() {
                    Some("tenants_subdomain_live_idx") => {
                        format!("subdomain '{}'", tenant.subdomain_name)
                    }
                    Some("tenants_organization_live_idx") => {
                        format!("organization '{}'", tenant.organization_name)
                    }
                    Some("tenants_email_live_idx") => format!("email '{}'", tenant.email),
                    Some("tenants_contact_live_idx") => {
                        format!("contact number '{}'", tenant.contact_number)
                    }
                    Some("tenants_database_name_idx") => {
                        format!("database '{}'", tenant.database_name)
                    }
                    Some("tenants_database_user_idx") => {
                        format!("role '{}'", tenant.database_user)
                    }
                    _ => "tenant".to_string(),
                };
                return TenancyError::ConflictError(format!("{} already exists", field));
            }
        }
        TenancyError::Database(err)
    }
}

/// Append `filter` as AND-combined equality predicates.
fn push_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a TenantFilter) {
    qb.push(" WHERE TRUE");
    if !filter.include_deleted {
        qb.push(" AND deleted_at IS NULL");
    }
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(ref subdomain) = filter.subdomain_name {
        qb.push(" AND subdomain_name = ").push_bind(subdomain.as_str());
    }
    if let Some(ref name) = filter.organization_name {
        qb.push(" AND organization_name = ").push_bind(name.as_str());
    }
    if let Some(ref email) = filter.email {
        qb.push(" AND email = ").push_bind(email.as_str());
    }
    if let Some(ref contact) = filter.contact_number {
        qb.push(" AND contact_number = ").push_bind(contact.as_str());
    }
    if let Some(ref name) = filter.database_name {
        qb.push(" AND database_name = ").push_bind(name.as_str());
    }
    if let Some(ref user) = filter.database_user {
        qb.push(" AND database_user = ").push_bind(user.as_str());
    }
    if let Some(verified) = filter.is_verified {
        qb.push(" AND is_verified = ").push_bind(verified);
    }
    if let Some(active) = filter.is_active {
        qb.push(" AND is_active = ").push_bind(active);
    }
    match filter.provisioned {
        Some(true) => {
            qb.push(" AND database_created_on IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND database_created_on IS NULL");
        }
        None => {}
    }
    if let Some(before) = filter.provisioning_claim_before {
        qb.push(" AND (provisioning_started_at IS NULL OR provisioning_started_at < ")
            .push_bind(before)
            .push(")");
    }
}

impl TenantStore for PgTenantStore {
    fn create(&self, tenant: NewTenant) -> BoxFuture<'_, Result<TenantRecord>> {
        Box::pin(async move {
            let sql = format!(
                r#"
                INSERT INTO tenants (id, organization_name, subdomain_name, email, contact_number,
                    database_name, database_user, database_password, otp, otp_expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING {}
                "#,
                TENANT_COLUMNS
            );

            sqlx::query_as::<_, TenantRecord>(&sql)
                .bind(Uuid::new_v4())
                .bind(&tenant.organization_name)
                .bind(&tenant.subdomain_name)
                .bind(&tenant.email)
                .bind(&tenant.contact_number)
                .bind(&tenant.database_name)
                .bind(&tenant.database_user)
                .bind(&tenant.database_password)
                .bind(&tenant.otp)
                .bind(tenant.otp_expires_at)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::map_insert_error(e, &tenant))
        })
    }

    fn find<'a>(&'a self, filter: &'a TenantFilter) -> BoxFuture<'a, Result<Vec<TenantRecord>>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::new(format!("SELECT {} FROM tenants", TENANT_COLUMNS));
            push_filter(&mut qb, filter);
            qb.push(" ORDER BY created_at, id");

            let tenants = qb
                .build_query_as::<TenantRecord>()
                .fetch_all(&self.pool)
                .await?;
            Ok(tenants)
        })
    }

    fn update<'a>(
        &'a self,
        filter: &'a TenantFilter,
        patch: &'a TenantPatch,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("UPDATE tenants SET updated_at = now()");

            if let Some(verified) = patch.is_verified {
                qb.push(", is_verified = ").push_bind(verified);
            }
            if let Some(active) = patch.is_active {
                qb.push(", is_active = ").push_bind(active);
            }
            if let Some(ref otp) = patch.otp {
                qb.push(", otp = ").push_bind(otp.as_deref());
            }
            if let Some(expires) = patch.otp_expires_at {
                qb.push(", otp_expires_at = ").push_bind(expires);
            }
            if let Some(created) = patch.database_created_on {
                qb.push(", database_created_on = ").push_bind(created);
            }
            if let Some(ref error) = patch.provisioning_error {
                qb.push(", provisioning_error = ").push_bind(error.as_deref());
            }
            if let Some(started) = patch.provisioning_started_at {
                qb.push(", provisioning_started_at = ").push_bind(started);
            }
            if let Some(deleted) = patch.deleted_at {
                qb.push(", deleted_at = ").push_bind(deleted);
            }

            push_filter(&mut qb, filter);

            let result = qb.build().execute(&self.pool).await?;
            Ok(result.rows_affected() > 0)
        })
    }
}
