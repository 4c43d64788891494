//! Tenant signup and OTP verification.
//!
//! Signup creates a pending tenant and issues a one-time code. Confirming the
//! code activates the tenant and hands its database to the provisioning
//! queue. Both calls return as soon as the registry is updated; the database
//! is built in the background.

use crate::provisioning::{ProvisioningJob, ProvisioningQueue};
use crate::registry::TenantRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tenantry_core::secrets::{self, SecretBox};
use tenantry_core::{validation, NewTenant, Result, TenancyError, TenantFilter, TenantPatch, TenantRecord};
use tenantry_storage::{BoxFuture, Subdomain};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sends a verification code to the tenant administrator.
pub trait OtpDelivery: Send + Sync {
    fn deliver<'a>(&'a self, tenant: &'a TenantRecord, otp: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Delivery that only records that a code was issued.
#[derive(Debug, Default)]
pub struct TracingOtpDelivery;

impl OtpDelivery for TracingOtpDelivery {
    fn deliver<'a>(&'a self, tenant: &'a TenantRecord, _otp: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(
                tenant_id = %tenant.id,
                email = %tenant.email,
                expires_at = ?tenant.otp_expires_at,
                "Issued verification code"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub organization_name: String,
    pub subdomain_name: String,
    pub email: String,
    pub contact_number: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub tenant_id: Uuid,
    pub subdomain: String,
    pub otp_expires_at: DateTime<Utc>,
}

pub struct TenantOnboarding {
    registry: TenantRegistry,
    queue: Arc<ProvisioningQueue>,
    secrets: SecretBox,
    delivery: Arc<dyn OtpDelivery>,
    otp_ttl: Duration,
    database_prefix: String,
}

impl TenantOnboarding {
    pub fn new(
        registry: TenantRegistry,
        queue: Arc<ProvisioningQueue>,
        secrets: SecretBox,
        delivery: Arc<dyn OtpDelivery>,
        otp_ttl: Duration,
        database_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            queue,
            secrets,
            delivery,
            otp_ttl,
            database_prefix: database_prefix.into(),
        }
    }

    /// Create a pending tenant and send its verification code.
    ///
    /// # Errors
    ///
    /// - `ValidationError` for malformed input
    /// - `ConflictError` if the subdomain, organization, email, or contact
    ///   number belongs to another live tenant
    pub async fn register(&self, request: SignupRequest) -> Result<Registration> {
        let subdomain = Subdomain::new(request.subdomain_name.trim().to_ascii_lowercase())?;
        let database_name = self.allocate_database_name(&subdomain).await?;

        let password = secrets::generate_password();
        let otp = secrets::generate_otp();
        let otp_expires_at = Utc::now() + chrono::Duration::seconds(self.otp_ttl.as_secs() as i64);

        let tenant = self
            .registry
            .create(NewTenant {
                organization_name: request.organization_name.trim().to_string(),
                subdomain_name: subdomain.into_string(),
                email: request.email.trim().to_ascii_lowercase(),
                contact_number: request.contact_number.trim().to_string(),
                database_user: database_name.clone(),
                database_name,
                database_password: self.secrets.encrypt(&password)?,
                otp: Some(otp.clone()),
                otp_expires_at: Some(otp_expires_at),
            })
            .await?;

        self.delivery.deliver(&tenant, &otp).await?;

        Ok(Registration {
            tenant_id: tenant.id,
            subdomain: tenant.subdomain_name,
            otp_expires_at,
        })
    }

    /// Database (and role) name for a new tenant.
    ///
    /// Normally derived from the subdomain alone. Names are never reused, so
    /// when a soft-deleted tenant already holds it a random suffix is added.
    async fn allocate_database_name(&self, subdomain: &Subdomain) -> Result<String> {
        let base = validation::database_identifier(&self.database_prefix, subdomain.as_str())?;
        if self.registry.database_identifier_owners(&base).await?.is_empty() {
            return Ok(base);
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let name = validation::suffixed_identifier(&base, &suffix[..8])?;
        info!(
            subdomain = %subdomain,
            database = %name,
            "Database name already used by a previous tenant, using suffixed name"
        );
        Ok(name)
    }

    /// Confirm a verification code and queue the tenant's database.
    ///
    /// A full provisioning queue does not fail verification: the tenant is
    /// activated regardless and left for [`TenantOnboarding::reprovision`].
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown subdomain
    /// - `AuthError` for a wrong or expired code
    /// - `ConflictError` if the tenant is already verified
    pub async fn verify(&self, subdomain: &str, otp: &str) -> Result<TenantRecord> {
        let tenant = self.registry.get_by_subdomain(subdomain).await?;

        if tenant.is_verified {
            return Err(TenancyError::ConflictError(format!(
                "Tenant '{}' is already verified",
                subdomain
            )));
        }

        match tenant.otp.as_deref() {
            Some(expected) if secrets::constant_time_eq(expected, otp.trim()) => {}
            _ => {
                warn!(tenant_id = %tenant.id, "Rejected verification code");
                return Err(TenancyError::AuthError("Invalid verification code".into()));
            }
        }
        if tenant.otp_expires_at.is_some_and(|at| at < Utc::now()) {
            return Err(TenancyError::AuthError("Verification code has expired".into()));
        }

        self.registry
            .update(&TenantFilter::by_id(tenant.id), &TenantPatch::verified())
            .await?;
        let tenant = self.registry.get(tenant.id).await?;
        info!(tenant_id = %tenant.id, subdomain = %tenant.subdomain_name, "Tenant verified");

        let job = ProvisioningJob::from_record(&tenant, &self.secrets)?;
        if let Err(e) = self.queue.enqueue(job) {
            error!(
                tenant_id = %tenant.id,
                error = %e,
                "Could not queue provisioning; tenant needs manual re-provisioning"
            );
        }

        Ok(tenant)
    }

    /// Queue a new provisioning attempt for a verified, unprovisioned tenant.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the tenant does not exist
    /// - `ValidationError` if it has not been verified
    /// - `ConflictError` if it is already provisioned or a job is in flight
    /// - `QueueFull` if the queue is at capacity
    pub async fn reprovision(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.registry.get(tenant_id).await?;

        if !tenant.is_verified {
            return Err(TenancyError::ValidationError(format!(
                "Tenant {} has not been verified",
                tenant_id
            )));
        }
        if tenant.is_provisioned() {
            return Err(TenancyError::ConflictError(format!(
                "Tenant {} is already provisioned",
                tenant_id
            )));
        }

        let job = ProvisioningJob::from_record(&tenant, &self.secrets)?;
        self.queue.enqueue(job)?;
        info!(tenant_id = %tenant_id, "Re-provisioning queued");
        Ok(())
    }
}
