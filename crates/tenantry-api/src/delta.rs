//! Delta Migration Runner
//!
//! Applies one idempotent SQL script to every matching tenant database, one
//! tenant at a time. A tenant's failure is recorded and the rollout moves on;
//! nothing is wrapped in a cross-tenant transaction and nothing is rolled
//! back. The resulting [`DeltaReport`] lists exactly which tenants failed so
//! the rollout can be re-run for them.
//!
//! ```rust,ignore
//! let runner = DeltaMigrationRunner::new(registry, pools);
//! let report = runner.apply(&script, &TenantFilter::active()).await?;
//! for failure in &report.failed {
//!     eprintln!("{}: {}", failure.subdomain, failure.error);
//! }
//! ```

use crate::registry::TenantRegistry;
use serde::Serialize;
use std::sync::Arc;
use tenantry_core::{DeltaScript, Result, TenancyError, TenantFilter, TenantRecord};
use tenantry_storage::{DatabasePool, TenantPoolCache};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A tenant named in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRef {
    pub tenant_id: Uuid,
    pub subdomain: String,
}

impl From<&TenantRecord> for TenantRef {
    fn from(tenant: &TenantRecord) -> Self {
        Self {
            tenant_id: tenant.id,
            subdomain: tenant.subdomain_name.clone(),
        }
    }
}

/// One tenant the script could not be applied to.
#[derive(Debug, Clone, Serialize)]
pub struct TenantFailure {
    pub tenant_id: Uuid,
    pub subdomain: String,
    pub error: String,
}

/// Per-tenant result of a fleet-wide rollout.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeltaReport {
    pub script: String,
    pub succeeded: Vec<TenantRef>,
    pub failed: Vec<TenantFailure>,
    /// Matching tenants without a provisioned database
    pub skipped: Vec<TenantRef>,
}

impl DeltaReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of tenants the filter matched.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// Ids to retry with.
    pub fn failed_tenant_ids(&self) -> Vec<Uuid> {
        self.failed.iter().map(|f| f.tenant_id).collect()
    }
}

pub struct DeltaMigrationRunner {
    registry: TenantRegistry,
    pools: Arc<TenantPoolCache>,
}

impl DeltaMigrationRunner {
    pub fn new(registry: TenantRegistry, pools: Arc<TenantPoolCache>) -> Self {
        Self { registry, pools }
    }

    /// Apply `script` to every tenant matching `filter`, in registry order.
    ///
    /// Only the registry lookup can fail the call as a whole; per-tenant
    /// errors land in the report.
    pub async fn apply(&self, script: &DeltaScript, filter: &TenantFilter) -> Result<DeltaReport> {
        let tenants = self.registry.find(filter).await?;
        info!(script = %script.name, tenants = tenants.len(), "Applying delta script");

        let mut report = DeltaReport {
            script: script.name.clone(),
            ..DeltaReport::default()
        };

        for tenant in &tenants {
            if !tenant.is_provisioned() {
                debug!(tenant_id = %tenant.id, script = %script.name, "Skipping unprovisioned tenant");
                report.skipped.push(TenantRef::from(tenant));
                continue;
            }

            match self.apply_one(script, tenant).await {
                Ok(()) => {
                    debug!(tenant_id = %tenant.id, script = %script.name, "Delta script applied");
                    report.succeeded.push(TenantRef::from(tenant));
                }
                Err(e) => {
                    warn!(
                        tenant_id = %tenant.id,
                        subdomain = %tenant.subdomain_name,
                        script = %script.name,
                        error = %e,
                        "Delta script failed for tenant"
                    );
                    report.failed.push(TenantFailure {
                        tenant_id: tenant.id,
                        subdomain: tenant.subdomain_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            script = %script.name,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Delta rollout finished"
        );
        Ok(report)
    }

    async fn apply_one(&self, script: &DeltaScript, tenant: &TenantRecord) -> Result<()> {
        let pool = self.pools.get_or_create(tenant.id).await?;
        pool.execute(&script.sql)
            .await
            .map_err(|e| TenancyError::DeltaScriptError {
                tenant_id: tenant.id.to_string(),
                script: script.name.clone(),
                message: e.to_string(),
            })
    }
}
