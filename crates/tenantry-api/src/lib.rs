//! Tenantry API Library
//!
//! The tenancy core on top of `tenantry-storage`: the tenant registry, the
//! resolver that binds a request to its tenant's database, signup and OTP
//! onboarding, the background provisioning queue, and the fleet-wide delta
//! migration runner, plus the thin HTTP surface the server binary exposes.

use std::sync::Arc;
use tenantry_storage::TenantPoolCache;

pub mod bootstrap;
pub mod config;
pub mod delta;
pub mod health;
pub mod http;
pub mod onboarding;
pub mod provisioning;
pub mod rate_limiting;
pub mod registry;
pub mod resolver;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use bootstrap::Services;
pub use config::{AppConfig, QueueConfig};
pub use delta::{DeltaMigrationRunner, DeltaReport};
pub use onboarding::{OtpDelivery, SignupRequest, TenantOnboarding, TracingOtpDelivery};
pub use provisioning::{
    JobState, ProvisioningJob, ProvisioningOutcome, ProvisioningQueue, ProvisioningStep,
    Provisioner,
};
pub use registry::{PgTenantStore, RegistryCredentials, TenantRegistry, TenantStore};
pub use resolver::{TenantResolver, TokenVerifier};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: TenantRegistry,
    pub pools: Arc<TenantPoolCache>,
    pub resolver: Arc<TenantResolver>,
    pub onboarding: Arc<TenantOnboarding>,
    pub queue: Arc<ProvisioningQueue>,
    pub delta: Arc<DeltaMigrationRunner>,
    /// Operator token for admin routes; `None` disables them
    pub admin_token: Option<Arc<str>>,
}
