//! Wiring shared by the server and the CLI.
//!
//! The registry reads through the control-plane pool and the pool cache reads
//! credentials through the registry, so the control-plane pool is opened
//! first and handed to both.

use crate::config::AppConfig;
use crate::delta::DeltaMigrationRunner;
use crate::onboarding::{OtpDelivery, TenantOnboarding};
use crate::provisioning::{Provisioner, ProvisioningQueue};
use crate::registry::{PgTenantStore, RegistryCredentials, TenantRegistry};
use crate::resolver::{TenantResolver, TokenVerifier};
use crate::AppState;
use std::sync::Arc;
use tenantry_core::secrets::SecretBox;
use tenantry_core::{migrations, Result, ScriptCatalog, TenancyError};
use tenantry_storage::{ConnectionPoolConfig, PgConnector, PoolConnector, TenantPoolCache};
use tracing::info;

/// Control-plane services every entry point needs.
#[derive(Clone)]
pub struct Services {
    pub registry: TenantRegistry,
    pub pools: Arc<TenantPoolCache>,
    pub secrets: SecretBox,
    pub control_plane: sqlx::PgPool,
}

impl Services {
    /// Connect to the control plane and build the registry and pool cache.
    pub async fn connect(config: &AppConfig, pool_config: ConnectionPoolConfig) -> Result<Self> {
        let secrets = SecretBox::from_base64(&config.encryption_key)?;
        let connector = Arc::new(PgConnector::new(
            config.admin.host.clone(),
            config.admin.port,
            pool_config.clone(),
        ));

        let admin_pool = connector.connect(&config.admin.admin_target()).await?;
        let control_plane = admin_pool
            .as_pg()
            .cloned()
            .ok_or_else(|| TenancyError::Configuration("Control plane must be Postgres".into()))?;

        let registry = TenantRegistry::new(Arc::new(PgTenantStore::new(control_plane.clone())));
        let credentials = RegistryCredentials::new(registry.clone(), secrets.clone());
        let pools = TenantPoolCache::new(
            connector,
            Arc::new(credentials),
            config.admin.clone(),
            pool_config,
        )?
        .with_admin_pool(admin_pool);

        info!(
            host = %config.admin.host,
            database = %config.admin.database,
            "Connected to control plane"
        );

        Ok(Self {
            registry,
            pools: Arc::new(pools),
            secrets,
            control_plane,
        })
    }

    /// Apply pending control-plane migrations.
    pub async fn migrate(&self) -> Result<usize> {
        migrations::run_migrations(&self.control_plane).await
    }

    /// Provisioner using the configured script catalog and extensions.
    pub fn provisioner(&self, config: &AppConfig) -> Result<Provisioner> {
        let catalog = ScriptCatalog::from_dir(&config.scripts_dir)?;
        info!(
            scripts = catalog.len(),
            dir = %config.scripts_dir.display(),
            "Loaded script catalog"
        );
        Ok(Provisioner::new(
            Arc::clone(&self.pools),
            self.registry.clone(),
            Arc::new(catalog),
            config.tenant_extensions.clone(),
        ))
    }

    pub fn delta_runner(&self) -> DeltaMigrationRunner {
        DeltaMigrationRunner::new(self.registry.clone(), Arc::clone(&self.pools))
    }

    /// Start the provisioning queue and assemble the HTTP state.
    pub fn into_app_state(
        self,
        config: &AppConfig,
        delivery: Arc<dyn OtpDelivery>,
    ) -> Result<AppState> {
        let provisioner = Arc::new(self.provisioner(config)?);
        let queue = Arc::new(ProvisioningQueue::start(provisioner, config.queue.clone()));

        let onboarding = TenantOnboarding::new(
            self.registry.clone(),
            Arc::clone(&queue),
            self.secrets.clone(),
            delivery,
            config.otp_ttl,
            config.database_prefix.clone(),
        );
        let resolver = TenantResolver::new(
            self.registry.clone(),
            Arc::clone(&self.pools),
            TokenVerifier::new(config.jwt_secret.as_bytes()),
        );
        let delta = self.delta_runner();

        Ok(AppState {
            registry: self.registry,
            pools: self.pools,
            resolver: Arc::new(resolver),
            onboarding: Arc::new(onboarding),
            queue,
            delta: Arc::new(delta),
            admin_token: config.admin_token.as_deref().map(Arc::from),
        })
    }
}
