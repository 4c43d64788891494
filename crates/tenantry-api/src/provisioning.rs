//! Provisioning Job Queue
//!
//! Creates a verified tenant's dedicated database in the background.
//!
//! # Job lifecycle
//!
//! ```text
//! enqueue ──► queued ──► running ──┬──► succeeded
//!                                  ├──► rolled_back
//!                                  └──► declined
//! ```
//!
//! # Claim
//!
//! Before touching the cluster a run takes the tenant's provisioning claim
//! in the registry (`provisioning_started_at`). A run that cannot take it,
//! because another worker or an operator CLI is building the same tenant or
//! the tenant is already provisioned, is declined without side effects. A
//! claim older than the claim timeout counts as abandoned.
//!
//! # Workflow
//!
//! Each step depends on the previous one. The first failure aborts the job
//! and rolls back everything it may have created:
//!
//! | # | Step | Pool |
//! |---|------|------|
//! | 1 | `CREATE ROLE` | admin |
//! | 2 | `CREATE DATABASE` | admin |
//! | 3 | `GRANT ALL` + `ALTER DATABASE .. OWNER TO` | admin |
//! | 4 | `CREATE EXTENSION IF NOT EXISTS ..` | scoped admin on the tenant database |
//! | 5 | open tenant pool | pool cache |
//! | 6 | schema scripts | tenant |
//! | 7 | seed scripts | tenant |
//! | 8 | function scripts | tenant |
//! | 9 | stamp `database_created_on` | registry |
//!
//! Rollback closes the tenant pool, drops the database and role, each
//! best-effort, and records the error on the tenant. Only objects this run
//! created, or leftovers whose names no other tenant (deleted or not) has
//! ever held, are dropped. A retry always starts again from step 1.
//!
//! # Admission
//!
//! At most `rate_limit` jobs start per `rate_window`, at most `concurrency`
//! run at once, and at most `queue_depth` wait. `enqueue` fails fast with
//! `QueueFull` beyond that.

use crate::config::QueueConfig;
use crate::rate_limiting::WindowRateLimiter;
use crate::registry::TenantRegistry;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tenantry_core::secrets::SecretBox;
use tenantry_core::validation::{quote_ident, quote_literal};
use tenantry_core::{
    DeltaScript, Result, ScriptCatalog, TenancyError, TenantFilter, TenantPatch, TenantRecord,
};
use tenantry_storage::{DatabasePool, ScopedPool, SharedPool, TenantPoolCache};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the outcome broadcast channel
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Age after which a provisioning claim is considered abandoned
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// ============================================================================
// Jobs
// ============================================================================

/// Everything a worker needs to build one tenant database.
#[derive(Clone)]
pub struct ProvisioningJob {
    pub tenant_id: Uuid,
    pub database_name: String,
    pub database_user: String,
    /// Plaintext; never logged
    pub database_password: String,
    /// 1 for the first attempt, incremented on each re-enqueue
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl fmt::Debug for ProvisioningJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningJob")
            .field("tenant_id", &self.tenant_id)
            .field("database_name", &self.database_name)
            .field("database_user", &self.database_user)
            .field("database_password", &"<redacted>")
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl ProvisioningJob {
    pub fn new(
        tenant_id: Uuid,
        database_name: impl Into<String>,
        database_user: impl Into<String>,
        database_password: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            database_name: database_name.into(),
            database_user: database_user.into(),
            database_password: database_password.into(),
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Build a job from a registry record, decrypting the stored password.
    pub fn from_record(tenant: &TenantRecord, secrets: &SecretBox) -> Result<Self> {
        let password = secrets.decrypt(&tenant.database_password)?;
        Ok(Self::new(
            tenant.id,
            tenant.database_name.clone(),
            tenant.database_user.clone(),
            password,
        ))
    }
}

/// State of the most recent job for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    RolledBack,
    /// Another run held the claim or the tenant was already provisioned
    Declined,
}

impl JobState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }
}

/// Steps of the provisioning workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    CreateRole,
    CreateDatabase,
    GrantOwnership,
    InstallExtensions,
    OpenTenantPool,
    MigrateSchema,
    SeedData,
    InstallFunctions,
    StampRegistry,
}

impl ProvisioningStep {
    pub const ALL: [ProvisioningStep; 9] = [
        ProvisioningStep::CreateRole,
        ProvisioningStep::CreateDatabase,
        ProvisioningStep::GrantOwnership,
        ProvisioningStep::InstallExtensions,
        ProvisioningStep::OpenTenantPool,
        ProvisioningStep::MigrateSchema,
        ProvisioningStep::SeedData,
        ProvisioningStep::InstallFunctions,
        ProvisioningStep::StampRegistry,
    ];

    /// 1-based position in the workflow.
    pub fn number(&self) -> u8 {
        *self as u8 + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStep::CreateRole => "create_role",
            ProvisioningStep::CreateDatabase => "create_database",
            ProvisioningStep::GrantOwnership => "grant_ownership",
            ProvisioningStep::InstallExtensions => "install_extensions",
            ProvisioningStep::OpenTenantPool => "open_tenant_pool",
            ProvisioningStep::MigrateSchema => "migrate_schema",
            ProvisioningStep::SeedData => "seed_data",
            ProvisioningStep::InstallFunctions => "install_functions",
            ProvisioningStep::StampRegistry => "stamp_registry",
        }
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal result of one job, as broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningOutcome {
    pub tenant_id: Uuid,
    pub state: JobState,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<ProvisioningStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ProvisioningOutcome {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }

    /// `ProvisioningError` for a rolled-back job, `ConflictError` for a
    /// declined one.
    pub fn into_result(self) -> Result<()> {
        match self.state {
            JobState::Succeeded => Ok(()),
            JobState::Declined => Err(TenancyError::ConflictError(
                self.error.unwrap_or_default(),
            )),
            _ => Err(TenancyError::ProvisioningError {
                tenant_id: self.tenant_id.to_string(),
                step: self.failed_step.map(|s| s.to_string()).unwrap_or_default(),
                message: self.error.unwrap_or_default(),
            }),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Cluster objects a run has created so far.
#[derive(Debug, Default, Clone, Copy)]
struct CreatedObjects {
    role: bool,
    database: bool,
}

/// Runs the provisioning workflow for one job at a time.
pub struct Provisioner {
    pools: Arc<TenantPoolCache>,
    registry: TenantRegistry,
    catalog: Arc<ScriptCatalog>,
    extensions: Vec<String>,
    claim_timeout: Duration,
}

impl Provisioner {
    pub fn new(
        pools: Arc<TenantPoolCache>,
        registry: TenantRegistry,
        catalog: Arc<ScriptCatalog>,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            pools,
            registry,
            catalog,
            extensions,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Claim the tenant, then run every step, rolling back on the first
    /// failure.
    ///
    /// Never returns early: rollback has finished by the time the outcome is
    /// returned.
    pub async fn run(&self, job: &ProvisioningJob) -> ProvisioningOutcome {
        let stale_after = chrono::Duration::seconds(self.claim_timeout.as_secs() as i64);
        match self.registry.claim_provisioning(job.tenant_id, stale_after).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    tenant_id = %job.tenant_id,
                    "Tenant is already provisioned or claimed by another run, declining"
                );
                return Self::declined(
                    job,
                    format!(
                        "Tenant {} is already provisioned or being provisioned",
                        job.tenant_id
                    ),
                );
            }
            Err(e) => {
                error!(tenant_id = %job.tenant_id, error = %e, "Could not claim tenant for provisioning");
                return Self::declined(job, e.to_string());
            }
        }

        info!(
            tenant_id = %job.tenant_id,
            database = %job.database_name,
            attempt = job.attempt,
            "Provisioning tenant database"
        );

        let mut created = CreatedObjects::default();
        match self.execute(job, &mut created).await {
            Ok(()) => {
                info!(tenant_id = %job.tenant_id, database = %job.database_name, "Tenant database provisioned");
                ProvisioningOutcome {
                    tenant_id: job.tenant_id,
                    state: JobState::Succeeded,
                    attempt: job.attempt,
                    failed_step: None,
                    error: None,
                    finished_at: Utc::now(),
                }
            }
            Err((step, cause)) => {
                let err = TenancyError::ProvisioningError {
                    tenant_id: job.tenant_id.to_string(),
                    step: step.to_string(),
                    message: cause.to_string(),
                };
                error!(
                    tenant_id = %job.tenant_id,
                    step = %step,
                    step_number = step.number(),
                    error = %cause,
                    "Provisioning failed, rolling back"
                );

                self.rollback(job, &err, created).await;

                ProvisioningOutcome {
                    tenant_id: job.tenant_id,
                    state: JobState::RolledBack,
                    attempt: job.attempt,
                    failed_step: Some(step),
                    error: Some(cause.to_string()),
                    finished_at: Utc::now(),
                }
            }
        }
    }

    fn declined(job: &ProvisioningJob, reason: String) -> ProvisioningOutcome {
        ProvisioningOutcome {
            tenant_id: job.tenant_id,
            state: JobState::Declined,
            attempt: job.attempt,
            failed_step: None,
            error: Some(reason),
            finished_at: Utc::now(),
        }
    }

    async fn execute(
        &self,
        job: &ProvisioningJob,
        created: &mut CreatedObjects,
    ) -> std::result::Result<(), (ProvisioningStep, TenancyError)> {
        use ProvisioningStep::*;

        let database = quote_ident(&job.database_name);
        let role = quote_ident(&job.database_user);

        let admin = self
            .pools
            .get_admin_pool()
            .await
            .map_err(|e| (CreateRole, e))?;

        let create_role = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            role,
            quote_literal(&job.database_password)
        );
        step(job, CreateRole, admin.execute(&create_role)).await?;
        created.role = true;

        let create_database = format!("CREATE DATABASE {}", database);
        step(job, CreateDatabase, admin.execute(&create_database)).await?;
        created.database = true;

        step(job, GrantOwnership, async {
            admin
                .execute(&format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {}", database, role))
                .await?;
            admin
                .execute(&format!("ALTER DATABASE {} OWNER TO {}", database, role))
                .await
        })
        .await?;

        step(job, InstallExtensions, self.install_extensions(&job.database_name)).await?;

        let tenant_pool = step(job, OpenTenantPool, self.pools.get_or_create(job.tenant_id)).await?;

        step(job, MigrateSchema, run_scripts(&tenant_pool, &self.catalog.schema)).await?;
        step(job, SeedData, run_scripts(&tenant_pool, &self.catalog.seed)).await?;
        step(job, InstallFunctions, run_scripts(&tenant_pool, &self.catalog.functions)).await?;

        step(job, StampRegistry, async {
            let stamped = self
                .registry
                .update(
                    &TenantFilter::by_id(job.tenant_id),
                    &TenantPatch::provisioned_at(Utc::now()),
                )
                .await?;
            if stamped {
                Ok(())
            } else {
                Err(TenancyError::NotFound(job.tenant_id.to_string()))
            }
        })
        .await
    }

    /// Install extensions through a scoped admin pool, closing it on every path.
    async fn install_extensions(&self, database_name: &str) -> Result<()> {
        if self.extensions.is_empty() {
            return Ok(());
        }

        let scoped: ScopedPool = self.pools.get_admin_pool_for_database(database_name).await?;
        let mut result = Ok(());
        for extension in &self.extensions {
            let sql = format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(extension));
            if let Err(e) = scoped.execute(&sql).await {
                result = Err(e);
                break;
            }
            debug!(database = %database_name, extension = %extension, "Installed extension");
        }
        scoped.close().await;
        result
    }

    /// Whether no tenant other than the job's, deleted or not, has ever held
    /// the job's database or role name.
    async fn owns_identifiers(&self, job: &ProvisioningJob) -> bool {
        let mut names = vec![job.database_name.as_str()];
        if job.database_user != job.database_name {
            names.push(job.database_user.as_str());
        }

        for name in names {
            match self.registry.database_identifier_owners(name).await {
                Ok(owners) => {
                    if let Some(other) = owners.iter().find(|id| **id != job.tenant_id) {
                        warn!(
                            tenant_id = %job.tenant_id,
                            owner = %other,
                            name = %name,
                            "Name belongs to another tenant"
                        );
                        return false;
                    }
                }
                Err(e) => {
                    error!(tenant_id = %job.tenant_id, error = %e, "Could not check name ownership");
                    return false;
                }
            }
        }
        true
    }

    /// Undo whatever the job created. Failures here are logged, not returned.
    async fn rollback(&self, job: &ProvisioningJob, cause: &TenancyError, created: CreatedObjects) {
        self.pools.invalidate(job.tenant_id).await;

        // Objects that existed before this run may be leftovers of an earlier
        // attempt for this tenant, or may belong to another tenant entirely
        let leftovers_owned = if created.role && created.database {
            true
        } else {
            self.owns_identifiers(job).await
        };
        let drop_database = created.database || leftovers_owned;
        let drop_role = created.role || leftovers_owned;

        if drop_database || drop_role {
            match self.pools.get_admin_pool().await {
                Ok(admin) => {
                    if drop_database {
                        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&job.database_name));
                        if let Err(e) = admin.execute(&sql).await {
                            error!(tenant_id = %job.tenant_id, database = %job.database_name, error = %e, "Rollback failed to drop database");
                        }
                    }
                    if drop_role {
                        let sql = format!("DROP ROLE IF EXISTS {}", quote_ident(&job.database_user));
                        if let Err(e) = admin.execute(&sql).await {
                            error!(tenant_id = %job.tenant_id, role = %job.database_user, error = %e, "Rollback failed to drop role");
                        }
                    }
                }
                Err(e) => {
                    error!(tenant_id = %job.tenant_id, error = %e, "Rollback could not reach admin pool");
                }
            }
        }
        if !drop_database || !drop_role {
            warn!(
                tenant_id = %job.tenant_id,
                database = %job.database_name,
                role = %job.database_user,
                "Rollback left pre-existing objects in place"
            );
        }

        let recorded = self
            .registry
            .update(
                &TenantFilter::by_id(job.tenant_id),
                &TenantPatch::provisioning_failed(cause.to_string()),
            )
            .await;
        if let Err(e) = recorded {
            warn!(tenant_id = %job.tenant_id, error = %e, "Failed to record provisioning error");
        }

        info!(tenant_id = %job.tenant_id, database = %job.database_name, "Provisioning rolled back");
    }
}

async fn step<T>(
    job: &ProvisioningJob,
    step: ProvisioningStep,
    work: impl std::future::Future<Output = Result<T>>,
) -> std::result::Result<T, (ProvisioningStep, TenancyError)> {
    debug!(tenant_id = %job.tenant_id, step = %step, step_number = step.number(), "Running provisioning step");
    work.await.map_err(|e| (step, e))
}

async fn run_scripts(pool: &SharedPool, scripts: &[DeltaScript]) -> Result<()> {
    for script in scripts {
        pool.execute(&script.sql).await.map_err(|e| {
            TenancyError::Other(format!("script '{}': {}", script.name, e))
        })?;
    }
    Ok(())
}

// ============================================================================
// Queue
// ============================================================================

/// Bounded, rate-limited background queue of provisioning jobs.
pub struct ProvisioningQueue {
    sender: Mutex<Option<mpsc::Sender<ProvisioningJob>>>,
    states: Arc<DashMap<Uuid, JobState>>,
    attempts: DashMap<Uuid, u32>,
    outcomes: broadcast::Sender<ProvisioningOutcome>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    config: QueueConfig,
}

impl fmt::Debug for ProvisioningQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningQueue")
            .field("tracked_tenants", &self.states.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ProvisioningQueue {
    /// Start the dispatcher on the current runtime.
    pub fn start(provisioner: Arc<Provisioner>, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let states = Arc::new(DashMap::new());

        info!(
            rate_limit = config.rate_limit,
            rate_window_secs = config.rate_window.as_secs(),
            concurrency = config.concurrency,
            queue_depth = config.queue_depth,
            "Starting provisioning queue"
        );

        let dispatcher = tokio::spawn(dispatch(
            receiver,
            provisioner,
            Arc::clone(&states),
            outcomes.clone(),
            config.clone(),
        ));

        Self {
            sender: Mutex::new(Some(sender)),
            states,
            attempts: DashMap::new(),
            outcomes,
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            config,
        }
    }

    /// Queue a job.
    ///
    /// # Errors
    ///
    /// - `ConflictError` if a job for the tenant is already queued or running
    /// - `QueueFull` if `queue_depth` jobs are already waiting
    pub fn enqueue(&self, mut job: ProvisioningJob) -> Result<()> {
        let tenant_id = job.tenant_id;

        let previous = match self.states.entry(tenant_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_in_flight() {
                    return Err(TenancyError::ConflictError(format!(
                        "Provisioning already in progress for tenant {}",
                        tenant_id
                    )));
                }
                Some(entry.insert(JobState::Queued))
            }
            Entry::Vacant(entry) => {
                entry.insert(JobState::Queued);
                None
            }
        };

        job.attempt = {
            let mut attempts = self.attempts.entry(tenant_id).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let attempt = job.attempt;

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TenancyError::QueueFull(self.config.queue_depth)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    TenancyError::Other("Provisioning queue is shut down".into())
                }
            }),
            None => Err(TenancyError::Other("Provisioning queue is shut down".into())),
        };

        if let Err(e) = sent {
            match previous {
                Some(state) => {
                    self.states.insert(tenant_id, state);
                }
                None => {
                    self.states.remove(&tenant_id);
                }
            }
            if let Some(mut attempts) = self.attempts.get_mut(&tenant_id) {
                *attempts = attempts.saturating_sub(1);
            }
            warn!(tenant_id = %tenant_id, error = %e, "Provisioning job rejected");
            return Err(e);
        }

        info!(tenant_id = %tenant_id, attempt, "Provisioning job queued");
        Ok(())
    }

    /// State of the tenant's most recent job, if any was enqueued.
    pub fn state(&self, tenant_id: Uuid) -> Option<JobState> {
        self.states.get(&tenant_id).map(|s| *s)
    }

    pub fn is_in_flight(&self, tenant_id: Uuid) -> bool {
        self.state(tenant_id).is_some_and(|s| s.is_in_flight())
    }

    /// Receive the outcome of every job finishing from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningOutcome> {
        self.outcomes.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Provisioning dispatcher panicked");
            }
        }
        info!("Provisioning queue stopped");
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<ProvisioningJob>,
    provisioner: Arc<Provisioner>,
    states: Arc<DashMap<Uuid, JobState>>,
    outcomes: broadcast::Sender<ProvisioningOutcome>,
    config: QueueConfig,
) {
    let limiter = WindowRateLimiter::new(config.rate_limit, config.rate_window);
    let slots = Arc::new(Semaphore::new(config.concurrency));

    while let Some(job) = receiver.recv().await {
        limiter.acquire().await;
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };

        let provisioner = Arc::clone(&provisioner);
        let states = Arc::clone(&states);
        let outcomes = outcomes.clone();

        tokio::spawn(async move {
            states.insert(job.tenant_id, JobState::Running);
            let outcome = provisioner.run(&job).await;
            states.insert(job.tenant_id, outcome.state);
            // No subscribers is fine; the outcome is already logged
            let _ = outcomes.send(outcome);
            drop(permit);
        });
    }

    // Channel closed: wait for running jobs
    let _ = slots.acquire_many(config.concurrency as u32).await;
    debug!("Provisioning dispatcher drained");
}
