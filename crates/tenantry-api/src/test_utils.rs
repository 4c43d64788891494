//! Test Utilities Module
//!
//! Shared infrastructure for exercising the tenancy core without a Postgres
//! server. Enable via the `test-utils` feature flag.
//!
//! # Features
//!
//! - `MemoryTenantStore`: in-memory registry store with the same uniqueness rules
//! - `FakeCluster`: a simulated Postgres server tracking roles, databases,
//!   extensions, tables and functions, with failure injection
//! - `FakeConnector`: opens `FakePool`s on the cluster and counts every connect
//! - `TestHarness`: the whole core wired together over the fakes
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantry_api::test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_provisioning() {
//!     let harness = TestHarness::new();
//!     let tenant = harness.seed_provisioned_tenant("acme").await;
//!     assert!(harness.cluster.has_table("acme", "employees"));
//! }
//! ```

use crate::config::QueueConfig;
use crate::delta::DeltaMigrationRunner;
use crate::onboarding::{OtpDelivery, TenantOnboarding};
use crate::provisioning::{Provisioner, ProvisioningJob, ProvisioningQueue};
use crate::registry::{RegistryCredentials, TenantRegistry, TenantStore};
use crate::resolver::{TenantResolver, TokenVerifier};
use crate::AppState;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenantry_core::secrets::{self, SecretBox};
use tenantry_core::{
    DeltaScript, NewTenant, Result, ScriptCatalog, TenancyError, TenantFilter, TenantPatch,
    TenantRecord,
};
use tenantry_storage::{
    AdminConnectOptions, BoxFuture, ConnectTarget, ConnectionPoolConfig, DatabasePool,
    PoolConnector, PoolPurpose, SharedPool, TenantPoolCache,
};
use uuid::Uuid;

/// Control-plane database name on the fake cluster
pub const CONTROL_PLANE_DB: &str = "tenantry_control";

/// JWT secret used by harness resolvers
pub const TEST_JWT_SECRET: &[u8] = b"test-secret-at-least-32-bytes-long!!";

/// Operator token used by harness app state
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub fn admin_options() -> AdminConnectOptions {
    AdminConnectOptions {
        host: "localhost".to_string(),
        port: 5432,
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        database: CONTROL_PLANE_DB.to_string(),
    }
}

/// Schema, seed and function scripts shaped like a real tenant catalog.
pub fn sample_catalog() -> ScriptCatalog {
    ScriptCatalog {
        schema: vec![
            DeltaScript::new(
                "001_employees",
                "CREATE TABLE IF NOT EXISTS employees (id UUID PRIMARY KEY, name TEXT NOT NULL)",
            ),
            DeltaScript::new(
                "002_departments",
                "CREATE TABLE IF NOT EXISTS departments (id SERIAL PRIMARY KEY, name TEXT NOT NULL)",
            ),
        ],
        seed: vec![DeltaScript::new(
            "001_departments",
            "INSERT INTO departments (name) VALUES ('Engineering'); \
             INSERT INTO departments (name) VALUES ('Operations')",
        )],
        functions: vec![DeltaScript::new(
            "list_employees",
            "CREATE OR REPLACE FUNCTION list_employees() RETURNS SETOF employees \
             AS $$ SELECT * FROM employees $$ LANGUAGE sql",
        )],
    }
}

// ============================================================================
// In-memory registry store
// ============================================================================

/// Registry store enforcing the same uniqueness rules as the `tenants` table.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    tenants: Mutex<Vec<TenantRecord>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, bypassing validation.
    pub fn insert(&self, record: TenantRecord) {
        self.tenants.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.tenants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.lock().is_empty()
    }

    fn conflict(existing: &TenantRecord, tenant: &NewTenant) -> Option<String> {
        // Database and role names stay taken after a soft delete
        if existing.database_name == tenant.database_name {
            return Some(format!("database '{}'", tenant.database_name));
        }
        if existing.database_user == tenant.database_user {
            return Some(format!("role '{}'", tenant.database_user));
        }
        if existing.is_deleted() {
            return None;
        }
        if existing.subdomain_name == tenant.subdomain_name {
            Some(format!("subdomain '{}'", tenant.subdomain_name))
        } else if existing.organization_name == tenant.organization_name {
            Some(format!("organization '{}'", tenant.organization_name))
        } else if existing.email == tenant.email {
            Some(format!("email '{}'", tenant.email))
        } else if existing.contact_number == tenant.contact_number {
            Some(format!("contact number '{}'", tenant.contact_number))
        } else {
            None
        }
    }
}

impl TenantStore for MemoryTenantStore {
    fn create(&self, tenant: NewTenant) -> BoxFuture<'_, Result<TenantRecord>> {
        Box::pin(async move {
            let mut tenants = self.tenants.lock();
            if let Some(field) = tenants.iter().find_map(|t| Self::conflict(t, &tenant))
            {
                return Err(TenancyError::ConflictError(format!("{} already exists", field)));
            }

            let now = Utc::now();
            let record = TenantRecord {
                id: Uuid::new_v4(),
                organization_name: tenant.organization_name,
                subdomain_name: tenant.subdomain_name,
                email: tenant.email,
                contact_number: tenant.contact_number,
                database_name: tenant.database_name,
                database_user: tenant.database_user,
                database_password: tenant.database_password,
                is_verified: false,
                is_active: false,
                otp: tenant.otp,
                otp_expires_at: tenant.otp_expires_at,
                database_created_on: None,
                provisioning_error: None,
                provisioning_started_at: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            tenants.push(record.clone());
            Ok(record)
        })
    }

    fn find<'a>(&'a self, filter: &'a TenantFilter) -> BoxFuture<'a, Result<Vec<TenantRecord>>> {
        Box::pin(async move {
            Ok(self
                .tenants
                .lock()
                .iter()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect())
        })
    }

    fn update<'a>(
        &'a self,
        filter: &'a TenantFilter,
        patch: &'a TenantPatch,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut updated = false;
            for tenant in self.tenants.lock().iter_mut().filter(|t| filter.matches(t)) {
                patch.apply_to(tenant);
                updated = true;
            }
            Ok(updated)
        })
    }
}

// ============================================================================
// Simulated Postgres cluster
// ============================================================================

#[derive(Debug, Default, Clone)]
struct FakeDatabase {
    owner: Option<String>,
    extensions: HashSet<String>,
    tables: HashSet<String>,
    functions: HashSet<String>,
    statements: Vec<String>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    database: Option<String>,
    needle: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// role name → password
    roles: HashMap<String, String>,
    databases: HashMap<String, FakeDatabase>,
    open_connections: HashMap<String, usize>,
    failures: Vec<InjectedFailure>,
    refused: HashSet<String>,
}

/// In-memory stand-in for a Postgres server.
///
/// Understands the statements the tenancy core issues (roles, databases,
/// grants, extensions, tables, functions, inserts) closely enough to check
/// what provisioning and rollback leave behind. Like Postgres, it refuses
/// to drop a database with open connections or a role that still owns a
/// database.
#[derive(Debug)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn sim_error(message: impl Into<String>) -> TenancyError {
    TenancyError::Other(message.into())
}

/// Strip quoting and any trailing column list from an identifier token.
fn unquote(token: &str) -> String {
    token
        .split('(')
        .next()
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

impl FakeCluster {
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state.roles.insert("postgres".into(), "postgres".into());
        state.databases.insert(
            CONTROL_PLANE_DB.into(),
            FakeDatabase {
                owner: Some("postgres".into()),
                ..FakeDatabase::default()
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    /// Make every statement on `database` (any database if `None`) that
    /// contains `needle` fail.
    pub fn fail_on(&self, database: Option<&str>, needle: &str) {
        self.state.lock().failures.push(InjectedFailure {
            database: database.map(str::to_string),
            needle: needle.to_ascii_uppercase(),
        });
    }

    /// Refuse every new connection to `database`.
    pub fn refuse_connections(&self, database: &str) {
        self.state.lock().refused.insert(database.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.refused.clear();
    }

    /// Create a role directly, as a crashed earlier attempt would have left it.
    pub fn create_role(&self, role: &str, password: &str) {
        self.state.lock().roles.insert(role.into(), password.into());
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.state.lock().roles.contains_key(role)
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state.lock().databases.contains_key(database)
    }

    pub fn database_owner(&self, database: &str) -> Option<String> {
        self.state
            .lock()
            .databases
            .get(database)
            .and_then(|db| db.owner.clone())
    }

    pub fn has_extension(&self, database: &str, extension: &str) -> bool {
        self.state
            .lock()
            .databases
            .get(database)
            .is_some_and(|db| db.extensions.contains(extension))
    }

    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.state
            .lock()
            .databases
            .get(database)
            .is_some_and(|db| db.tables.contains(table))
    }

    pub fn has_function(&self, database: &str, function: &str) -> bool {
        self.state
            .lock()
            .databases
            .get(database)
            .is_some_and(|db| db.functions.contains(function))
    }

    /// Statements executed against `database`, in order.
    pub fn statements(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .databases
            .get(database)
            .map(|db| db.statements.clone())
            .unwrap_or_default()
    }

    /// Connections opened to `database` and not yet closed.
    pub fn open_connections(&self, database: &str) -> usize {
        self.state
            .lock()
            .open_connections
            .get(database)
            .copied()
            .unwrap_or(0)
    }

    fn open(&self, target: &ConnectTarget) -> Result<()> {
        let mut state = self.state.lock();
        if state.refused.contains(&target.database) {
            return Err(sim_error(format!(
                "connection to database \"{}\" refused",
                target.database
            )));
        }
        if !state.databases.contains_key(&target.database) {
            return Err(sim_error(format!(
                "database \"{}\" does not exist",
                target.database
            )));
        }
        if target.purpose == PoolPurpose::Tenant
            && state.roles.get(&target.username) != Some(&target.password)
        {
            return Err(sim_error(format!(
                "password authentication failed for user \"{}\"",
                target.username
            )));
        }
        *state
            .open_connections
            .entry(target.database.clone())
            .or_default() += 1;
        Ok(())
    }

    fn release(&self, database: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.open_connections.get_mut(database) {
            *count = count.saturating_sub(1);
        }
    }

    fn execute(&self, database: &str, sql: &str) -> Result<()> {
        let mut state = self.state.lock();

        let upper = sql.to_ascii_uppercase();
        if let Some(failure) = state.failures.iter().find(|f| {
            f.database.as_deref().map_or(true, |db| db == database) && upper.contains(&f.needle)
        }) {
            return Err(sim_error(format!("injected failure on '{}'", failure.needle)));
        }

        if !state.databases.contains_key(database) {
            return Err(sim_error(format!("database \"{}\" does not exist", database)));
        }

        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            Self::apply(&mut state, database, statement)?;
            if let Some(db) = state.databases.get_mut(database) {
                db.statements.push(statement.to_string());
            }
        }
        Ok(())
    }

    fn apply(state: &mut ClusterState, database: &str, statement: &str) -> Result<()> {
        let tokens: Vec<&str> = statement.split_whitespace().collect();
        let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
        let word = |i: usize| upper.get(i).map(String::as_str).unwrap_or_default();
        let ident = |i: usize| tokens.get(i).map(|t| unquote(t)).unwrap_or_default();

        match (word(0), word(1)) {
            ("CREATE", "ROLE") => {
                let role = ident(2);
                if state.roles.contains_key(&role) {
                    return Err(sim_error(format!("role \"{}\" already exists", role)));
                }
                let password = upper
                    .iter()
                    .position(|t| t == "PASSWORD")
                    .and_then(|i| tokens.get(i + 1))
                    .map(|p| p.trim_matches('\'').to_string())
                    .unwrap_or_default();
                state.roles.insert(role, password);
            }
            ("CREATE", "DATABASE") => {
                let name = ident(2);
                if state.databases.contains_key(&name) {
                    return Err(sim_error(format!("database \"{}\" already exists", name)));
                }
                state.databases.insert(name, FakeDatabase::default());
            }
            ("GRANT", _) => {
                let (name, role) = (ident(5), ident(7));
                if !state.databases.contains_key(&name) {
                    return Err(sim_error(format!("database \"{}\" does not exist", name)));
                }
                if !state.roles.contains_key(&role) {
                    return Err(sim_error(format!("role \"{}\" does not exist", role)));
                }
            }
            ("ALTER", "DATABASE") => {
                let (name, role) = (ident(2), ident(5));
                if !state.roles.contains_key(&role) {
                    return Err(sim_error(format!("role \"{}\" does not exist", role)));
                }
                let db = state
                    .databases
                    .get_mut(&name)
                    .ok_or_else(|| sim_error(format!("database \"{}\" does not exist", name)))?;
                db.owner = Some(role);
            }
            ("DROP", "DATABASE") => {
                let name = ident(4);
                if state.open_connections.get(&name).copied().unwrap_or(0) > 0 {
                    return Err(sim_error(format!(
                        "database \"{}\" is being accessed by other users",
                        name
                    )));
                }
                state.databases.remove(&name);
            }
            ("DROP", "ROLE") => {
                let role = ident(4);
                if state
                    .databases
                    .values()
                    .any(|db| db.owner.as_deref() == Some(role.as_str()))
                {
                    return Err(sim_error(format!(
                        "role \"{}\" cannot be dropped because some objects depend on it",
                        role
                    )));
                }
                state.roles.remove(&role);
            }
            ("CREATE", "EXTENSION") => {
                let extension = ident(tokens.len().saturating_sub(1));
                if let Some(db) = state.databases.get_mut(database) {
                    db.extensions.insert(extension);
                }
            }
            ("CREATE", "TABLE") => {
                let if_not_exists = word(2) == "IF";
                let table = ident(if if_not_exists { 5 } else { 2 });
                if let Some(db) = state.databases.get_mut(database) {
                    if !db.tables.insert(table.clone()) && !if_not_exists {
                        return Err(sim_error(format!("relation \"{}\" already exists", table)));
                    }
                }
            }
            ("DROP", "TABLE") => {
                let table = ident(tokens.len().saturating_sub(1));
                if let Some(db) = state.databases.get_mut(database) {
                    db.tables.remove(&table);
                }
            }
            ("CREATE", "OR") if word(3) == "FUNCTION" => {
                let function = ident(4);
                if let Some(db) = state.databases.get_mut(database) {
                    db.functions.insert(function);
                }
            }
            ("INSERT", "INTO") => {
                let table = ident(2);
                let exists = state
                    .databases
                    .get(database)
                    .is_some_and(|db| db.tables.contains(&table));
                if !exists {
                    return Err(sim_error(format!("relation \"{}\" does not exist", table)));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Pool on the fake cluster.
#[derive(Debug)]
pub struct FakePool {
    cluster: Arc<FakeCluster>,
    database: String,
    purpose: PoolPurpose,
    closed: AtomicBool,
}

impl FakePool {
    pub fn purpose(&self) -> PoolPurpose {
        self.purpose
    }
}

impl DatabasePool for FakePool {
    fn database(&self) -> &str {
        &self.database
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(sim_error("pool is closed"));
            }
            tokio::task::yield_now().await;
            self.cluster.execute(&self.database, sql)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        self.execute("SELECT 1")
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.cluster.release(&self.database);
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector opening [`FakePool`]s and counting every successful connect.
#[derive(Debug)]
pub struct FakeConnector {
    cluster: Arc<FakeCluster>,
    connects: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            connects: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Slow every connect down, widening race windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Successful connects to `database`.
    pub fn connects(&self, database: &str) -> usize {
        self.connects.lock().get(database).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl PoolConnector for FakeConnector {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> BoxFuture<'a, Result<SharedPool>> {
        Box::pin(async move {
            let delay = *self.delay.lock();
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }

            self.cluster.open(target)?;
            *self
                .connects
                .lock()
                .entry(target.database.clone())
                .or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);

            let pool: SharedPool = Arc::new(FakePool {
                cluster: Arc::clone(&self.cluster),
                database: target.database.clone(),
                purpose: target.purpose,
                closed: AtomicBool::new(false),
            });
            Ok(pool)
        })
    }
}

/// OTP delivery that remembers the last code per subdomain.
#[derive(Debug, Default)]
pub struct RecordingOtpDelivery {
    codes: Mutex<HashMap<String, String>>,
}

impl RecordingOtpDelivery {
    pub fn last_code(&self, subdomain: &str) -> Option<String> {
        self.codes.lock().get(subdomain).cloned()
    }
}

impl OtpDelivery for RecordingOtpDelivery {
    fn deliver<'a>(&'a self, tenant: &'a TenantRecord, otp: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.codes
                .lock()
                .insert(tenant.subdomain_name.clone(), otp.to_string());
            Ok(())
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

/// The tenancy core wired over the fakes.
pub struct TestHarness {
    pub cluster: Arc<FakeCluster>,
    pub connector: Arc<FakeConnector>,
    pub store: Arc<MemoryTenantStore>,
    pub registry: TenantRegistry,
    pub pools: Arc<TenantPoolCache>,
    pub secrets: SecretBox,
    pub catalog: Arc<ScriptCatalog>,
    pub extensions: Vec<String>,
    pub delivery: Arc<RecordingOtpDelivery>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_pool_config(ConnectionPoolConfig::default())
    }

    pub fn with_pool_config(config: ConnectionPoolConfig) -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let connector = Arc::new(FakeConnector::new(Arc::clone(&cluster)));
        let store = Arc::new(MemoryTenantStore::new());
        let registry = TenantRegistry::new(store.clone());
        let secrets = SecretBox::new([42u8; 32]);

        let credentials = RegistryCredentials::new(registry.clone(), secrets.clone());
        let pools = TenantPoolCache::new(
            connector.clone(),
            Arc::new(credentials),
            admin_options(),
            config,
        )
        .expect("valid pool config");

        Self {
            cluster,
            connector,
            store,
            registry,
            pools: Arc::new(pools),
            secrets,
            catalog: Arc::new(sample_catalog()),
            extensions: vec!["postgis".to_string()],
            delivery: Arc::new(RecordingOtpDelivery::default()),
        }
    }

    pub fn provisioner(&self) -> Arc<Provisioner> {
        Arc::new(Provisioner::new(
            Arc::clone(&self.pools),
            self.registry.clone(),
            Arc::clone(&self.catalog),
            self.extensions.clone(),
        ))
    }

    pub fn start_queue(&self, config: QueueConfig) -> Arc<ProvisioningQueue> {
        Arc::new(ProvisioningQueue::start(self.provisioner(), config))
    }

    pub fn onboarding(&self, queue: Arc<ProvisioningQueue>) -> TenantOnboarding {
        TenantOnboarding::new(
            self.registry.clone(),
            queue,
            self.secrets.clone(),
            self.delivery.clone(),
            Duration::from_secs(900),
            "",
        )
    }

    pub fn resolver(&self) -> TenantResolver {
        TenantResolver::new(
            self.registry.clone(),
            Arc::clone(&self.pools),
            TokenVerifier::new(TEST_JWT_SECRET),
        )
    }

    pub fn delta_runner(&self) -> DeltaMigrationRunner {
        DeltaMigrationRunner::new(self.registry.clone(), Arc::clone(&self.pools))
    }

    pub fn app_state(&self, queue: Arc<ProvisioningQueue>) -> AppState {
        AppState {
            registry: self.registry.clone(),
            pools: Arc::clone(&self.pools),
            resolver: Arc::new(self.resolver()),
            onboarding: Arc::new(self.onboarding(Arc::clone(&queue))),
            queue,
            delta: Arc::new(self.delta_runner()),
            admin_token: Some(Arc::from(TEST_ADMIN_TOKEN)),
        }
    }

    /// Create a verified, active tenant without a database.
    pub async fn seed_tenant(&self, subdomain: &str) -> TenantRecord {
        let database = subdomain.replace('-', "_");
        let tenant = self
            .registry
            .create(NewTenant {
                organization_name: format!("{} Inc", subdomain),
                subdomain_name: subdomain.to_string(),
                email: format!("admin@{}.example.com", subdomain),
                contact_number: format!("+1555{}", subdomain.len() * 1000 + self.store.len()),
                database_name: database.clone(),
                database_user: database,
                database_password: self
                    .secrets
                    .encrypt(&secrets::generate_password())
                    .expect("encrypt password"),
                otp: None,
                otp_expires_at: None,
            })
            .await
            .expect("create tenant");

        self.registry
            .update(&TenantFilter::by_id(tenant.id), &TenantPatch::verified())
            .await
            .expect("verify tenant");
        self.registry.get(tenant.id).await.expect("reload tenant")
    }

    /// Create a tenant and run the full provisioning workflow inline.
    pub async fn seed_provisioned_tenant(&self, subdomain: &str) -> TenantRecord {
        let tenant = self.seed_tenant(subdomain).await;
        let outcome = self.provisioner().run(&self.job_for(&tenant)).await;
        assert!(outcome.is_success(), "provisioning {} failed: {:?}", subdomain, outcome);
        self.registry.get(tenant.id).await.expect("reload tenant")
    }

    pub fn job_for(&self, tenant: &TenantRecord) -> ProvisioningJob {
        ProvisioningJob::from_record(tenant, &self.secrets).expect("decrypt password")
    }

    /// Bearer token for a tenant, valid for an hour.
    pub fn token_for(&self, tenant: &TenantRecord) -> String {
        TokenVerifier::new(TEST_JWT_SECRET)
            .issue(tenant.id, &tenant.subdomain_name, chrono::Duration::hours(1))
            .expect("issue token")
    }
}
