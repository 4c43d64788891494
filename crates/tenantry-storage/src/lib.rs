//! Tenantry Storage
//!
//! Database pool abstraction, the per-tenant connection pool cache, and
//! request-scoped propagation of the resolved tenant connection.
//!
//! # Architecture
//!
//! ```text
//! CredentialProvider ──► TenantPoolCache ──► PoolConnector ──► DatabasePool
//!   (tenant registry)     LRU + per-key        (Postgres)       (one per tenant)
//!                         creation locks
//!                                │
//!                                ▼
//!                     context::bind(TenantConnection, work)
//!                                │
//!                     context::current() anywhere below
//! ```
//!
//! Pools are reached through object-safe traits so the cache and everything
//! built on it can run against in-memory fakes in tests.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tenantry_core::Result;
use uuid::Uuid;

pub mod context;
pub mod pool_cache;
pub mod pool_config;
pub mod postgres;
pub mod tenant;

pub use context::TenantConnection;
pub use pool_cache::{PoolCacheStats, ScopedPool, TenantPoolCache};
pub use pool_config::ConnectionPoolConfig;
pub use postgres::{AdminConnectOptions, PgConnector, PgDatabasePool};
pub use tenant::Subdomain;

/// Boxed future used by the object-safe async traits in this crate.
///
/// # Manual Async Trait
///
/// Traits here return `Pin<Box<dyn Future>>` instead of using the
/// async-trait crate, keeping explicit `Send` bounds on every method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A pooled set of live connections to one database.
pub trait DatabasePool: Send + Sync + fmt::Debug {
    /// Name of the database this pool connects to.
    fn database(&self) -> &str;

    /// Execute a (possibly multi-statement) SQL script without bind parameters.
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Round-trip a trivial query to prove the pool is usable.
    fn ping(&self) -> BoxFuture<'_, Result<()>>;

    /// Close every connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;

    /// Underlying sqlx pool, when this is a real Postgres pool.
    ///
    /// Feature code that needs typed queries reaches the driver through this.
    fn as_pg(&self) -> Option<&sqlx::PgPool> {
        None
    }
}

/// Shared handle to a pool. Clones refer to the same pool instance.
pub type SharedPool = Arc<dyn DatabasePool>;

/// Whether a pool serves ongoing traffic or a single administrative task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPurpose {
    /// Control-plane pool, shared by every request and job
    Admin,
    /// A tenant's own long-lived pool
    Tenant,
    /// Short-lived admin connection to a tenant database (at most one connection)
    Scoped,
}

/// Where and as whom to connect.
#[derive(Clone)]
pub struct ConnectTarget {
    pub database: String,
    pub username: String,
    pub password: String,
    pub purpose: PoolPurpose,
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("purpose", &self.purpose)
            .finish()
    }
}

/// Opens pools. Implemented by [`PgConnector`] and by test fakes.
pub trait PoolConnector: Send + Sync {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> BoxFuture<'a, Result<SharedPool>>;
}

/// Decrypted credentials for one tenant's database.
#[derive(Clone)]
pub struct TenantCredentials {
    pub tenant_id: Uuid,
    pub database_name: String,
    pub database_user: String,
    pub database_password: String,
}

impl fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("database_name", &self.database_name)
            .field("database_user", &self.database_user)
            .field("database_password", &"<redacted>")
            .finish()
    }
}

impl TenantCredentials {
    pub fn connect_target(&self) -> ConnectTarget {
        ConnectTarget {
            database: self.database_name.clone(),
            username: self.database_user.clone(),
            password: self.database_password.clone(),
            purpose: PoolPurpose::Tenant,
        }
    }
}

/// Looks up a tenant's stored database credentials.
///
/// The tenant registry implements this; the pool cache never reads the
/// registry table directly.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, tenant_id: Uuid) -> BoxFuture<'_, Result<TenantCredentials>>;
}
