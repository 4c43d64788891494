//! Postgres implementation of the pool traits.

use crate::pool_config::ConnectionPoolConfig;
use crate::{BoxFuture, ConnectTarget, DatabasePool, PoolConnector, PoolPurpose, SharedPool};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use tenantry_core::Result;
use tracing::{debug, info};

/// Control-plane server location and admin credentials.
#[derive(Clone)]
pub struct AdminConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// The control-plane database holding the tenant registry
    pub database: String,
}

impl fmt::Debug for AdminConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl AdminConnectOptions {
    /// Target for the singleton control-plane pool.
    pub fn admin_target(&self) -> ConnectTarget {
        ConnectTarget {
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            purpose: PoolPurpose::Admin,
        }
    }

    /// Target for a short-lived admin connection to another database.
    pub fn scoped_target(&self, database: &str) -> ConnectTarget {
        ConnectTarget {
            database: database.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            purpose: PoolPurpose::Scoped,
        }
    }
}

/// Opens sqlx Postgres pools on one server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    host: String,
    port: u16,
    config: ConnectionPoolConfig,
}

impl PgConnector {
    pub fn new(host: impl Into<String>, port: u16, config: ConnectionPoolConfig) -> Self {
        Self {
            host: host.into(),
            port,
            config,
        }
    }

    fn pool_options(&self, purpose: PoolPurpose) -> PgPoolOptions {
        let (min, max) = match purpose {
            PoolPurpose::Scoped => (0, 1),
            PoolPurpose::Admin | PoolPurpose::Tenant => {
                (self.config.min_connections, self.config.max_connections)
            }
        };

        PgPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .acquire_timeout(self.config.acquire_timeout)
    }
}

impl PoolConnector for PgConnector {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> BoxFuture<'a, Result<SharedPool>> {
        Box::pin(async move {
            let opts = PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&target.username)
                .password(&target.password)
                .database(&target.database);

            debug!(
                host = %self.host,
                port = self.port,
                database = %target.database,
                username = %target.username,
                purpose = ?target.purpose,
                "Connecting to PostgreSQL"
            );

            // connect_with opens one connection up front, so bad credentials or a
            // missing database fail here instead of on first use
            let pool = self
                .pool_options(target.purpose)
                .connect_with(opts)
                .await?;

            info!(database = %target.database, purpose = ?target.purpose, "Opened pool");

            let pool: SharedPool = Arc::new(PgDatabasePool::new(target.database.clone(), pool));
            Ok(pool)
        })
    }
}

/// A sqlx pool bound to one database.
pub struct PgDatabasePool {
    database: String,
    pool: PgPool,
}

impl fmt::Debug for PgDatabasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgDatabasePool")
            .field("database", &self.database)
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

impl PgDatabasePool {
    pub fn new(database: String, pool: PgPool) -> Self {
        Self { database, pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl DatabasePool for PgDatabasePool {
    fn database(&self) -> &str {
        &self.database
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            debug!(database = %self.database, "Closed pool");
        })
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn as_pg(&self) -> Option<&PgPool> {
        Some(&self.pool)
    }
}
