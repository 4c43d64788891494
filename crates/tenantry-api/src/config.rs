//! Server configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TENANTRY_DB_HOST` | localhost |
//! | `TENANTRY_DB_PORT` | 5432 |
//! | `TENANTRY_ADMIN_USER` | postgres |
//! | `TENANTRY_ADMIN_PASSWORD` | (empty) |
//! | `TENANTRY_ADMIN_DATABASE` | tenantry_control |
//! | `TENANTRY_PORT` | 8080 |
//! | `TENANTRY_JWT_SECRET` | required |
//! | `TENANTRY_ENCRYPTION_KEY` | required, base64 of 32 bytes |
//! | `TENANTRY_ADMIN_TOKEN` | unset (admin routes disabled) |
//! | `TENANTRY_OTP_TTL_SECS` | 900 |
//! | `TENANTRY_DATABASE_PREFIX` | (empty) |
//! | `TENANTRY_SCRIPTS_DIR` | scripts |
//! | `TENANTRY_TENANT_EXTENSIONS` | postgis |
//! | `TENANTRY_PROVISION_RATE_LIMIT` | 100 |
//! | `TENANTRY_PROVISION_RATE_WINDOW_SECS` | 5 |
//! | `TENANTRY_PROVISION_CONCURRENCY` | 4 |
//! | `TENANTRY_PROVISION_QUEUE_DEPTH` | 1000 |
//!
//! Pool limits are read separately by
//! [`ConnectionPoolConfig::from_env`](tenantry_storage::ConnectionPoolConfig::from_env).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tenantry_core::{validation, Result, TenancyError};
use tenantry_storage::AdminConnectOptions;

/// Default OTP lifetime (15 minutes)
pub const DEFAULT_OTP_TTL: Duration = Duration::from_secs(900);

/// Default provisioning rate: jobs per window
pub const DEFAULT_PROVISION_RATE_LIMIT: u32 = 100;

/// Default provisioning rate window
pub const DEFAULT_PROVISION_RATE_WINDOW: Duration = Duration::from_secs(5);

/// Default number of provisioning jobs running at once
pub const DEFAULT_PROVISION_CONCURRENCY: usize = 4;

/// Default bound on queued provisioning jobs
pub const DEFAULT_PROVISION_QUEUE_DEPTH: usize = 1000;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Provisioning queue admission and throughput limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum jobs started per `rate_window`
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Maximum jobs running at once
    pub concurrency: usize,
    /// Maximum jobs waiting; `enqueue` fails with `QueueFull` beyond this
    pub queue_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_PROVISION_RATE_LIMIT,
            rate_window: DEFAULT_PROVISION_RATE_WINDOW,
            concurrency: DEFAULT_PROVISION_CONCURRENCY,
            queue_depth: DEFAULT_PROVISION_QUEUE_DEPTH,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            rate_limit: env_or("TENANTRY_PROVISION_RATE_LIMIT", DEFAULT_PROVISION_RATE_LIMIT),
            rate_window: Duration::from_secs(env_or(
                "TENANTRY_PROVISION_RATE_WINDOW_SECS",
                DEFAULT_PROVISION_RATE_WINDOW.as_secs(),
            )),
            concurrency: env_or("TENANTRY_PROVISION_CONCURRENCY", DEFAULT_PROVISION_CONCURRENCY),
            queue_depth: env_or("TENANTRY_PROVISION_QUEUE_DEPTH", DEFAULT_PROVISION_QUEUE_DEPTH),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(TenancyError::Configuration(
                "TENANTRY_PROVISION_RATE_LIMIT must be at least 1".into(),
            ));
        }
        if self.rate_window.is_zero() {
            return Err(TenancyError::Configuration(
                "TENANTRY_PROVISION_RATE_WINDOW_SECS must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(TenancyError::Configuration(
                "TENANTRY_PROVISION_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(TenancyError::Configuration(
                "TENANTRY_PROVISION_QUEUE_DEPTH must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Everything the server and CLI need besides pool limits.
#[derive(Clone)]
pub struct AppConfig {
    pub admin: AdminConnectOptions,
    pub port: u16,
    pub jwt_secret: String,
    /// Base64 AES-256 key for tenant database passwords
    pub encryption_key: String,
    /// Bearer token for `/api/v1/admin/*`; admin routes reject everything when unset
    pub admin_token: Option<String>,
    pub otp_ttl: Duration,
    pub database_prefix: String,
    pub scripts_dir: PathBuf,
    /// Extensions installed into every tenant database
    pub tenant_extensions: Vec<String>,
    pub queue: QueueConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("admin", &self.admin)
            .field("port", &self.port)
            .field("admin_token_set", &self.admin_token.is_some())
            .field("otp_ttl", &self.otp_ttl)
            .field("database_prefix", &self.database_prefix)
            .field("scripts_dir", &self.scripts_dir)
            .field("tenant_extensions", &self.tenant_extensions)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// `TenancyError::Configuration` if a required variable is missing or
    /// the result fails [`AppConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let admin = AdminConnectOptions {
            host: std::env::var("TENANTRY_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_or("TENANTRY_DB_PORT", 5432),
            username: std::env::var("TENANTRY_ADMIN_USER")
                .unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("TENANTRY_ADMIN_PASSWORD").unwrap_or_default(),
            database: std::env::var("TENANTRY_ADMIN_DATABASE")
                .unwrap_or_else(|_| "tenantry_control".to_string()),
        };

        let jwt_secret = std::env::var("TENANTRY_JWT_SECRET")
            .map_err(|_| TenancyError::Configuration("TENANTRY_JWT_SECRET is required".into()))?;

        let encryption_key = std::env::var("TENANTRY_ENCRYPTION_KEY").map_err(|_| {
            TenancyError::Configuration("TENANTRY_ENCRYPTION_KEY is required".into())
        })?;

        let admin_token = std::env::var("TENANTRY_ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let tenant_extensions = std::env::var("TENANTRY_TENANT_EXTENSIONS")
            .unwrap_or_else(|_| "postgis".to_string())
            .split(',')
            .map(|ext| ext.trim().to_string())
            .filter(|ext| !ext.is_empty())
            .collect();

        let config = Self {
            admin,
            port: env_or("TENANTRY_PORT", 8080),
            jwt_secret,
            encryption_key,
            admin_token,
            otp_ttl: Duration::from_secs(env_or("TENANTRY_OTP_TTL_SECS", DEFAULT_OTP_TTL.as_secs())),
            database_prefix: std::env::var("TENANTRY_DATABASE_PREFIX").unwrap_or_default(),
            scripts_dir: std::env::var("TENANTRY_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("scripts")),
            tenant_extensions,
            queue: QueueConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < 32 {
            return Err(TenancyError::Configuration(
                "TENANTRY_JWT_SECRET must be at least 32 bytes".into(),
            ));
        }

        if !self.database_prefix.is_empty() {
            validation::validate_pg_identifier(&self.database_prefix, "TENANTRY_DATABASE_PREFIX")
                .map_err(|e| TenancyError::Configuration(e.to_string()))?;
        }

        for ext in &self.tenant_extensions {
            validation::validate_pg_identifier(ext, "TENANTRY_TENANT_EXTENSIONS")
                .map_err(|e| TenancyError::Configuration(e.to_string()))?;
        }

        self.queue.validate()
    }
}
