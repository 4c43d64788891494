//! Tenant Connection Pool Cache.
//!
//! Holds one live pool per tenant, created lazily on first access and reused
//! afterwards, plus the singleton pool to the control-plane database.
//!
//! # Architecture
//!
//! ```text
//! TenantPoolCache
//!        │
//!        ├── admin pool (OnceCell, created on first use)
//!        │
//!        ├── creation locks: DashMap<tenant id, Mutex<()>>
//!        │
//!        ├── LRU Cache (capacity: N)
//!        │     ├── 6f1c… → CachedPool { pool, last_used }
//!        │     ├── 91ab… → CachedPool { pool, last_used }
//!        │     └── c03e… → CachedPool { pool, last_used }
//!        │
//!        └── retired: evicted pools still held by requests
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let cache = TenantPoolCache::new(connector, credentials, admin_options, config)?;
//!
//! // Cached or newly created
//! let pool = cache.get_or_create(tenant_id).await?;
//! pool.execute("SELECT 1").await?;
//! ```
//!
//! # Creation
//!
//! First access for a tenant is double-checked under a lock held only for
//! that tenant id, so N racing requests build exactly one pool while other
//! tenants proceed untouched. A failed construction is never cached.
//!
//! # Eviction
//!
//! When the cache reaches capacity, the least recently used pool is evicted.
//! Idle eviction is opt-in through [`ConnectionPoolConfig::idle_timeout`].
//! The next access after an eviction rebuilds transparently.
//!
//! An evicted pool is closed only once no request still holds it. Until then
//! it sits in the retired list, and every later cache access closes retired
//! pools whose last holder has gone. [`TenantPoolCache::invalidate`] and
//! [`TenantPoolCache::close_all`] close immediately.

use crate::pool_config::ConnectionPoolConfig;
use crate::postgres::AdminConnectOptions;
use crate::{CredentialProvider, PoolConnector, SharedPool};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tenantry_core::{Result, TenancyError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label used in errors about the control-plane pool.
const CONTROL_PLANE: &str = "control-plane";

struct CachedPool {
    pool: SharedPool,
    last_used: Instant,
}

/// Lazily built, LRU-bounded cache of per-tenant pools.
pub struct TenantPoolCache {
    connector: Arc<dyn PoolConnector>,
    credentials: Arc<dyn CredentialProvider>,
    admin_options: AdminConnectOptions,
    admin_pool: OnceCell<SharedPool>,
    cache: Mutex<LruCache<Uuid, CachedPool>>,
    creation_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    retired: Mutex<Vec<SharedPool>>,
    config: ConnectionPoolConfig,
}

impl fmt::Debug for TenantPoolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPoolCache")
            .field("size", &self.cache.lock().len())
            .field("admin_connected", &self.admin_pool.initialized())
            .field("config", &self.config)
            .finish()
    }
}

impl TenantPoolCache {
    /// Create a new cache.
    ///
    /// # Errors
    ///
    /// Returns `TenancyError::Configuration` if the pool configuration is invalid.
    pub fn new(
        connector: Arc<dyn PoolConnector>,
        credentials: Arc<dyn CredentialProvider>,
        admin_options: AdminConnectOptions,
        config: ConnectionPoolConfig,
    ) -> Result<Self> {
        config.validate()?;

        let capacity = NonZeroUsize::new(config.cache_capacity)
            .ok_or_else(|| TenancyError::Configuration("Invalid cache capacity".into()))?;

        info!(
            cache_capacity = config.cache_capacity,
            max_connections = config.max_connections,
            idle_timeout_secs = ?config.idle_timeout.map(|d| d.as_secs()),
            "Created TenantPoolCache"
        );

        Ok(Self {
            connector,
            credentials,
            admin_options,
            admin_pool: OnceCell::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            creation_locks: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Use an already opened control-plane pool instead of connecting lazily.
    pub fn with_admin_pool(mut self, pool: SharedPool) -> Self {
        self.admin_pool = OnceCell::new_with(Some(pool));
        self
    }

    /// Get the pool for a tenant, creating and registering it on first access.
    ///
    /// # Errors
    ///
    /// - Whatever the credential provider returns (e.g. `NotFound`)
    /// - `TenancyError::ConnectionError` if the pool cannot be opened. Nothing
    ///   is cached in that case, so the next call retries from scratch.
    pub async fn get_or_create(&self, tenant_id: Uuid) -> Result<SharedPool> {
        self.close_released();

        if let Some(pool) = self.lookup(tenant_id) {
            debug!(tenant_id = %tenant_id, "Pool cache hit");
            return Ok(pool);
        }

        let lock = self
            .creation_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let result = self.create_locked(tenant_id).await;

        // Forget the lock unless other tasks are queued on it. Ours and the
        // map's are the only references left in that case.
        self.creation_locks
            .remove_if(&tenant_id, |_, held| Arc::strong_count(held) <= 2);
        drop(guard);

        result
    }

    /// Build and cache a pool. Caller holds the tenant's creation lock.
    async fn create_locked(&self, tenant_id: Uuid) -> Result<SharedPool> {
        // Another task may have built it while we waited
        if let Some(pool) = self.lookup(tenant_id) {
            debug!(tenant_id = %tenant_id, "Pool created by concurrent task, using existing");
            return Ok(pool);
        }

        debug!(tenant_id = %tenant_id, "Pool cache miss, creating new pool");

        let credentials = self.credentials.credentials(tenant_id).await?;
        let target = credentials.connect_target();
        let pool = self
            .connector
            .connect(&target)
            .await
            .map_err(|e| Self::connection_error(tenant_id, e))?;

        let evicted = {
            let mut cache = self.cache.lock();
            let evicted = cache.push(
                tenant_id,
                CachedPool {
                    pool: Arc::clone(&pool),
                    last_used: Instant::now(),
                },
            );
            debug!(tenant_id = %tenant_id, cache_size = cache.len(), "Cached tenant pool");
            evicted
        };

        if let Some((evicted_id, entry)) = evicted {
            if !Arc::ptr_eq(&entry.pool, &pool) {
                debug!(evicted_tenant = %evicted_id, tenant_id = %tenant_id, "Evicting LRU tenant pool");
                self.retire(entry.pool);
                self.close_released();
            }
        }

        Ok(pool)
    }

    fn lookup(&self, tenant_id: Uuid) -> Option<SharedPool> {
        let mut cache = self.cache.lock();
        match cache.get_mut(&tenant_id) {
            None => return None,
            Some(entry) if !entry.pool.is_closed() => {
                entry.last_used = Instant::now();
                return Some(Arc::clone(&entry.pool));
            }
            Some(_) => {}
        }
        cache.pop(&tenant_id);
        debug!(tenant_id = %tenant_id, "Dropped closed pool from cache");
        None
    }

    fn connection_error(tenant_id: impl fmt::Display, err: TenancyError) -> TenancyError {
        match err {
            TenancyError::ConnectionError { .. } => err,
            other => TenancyError::connection(tenant_id, other),
        }
    }

    /// Get the singleton control-plane pool.
    pub async fn get_admin_pool(&self) -> Result<SharedPool> {
        let pool = self
            .admin_pool
            .get_or_try_init(|| async {
                let target = self.admin_options.admin_target();
                self.connector
                    .connect(&target)
                    .await
                    .map_err(|e| Self::connection_error(CONTROL_PLANE, e))
            })
            .await?;
        Ok(Arc::clone(pool))
    }

    /// Open a short-lived admin pool directly against one database.
    ///
    /// Used once per tenant to install database-level extensions before the
    /// tenant's role has rights to. The caller must `close().await` it; if it is
    /// dropped instead, the close is spawned onto the runtime.
    pub async fn get_admin_pool_for_database(&self, database_name: &str) -> Result<ScopedPool> {
        let target = self.admin_options.scoped_target(database_name);
        let pool = self
            .connector
            .connect(&target)
            .await
            .map_err(|e| Self::connection_error(database_name, e))?;

        debug!(database = %database_name, "Opened scoped admin pool");
        Ok(ScopedPool {
            pool,
            database: database_name.to_string(),
            closed: false,
        })
    }

    /// Close and remove one tenant's pool.
    ///
    /// Unlike eviction this closes at once, even under in-flight requests.
    /// Returns `true` if a pool was cached.
    pub async fn invalidate(&self, tenant_id: Uuid) -> bool {
        let entry = self.cache.lock().pop(&tenant_id);
        match entry {
            Some(entry) => {
                entry.pool.close().await;
                info!(tenant_id = %tenant_id, "Invalidated tenant pool");
                true
            }
            None => false,
        }
    }

    /// Remove every pool unused for longer than `max_idle`.
    ///
    /// Pools no request holds are closed before returning; the rest are
    /// closed once released. Returns the number of pools evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<(Uuid, SharedPool)> = {
            let mut cache = self.cache.lock();
            let ids: Vec<Uuid> = cache
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() > max_idle)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| cache.pop(&id).map(|entry| (id, entry.pool)))
                .collect()
        };

        let count = expired.len();
        for (tenant_id, pool) in expired {
            debug!(tenant_id = %tenant_id, "Evicted idle tenant pool");
            self.retire(pool);
        }

        for pool in self.take_released() {
            pool.close().await;
        }

        if count > 0 {
            info!(count = count, "Evicted idle tenant pools");
        }
        count
    }

    /// Park an evicted pool until its last holder releases it.
    fn retire(&self, pool: SharedPool) {
        let mut retired = self.retired.lock();
        if Arc::strong_count(&pool) > 1 {
            debug!(database = %pool.database(), "Evicted pool still in use, deferring close");
        }
        retired.push(pool);
    }

    /// Remove retired pools that only the retired list still references.
    fn take_released(&self) -> Vec<SharedPool> {
        let mut retired = self.retired.lock();
        if retired.is_empty() {
            return Vec::new();
        }
        let mut released = Vec::new();
        let mut i = 0;
        while i < retired.len() {
            if Arc::strong_count(&retired[i]) == 1 {
                released.push(retired.swap_remove(i));
            } else {
                i += 1;
            }
        }
        released
    }

    /// Close released retired pools in the background.
    fn close_released(&self) {
        for pool in self.take_released() {
            debug!(database = %pool.database(), "Closing released evicted pool");
            close_detached(pool);
        }
    }

    /// Start the background idle reaper if idle eviction is configured.
    ///
    /// The task stops on its own once the cache is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let idle_timeout = self.config.idle_timeout?;
        let interval = self.config.reap_interval;
        let weak: Weak<Self> = Arc::downgrade(self);

        info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            interval_secs = interval.as_secs(),
            "Starting idle pool reaper"
        );

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("Pool cache dropped, stopping idle reaper");
                    break;
                };
                cache.evict_idle(idle_timeout).await;
            }
        }))
    }

    /// Close every tenant pool and the admin pool. Used on shutdown.
    pub async fn close_all(&self) {
        let pools: Vec<SharedPool> = {
            let mut cache = self.cache.lock();
            let mut pools = Vec::with_capacity(cache.len());
            while let Some((_, entry)) = cache.pop_lru() {
                pools.push(entry.pool);
            }
            pools.append(&mut self.retired.lock());
            pools
        };

        let count = pools.len();
        for pool in pools {
            pool.close().await;
        }

        if let Some(admin) = self.admin_pool.get() {
            admin.close().await;
        }

        info!(count = count, "Closed all tenant pools");
    }

    /// Check if a tenant's pool is currently cached.
    pub fn is_cached(&self, tenant_id: Uuid) -> bool {
        self.cache.lock().contains(&tenant_id)
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Get cache statistics.
    pub fn stats(&self) -> PoolCacheStats {
        let cache = self.cache.lock();
        PoolCacheStats {
            capacity: self.config.cache_capacity,
            size: cache.len(),
            cached_tenants: cache.iter().map(|(id, _)| *id).collect(),
            retired: self.retired.lock().len(),
            admin_connected: self.admin_pool.initialized(),
        }
    }
}

/// Spawn a close for a pool no longer reachable from the cache.
fn close_detached(pool: SharedPool) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { pool.close().await });
        }
        Err(_) => warn!(database = %pool.database(), "No runtime to close evicted pool"),
    }
}

/// Statistics about the pool cache.
#[derive(Debug, Clone)]
pub struct PoolCacheStats {
    /// Maximum number of tenant pools
    pub capacity: usize,
    /// Current number of cached pools
    pub size: usize,
    /// Cached tenant ids (most recently used first)
    pub cached_tenants: Vec<Uuid>,
    /// Evicted pools waiting for in-flight requests to release them
    pub retired: usize,
    /// Whether the control-plane pool has been opened
    pub admin_connected: bool,
}

/// Single-use admin pool against one tenant database.
///
/// Dereferences to the underlying pool. Release it with [`ScopedPool::close`];
/// dropping it without closing spawns the close in the background.
pub struct ScopedPool {
    pool: SharedPool,
    database: String,
    closed: bool,
}

impl fmt::Debug for ScopedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedPool")
            .field("database", &self.database)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ScopedPool {
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Close the pool and wait for its connections to shut down.
    pub async fn close(mut self) {
        self.closed = true;
        self.pool.close().await;
        debug!(database = %self.database, "Closed scoped admin pool");
    }
}

impl Deref for ScopedPool {
    type Target = SharedPool;

    fn deref(&self) -> &SharedPool {
        &self.pool
    }
}

impl Drop for ScopedPool {
    fn drop(&mut self) {
        if !self.closed {
            warn!(database = %self.database, "Scoped admin pool dropped without close");
            close_detached(Arc::clone(&self.pool));
        }
    }
}
