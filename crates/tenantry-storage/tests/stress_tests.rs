//! Stress tests for the tenant pool cache
//!
//! These tests hammer the cache with many tenants and concurrent requests to
//! check the create-once guarantee and LRU churn under load.
//! They are opt-in and NOT run in CI by default.
//!
//! ## Running Stress Tests
//!
//! ```bash
//! # Run all stress tests
//! RUN_STRESS_TESTS=1 cargo test --test stress_tests
//!
//! # Run with custom configuration
//! RUN_STRESS_TESTS=1 STRESS_TEST_TENANTS=500 STRESS_TEST_REQUESTS=20 cargo test --test stress_tests
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tenantry_core::{Result, TenancyError};
use tenantry_storage::{
    context, AdminConnectOptions, BoxFuture, ConnectTarget, ConnectionPoolConfig,
    CredentialProvider, DatabasePool, PoolConnector, SharedPool, TenantConnection,
    TenantCredentials, TenantPoolCache,
};
use uuid::Uuid;

/// Lock for test serialization
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> &'static Mutex<()> {
    ENV_LOCK.get_or_init(|| Mutex::new(()))
}

/// Check if stress tests should run
fn test_guard(name: &str) -> Option<std::sync::MutexGuard<'static, ()>> {
    if std::env::var("RUN_STRESS_TESTS").unwrap_or_default() != "1" {
        eprintln!("Skipping stress test {}: set RUN_STRESS_TESTS=1 to run", name);
        return None;
    }
    Some(env_lock().lock().expect("failed to lock"))
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
struct CountingPool {
    database: String,
    closed: AtomicBool,
}

impl DatabasePool for CountingPool {
    fn database(&self) -> &str {
        &self.database
    }
    fn execute<'a>(&'a self, _sql: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.closed.store(true, Ordering::SeqCst) })
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CountingConnector {
    connects: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl PoolConnector for CountingConnector {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> BoxFuture<'a, Result<SharedPool>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            *self
                .connects
                .lock()
                .expect("connector lock")
                .entry(target.database.clone())
                .or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            let pool: SharedPool = Arc::new(CountingPool {
                database: target.database.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(pool)
        })
    }
}

struct Directory(HashMap<Uuid, String>);

impl CredentialProvider for Directory {
    fn credentials(&self, tenant_id: Uuid) -> BoxFuture<'_, Result<TenantCredentials>> {
        Box::pin(async move {
            let name = self
                .0
                .get(&tenant_id)
                .ok_or_else(|| TenancyError::NotFound(tenant_id.to_string()))?;
            Ok(TenantCredentials {
                tenant_id,
                database_name: name.clone(),
                database_user: name.clone(),
                database_password: "pw".into(),
            })
        })
    }
}

fn build_cache(tenants: usize, capacity: usize) -> (Arc<TenantPoolCache>, Arc<CountingConnector>, Vec<Uuid>) {
    let ids: Vec<Uuid> = (0..tenants).map(|_| Uuid::new_v4()).collect();
    let directory = Directory(
        ids.iter()
            .enumerate()
            .map(|(i, id)| (*id, format!("tenant_{}", i)))
            .collect(),
    );
    let connector = Arc::new(CountingConnector::default());
    let cache = TenantPoolCache::new(
        connector.clone(),
        Arc::new(directory),
        AdminConnectOptions {
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            password: "postgres".into(),
            database: "tenantry_control".into(),
        },
        ConnectionPoolConfig::default().with_cache_capacity(capacity),
    )
    .expect("failed to create cache");
    (Arc::new(cache), connector, ids)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_thundering_herd_per_tenant() {
    let _guard = match test_guard("test_thundering_herd_per_tenant") {
        Some(g) => g,
        None => return,
    };

    let tenants = env_usize("STRESS_TEST_TENANTS", 200);
    let requests = env_usize("STRESS_TEST_REQUESTS", 10);
    let (cache, connector, ids) = build_cache(tenants, tenants);

    let mut handles = Vec::new();
    for id in &ids {
        for _ in 0..requests {
            let cache = Arc::clone(&cache);
            let id = *id;
            handles.push(tokio::spawn(async move { cache.get_or_create(id).await }));
        }
    }
    for handle in handles {
        handle.await.expect("task panicked").expect("get_or_create failed");
    }

    assert_eq!(connector.total.load(Ordering::SeqCst), tenants);
    assert!(connector
        .connects
        .lock()
        .expect("connector lock")
        .values()
        .all(|count| *count == 1));

    eprintln!("{} tenants x {} requests: one pool each", tenants, requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_lru_churn_keeps_tenants_isolated() {
    let _guard = match test_guard("test_lru_churn_keeps_tenants_isolated") {
        Some(g) => g,
        None => return,
    };

    let tenants = env_usize("STRESS_TEST_TENANTS", 200);
    let requests = env_usize("STRESS_TEST_REQUESTS", 10);
    let (cache, _, ids) = build_cache(tenants, (tenants / 10).max(1));

    let mut handles = Vec::new();
    for round in 0..requests {
        for (i, id) in ids.iter().enumerate() {
            let cache = Arc::clone(&cache);
            let id = *id;
            handles.push(tokio::spawn(async move {
                let pool = cache.get_or_create(id).await?;
                let expected = format!("tenant_{}", i);
                context::bind(TenantConnection::new(id, expected.clone(), pool), async move {
                    tokio::task::yield_now().await;
                    let conn = context::current()?;
                    assert_eq!(conn.pool().database(), expected, "round {}", round);
                    Ok::<_, TenancyError>(())
                })
                .await
            }));
        }
    }
    for handle in handles {
        handle.await.expect("task panicked").expect("request failed");
    }

    assert!(cache.stats().size <= cache.stats().capacity);
    eprintln!("LRU churn completed with {} live pools", cache.stats().size);
}
