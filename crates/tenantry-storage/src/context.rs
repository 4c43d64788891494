//! Request-scoped tenant connection.
//!
//! [`bind`] runs a future with a [`TenantConnection`] installed in tokio
//! task-local storage; any code awaited inside it, however deeply nested, can
//! call [`current`] to reach the tenant's pool without receiving it as a
//! parameter.
//!
//! The value lives in the task, not the thread, so concurrent requests
//! multiplexed onto the same worker thread never see each other's connection.
//! Spawned tasks do not inherit it; use [`spawn_in_context`] for that.
//!
//! ```rust,ignore
//! context::bind(connection, async {
//!     // anywhere below
//!     let conn = context::current()?;
//!     conn.pool().execute("SELECT list_employees()").await
//! })
//! .await
//! ```

use crate::SharedPool;
use std::fmt;
use std::future::Future;
use tenantry_core::{Result, TenancyError};
use tokio::task::JoinHandle;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONNECTION: TenantConnection;
}

/// A tenant's pool as bound to one logical request.
#[derive(Clone)]
pub struct TenantConnection {
    tenant_id: Uuid,
    subdomain: String,
    pool: SharedPool,
}

impl fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConnection")
            .field("tenant_id", &self.tenant_id)
            .field("subdomain", &self.subdomain)
            .field("database", &self.pool.database())
            .finish()
    }
}

impl TenantConnection {
    pub fn new(tenant_id: Uuid, subdomain: impl Into<String>, pool: SharedPool) -> Self {
        Self {
            tenant_id,
            subdomain: subdomain.into(),
            pool,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Run `work` with this connection bound. See [`bind`].
    pub async fn scope<F>(self, work: F) -> F::Output
    where
        F: Future,
    {
        bind(self, work).await
    }
}

/// Run `work` with `connection` as the current tenant connection.
///
/// Nested binds shadow the outer one for their duration.
pub async fn bind<F>(connection: TenantConnection, work: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONNECTION.scope(connection, work).await
}

/// The connection bound to the running task.
///
/// # Errors
///
/// `TenancyError::NoActiveContext` outside any [`bind`] scope.
pub fn current() -> Result<TenantConnection> {
    try_current().ok_or(TenancyError::NoActiveContext)
}

/// Like [`current`], returning `None` outside a bind scope.
pub fn try_current() -> Option<TenantConnection> {
    CURRENT_CONNECTION.try_with(|conn| conn.clone()).ok()
}

/// Spawn a task that inherits the current connection, if any.
pub fn spawn_in_context<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match try_current() {
        Some(connection) => tokio::spawn(CURRENT_CONNECTION.scope(connection, future)),
        None => tokio::spawn(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxFuture, DatabasePool};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct NamedPool(String);

    impl DatabasePool for NamedPool {
        fn database(&self) -> &str {
            &self.0
        }
        fn execute<'a>(&'a self, _sql: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn ping(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn connection(name: &str) -> TenantConnection {
        TenantConnection::new(Uuid::new_v4(), name, Arc::new(NamedPool(name.to_string())))
    }

    async fn nested_lookup() -> Result<String> {
        tokio::task::yield_now().await;
        Ok(current()?.pool().database().to_string())
    }

    #[tokio::test]
    async fn test_current_outside_bind() {
        assert!(matches!(current(), Err(TenancyError::NoActiveContext)));
        assert!(try_current().is_none());
    }

    #[tokio::test]
    async fn test_bind_reaches_nested_calls() {
        let db = bind(connection("acme"), nested_lookup()).await.unwrap();
        assert_eq!(db, "acme");
        assert!(try_current().is_none());
    }

    #[tokio::test]
    async fn test_nested_bind_shadows() {
        bind(connection("outer"), async {
            let inner = bind(connection("inner"), nested_lookup()).await.unwrap();
            assert_eq!(inner, "inner");
            assert_eq!(current().unwrap().subdomain(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn test_interleaved_requests_are_isolated() {
        let a = bind(connection("a"), async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(current().unwrap().subdomain(), "a");
            }
        });
        let b = bind(connection("b"), async {
            for _ in 0..5 {
                tokio::task::yield_now().await;
                assert_eq!(current().unwrap().subdomain(), "b");
            }
        });
        tokio::join!(a, b);
    }

    #[tokio::test]
    async fn test_spawned_task_needs_spawn_in_context() {
        bind(connection("acme"), async {
            let plain = tokio::spawn(async { try_current().is_some() });
            assert!(!plain.await.unwrap());

            let inherited = spawn_in_context(async { current().map(|c| c.subdomain().to_string()) });
            assert_eq!(inherited.await.unwrap().unwrap(), "acme");
        })
        .await;
    }
}
