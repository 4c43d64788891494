//! Tenant Resolution and Context Tests
//!
//! Tests how a request finds its tenant and its tenant's pool:
//! - `establish` readiness checks (inactive, unprovisioned)
//! - One pool per tenant under a thundering herd of first requests
//! - Evicted pools stay open for requests still bound to them
//! - Task-local isolation between concurrent requests for different tenants
//! - The HTTP middleware chain: bearer token, subdomain header, Host
//!
//! Run with: `cargo test -p tenantry-api --features test-utils --test tenant_context_tests`

#![cfg(feature = "test-utils")]

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, HOST, RETRY_AFTER};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tenantry_api::http::router;
use tenantry_api::resolver::TENANT_SUBDOMAIN_HEADER;
use tenantry_api::test_utils::TestHarness;
use tenantry_api::{QueueConfig, TokenVerifier};
use tenantry_core::{TenancyError, TenantFilter, TenantPatch};
use tenantry_storage::{context, ConnectionPoolConfig, DatabasePool};
use tower::ServiceExt;

async fn extract_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&body).expect("Failed to parse JSON")
}

// ============================================================================
// Resolver
// ============================================================================

#[tokio::test]
async fn test_establish_unprovisioned_tenant_fails_fast() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("acme").await;
    let resolver = harness.resolver();

    let err = resolver.establish(tenant.id).await.unwrap_err();
    assert!(matches!(err, TenancyError::NotProvisioned(ref s) if s == "acme"));

    // No pool construction was attempted
    assert_eq!(harness.connector.connects("acme"), 0);
    assert!(!harness.pools.is_cached(tenant.id));
}

#[tokio::test]
async fn test_establish_inactive_tenant_is_not_found() {
    let harness = TestHarness::new();
    let tenant = harness.seed_provisioned_tenant("acme").await;
    let suspend = TenantPatch {
        is_active: Some(false),
        ..TenantPatch::default()
    };
    harness
        .registry
        .update(&TenantFilter::by_id(tenant.id), &suspend)
        .await
        .unwrap();

    let err = harness.resolver().establish(tenant.id).await.unwrap_err();
    assert!(matches!(err, TenancyError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_share_one_pool() {
    let harness = TestHarness::new();
    let tenant = harness.seed_provisioned_tenant("acme").await;
    harness.pools.invalidate(tenant.id).await;
    let before = harness.connector.connects("acme");
    harness.connector.set_delay(Duration::from_millis(20));

    let tenant_id = tenant.id;
    let resolver = Arc::new(harness.resolver());
    let mut handles = Vec::new();
    for _ in 0..50 {
        let resolver = Arc::clone(&resolver);
        handles.push(tokio::spawn(async move {
            resolver.establish(tenant_id).await.map(|c| Arc::clone(c.pool()))
        }));
    }

    let mut pools = Vec::new();
    for handle in handles {
        pools.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(harness.connector.connects("acme") - before, 1);
    assert!(pools.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[tokio::test]
async fn test_evicted_pool_stays_usable_for_bound_request() {
    let harness =
        TestHarness::with_pool_config(ConnectionPoolConfig::default().with_cache_capacity(1));
    let alpha = harness.seed_provisioned_tenant("alpha").await;
    let bravo = harness.seed_provisioned_tenant("bravo").await;
    harness.pools.invalidate(alpha.id).await;
    harness.pools.invalidate(bravo.id).await;
    let baseline = harness.cluster.open_connections("alpha");
    let resolver = harness.resolver();

    let executed = resolver
        .scope(alpha.id, async {
            // Another request pushes this tenant out of the cache mid-flight
            resolver.establish(bravo.id).await.unwrap();
            assert!(!harness.pools.is_cached(alpha.id));
            tokio::task::yield_now().await;

            context::current().unwrap().pool().execute("SELECT 1").await
        })
        .await
        .unwrap();
    assert!(executed.is_ok(), "bound pool was closed: {:?}", executed);
    assert_eq!(harness.pools.stats().retired, 1);

    // Released by the request; the next cache access closes it
    harness.pools.get_or_create(bravo.id).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(harness.pools.stats().retired, 0);
    assert_eq!(harness.cluster.open_connections("alpha"), baseline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broken_tenant_does_not_block_others() {
    let harness = TestHarness::new();
    let healthy = harness.seed_provisioned_tenant("acme").await;
    let broken = harness.seed_provisioned_tenant("beta").await;
    harness.pools.invalidate(broken.id).await;
    harness.pools.invalidate(healthy.id).await;
    harness.cluster.refuse_connections("beta");

    let resolver = harness.resolver();
    let err = resolver.establish(broken.id).await.unwrap_err();
    assert!(matches!(err, TenancyError::ConnectionError { .. }));
    assert!(!harness.pools.is_cached(broken.id));

    resolver.establish(healthy.id).await.unwrap();

    // A failed construction is not cached, so a later attempt retries cleanly
    harness.cluster.clear_failures();
    resolver.establish(broken.id).await.unwrap();
    assert!(harness.pools.is_cached(broken.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_see_their_own_tenant() {
    let harness = TestHarness::new();
    let acme = harness.seed_provisioned_tenant("acme").await;
    let beta = harness.seed_provisioned_tenant("beta").await;
    let resolver = Arc::new(harness.resolver());

    /// Deep in a request: no tenant parameter, only the bound context.
    async fn database_in_context() -> String {
        tokio::task::yield_now().await;
        let connection = context::current().expect("bound connection");
        tokio::time::sleep(Duration::from_millis(1)).await;
        connection.pool().database().to_string()
    }

    let mut handles = Vec::new();
    for i in 0..40 {
        let resolver = Arc::clone(&resolver);
        let (tenant_id, expected) = if i % 2 == 0 {
            (acme.id, "acme")
        } else {
            (beta.id, "beta")
        };
        handles.push(tokio::spawn(async move {
            let seen = resolver.scope(tenant_id, database_in_context()).await.unwrap();
            assert_eq!(seen, expected);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(matches!(context::current(), Err(TenancyError::NoActiveContext)));
}

#[tokio::test]
async fn test_spawned_work_inherits_connection() {
    let harness = TestHarness::new();
    let tenant = harness.seed_provisioned_tenant("acme").await;
    let resolver = harness.resolver();

    let (inherited, plain) = resolver
        .scope(tenant.id, async {
            let inherited = context::spawn_in_context(async { context::try_current() });
            let plain = tokio::spawn(async { context::try_current() });
            (inherited.await.unwrap(), plain.await.unwrap())
        })
        .await
        .unwrap();

    assert_eq!(inherited.unwrap().tenant_id(), tenant.id);
    assert!(plain.is_none());
}

// ============================================================================
// HTTP
// ============================================================================

#[tokio::test]
async fn test_middleware_resolves_each_credential_source() {
    let harness = TestHarness::new();
    let tenant = harness.seed_provisioned_tenant("acme").await;
    let app = router(harness.app_state(harness.start_queue(QueueConfig::default())));

    let requests = [
        Request::builder()
            .uri("/api/v1/tenant")
            .header(AUTHORIZATION, format!("Bearer {}", harness.token_for(&tenant)))
            .body(Body::empty())
            .unwrap(),
        Request::builder()
            .uri("/api/v1/tenant")
            .header(TENANT_SUBDOMAIN_HEADER, "acme")
            .body(Body::empty())
            .unwrap(),
        Request::builder()
            .uri("/api/v1/tenant")
            .header(HOST, "acme.tenantry.io:8080")
            .body(Body::empty())
            .unwrap(),
    ];

    for req in requests {
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = extract_json_body(response).await;
        assert_eq!(json["tenant_id"], tenant.id.to_string());
        assert_eq!(json["subdomain"], "acme");
        assert_eq!(json["database"], "acme");
    }
}

#[tokio::test]
async fn test_middleware_error_responses() {
    let harness = TestHarness::new();
    let pending = harness.seed_tenant("pending").await;
    let app = router(harness.app_state(harness.start_queue(QueueConfig::default())));

    // Not provisioned yet: distinguishable "still being set up"
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenant")
                .header(AUTHORIZATION, format!("Bearer {}", harness.token_for(&pending)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(RETRY_AFTER));
    let json = extract_json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("still being set up"));

    // No credentials at all
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/v1/tenant").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Unknown subdomain
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenant")
                .header(TENANT_SUBDOMAIN_HEADER, "nobody")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Expired token
    let expired = TokenVerifier::new(tenantry_api::test_utils::TEST_JWT_SECRET)
        .issue(pending.id, "pending", chrono::Duration::minutes(-5))
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenant")
                .header(AUTHORIZATION, format!("Bearer {}", expired))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signup_and_verify_over_http() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let app = router(harness.app_state(queue.clone()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/signup")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "organization_name": "Acme Corp",
                        "subdomain_name": "acme",
                        "email": "admin@acme.example.com",
                        "contact_number": "+15550100",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let code = harness.delivery.last_code("acme").unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/signup/verify")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "subdomain": "acme", "otp": code }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = extract_json_body(response).await;
    assert!(json["tenant"].get("database_password").is_none());
    let token = json["access_token"].as_str().unwrap().to_string();

    assert!(outcomes.recv().await.unwrap().is_success());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenant")
                .header(AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    queue.shutdown().await;
}

#[tokio::test]
async fn test_ready_reports_pool_usage() {
    let harness = TestHarness::new();
    harness.seed_provisioned_tenant("acme").await;
    let app = router(harness.app_state(harness.start_queue(QueueConfig::default())));

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = extract_json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["tenant_pools"]["cached"], 1);
}
