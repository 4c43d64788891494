//! Signup and OTP Verification Tests
//!
//! Covers the path from signup to a provisioned tenant database:
//! - Registration creates a pending tenant and delivers a code
//! - Verification activates the tenant and queues its database
//! - Wrong, expired, and repeated codes are rejected
//! - Manual re-provisioning after a failed job
//! - Re-signup of a soft-deleted subdomain never reuses its database
//!
//! Run with: `cargo test -p tenantry-api --features test-utils --test onboarding_tests`

#![cfg(feature = "test-utils")]

use chrono::{Duration as ChronoDuration, Utc};
use tenantry_api::test_utils::TestHarness;
use tenantry_api::{JobState, QueueConfig, SignupRequest};
use tenantry_core::{TenancyError, TenantFilter, TenantPatch};

fn signup(subdomain: &str) -> SignupRequest {
    SignupRequest {
        organization_name: format!("{} Holdings", subdomain),
        subdomain_name: subdomain.to_string(),
        email: format!("Owner@{}.example.com", subdomain),
        contact_number: format!("+1555{:04}", subdomain.len()),
    }
}

#[tokio::test]
async fn test_register_creates_pending_tenant() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let onboarding = harness.onboarding(queue.clone());

    let registration = onboarding.register(signup("Acme")).await.unwrap();
    assert_eq!(registration.subdomain, "acme");

    let tenant = harness.registry.get(registration.tenant_id).await.unwrap();
    assert!(!tenant.is_verified);
    assert!(!tenant.is_active);
    assert_eq!(tenant.email, "owner@acme.example.com");
    assert_eq!(tenant.database_name, "acme");
    assert_eq!(tenant.database_user, "acme");
    assert!(tenant.database_created_on.is_none());

    // Password is stored encrypted
    let password = harness.secrets.decrypt(&tenant.database_password).unwrap();
    assert_ne!(password, tenant.database_password);

    let code = harness.delivery.last_code("acme").expect("code delivered");
    assert_eq!(tenant.otp.as_deref(), Some(code.as_str()));
    assert_eq!(queue.state(tenant.id), None);
}

#[tokio::test]
async fn test_register_rejects_duplicates_and_bad_input() {
    let harness = TestHarness::new();
    let onboarding = harness.onboarding(harness.start_queue(QueueConfig::default()));

    onboarding.register(signup("acme")).await.unwrap();

    let err = onboarding.register(signup("acme")).await.unwrap_err();
    assert!(matches!(err, TenancyError::ConflictError(_)), "got {:?}", err);

    let mut other = signup("acme-two");
    other.email = "owner@acme.example.com".to_string();
    let err = onboarding.register(other).await.unwrap_err();
    assert!(matches!(err, TenancyError::ConflictError(ref msg) if msg.contains("email")));

    let err = onboarding.register(signup("-bad-")).await.unwrap_err();
    assert!(matches!(err, TenancyError::ValidationError(_)));

    let mut missing = signup("gamma");
    missing.organization_name = "  ".to_string();
    let err = onboarding.register(missing).await.unwrap_err();
    assert!(matches!(err, TenancyError::ValidationError(_)));
}

#[tokio::test]
async fn test_verify_activates_and_provisions() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let onboarding = harness.onboarding(queue.clone());

    let registration = onboarding.register(signup("acme")).await.unwrap();
    let code = harness.delivery.last_code("acme").unwrap();

    let tenant = onboarding.verify("acme", &code).await.unwrap();
    assert!(tenant.is_verified);
    assert!(tenant.is_active);
    assert!(tenant.otp.is_none());

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.tenant_id, registration.tenant_id);
    assert!(outcome.is_success(), "provisioning failed: {:?}", outcome);

    let tenant = harness.registry.get(registration.tenant_id).await.unwrap();
    assert!(tenant.database_created_on.is_some());
    assert!(harness.cluster.has_table("acme", "employees"));

    queue.shutdown().await;
}

#[tokio::test]
async fn test_resignup_after_soft_delete_gets_fresh_database() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let onboarding = harness.onboarding(queue.clone());

    let old = harness.seed_provisioned_tenant("acme").await;
    harness.pools.invalidate(old.id).await;
    assert!(harness.registry.soft_delete(old.id).await.unwrap());

    let registration = onboarding.register(signup("acme")).await.unwrap();
    let tenant = harness.registry.get(registration.tenant_id).await.unwrap();
    assert_ne!(tenant.database_name, "acme");
    assert!(tenant.database_name.starts_with("acme_"));
    assert_eq!(tenant.database_user, tenant.database_name);

    let code = harness.delivery.last_code("acme").unwrap();
    onboarding.verify("acme", &code).await.unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_success(), "provisioning failed: {:?}", outcome);
    assert!(harness.cluster.has_table(&tenant.database_name, "employees"));

    // The deleted tenant's database and role are untouched
    assert!(harness.cluster.has_role("acme"));
    assert!(harness.cluster.has_table("acme", "employees"));
    assert_eq!(harness.cluster.database_owner("acme").as_deref(), Some("acme"));

    queue.shutdown().await;
}

#[tokio::test]
async fn test_verify_rejects_wrong_expired_and_repeated_codes() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let onboarding = harness.onboarding(queue.clone());

    let registration = onboarding.register(signup("acme")).await.unwrap();
    let code = harness.delivery.last_code("acme").unwrap();

    let err = onboarding.verify("acme", "000000x").await.unwrap_err();
    assert!(matches!(err, TenancyError::AuthError(_)));

    let err = onboarding.verify("nobody", &code).await.unwrap_err();
    assert!(matches!(err, TenancyError::NotFound(_)));

    // Expire the code in place
    let expire = TenantPatch {
        otp_expires_at: Some(Some(Utc::now() - ChronoDuration::minutes(1))),
        ..TenantPatch::default()
    };
    harness
        .registry
        .update(&TenantFilter::by_id(registration.tenant_id), &expire)
        .await
        .unwrap();
    let err = onboarding.verify("acme", &code).await.unwrap_err();
    assert!(matches!(err, TenancyError::AuthError(ref msg) if msg.contains("expired")));

    let refresh = TenantPatch {
        otp_expires_at: Some(Some(Utc::now() + ChronoDuration::minutes(5))),
        ..TenantPatch::default()
    };
    harness
        .registry
        .update(&TenantFilter::by_id(registration.tenant_id), &refresh)
        .await
        .unwrap();
    onboarding.verify("acme", &code).await.unwrap();

    let err = onboarding.verify("acme", &code).await.unwrap_err();
    assert!(matches!(err, TenancyError::ConflictError(_)));

    queue.shutdown().await;
}

#[tokio::test]
async fn test_verify_succeeds_when_queue_is_full() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig {
        queue_depth: 1,
        ..QueueConfig::default()
    });
    let onboarding = harness.onboarding(queue.clone());

    // Occupy the only slot without giving the dispatcher a chance to run
    let blocker = harness.seed_tenant("blocker").await;
    queue.enqueue(harness.job_for(&blocker)).unwrap();

    let registration = onboarding.register(signup("acme")).await.unwrap();
    let code = harness.delivery.last_code("acme").unwrap();
    let tenant = onboarding.verify("acme", &code).await.unwrap();

    assert!(tenant.is_active);
    assert_eq!(queue.state(registration.tenant_id), None);

    queue.shutdown().await;
    let tenant = harness.registry.get(registration.tenant_id).await.unwrap();
    assert!(tenant.database_created_on.is_none());
}

#[tokio::test]
async fn test_reprovision_after_failure() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let onboarding = harness.onboarding(queue.clone());

    let pending = onboarding.register(signup("pending")).await.unwrap();
    let err = onboarding.reprovision(pending.tenant_id).await.unwrap_err();
    assert!(matches!(err, TenancyError::ValidationError(_)));

    let tenant = harness.seed_tenant("beta").await;
    harness.cluster.fail_on(Some("beta"), "CREATE TABLE");
    onboarding.reprovision(tenant.id).await.unwrap();
    assert_eq!(outcomes.recv().await.unwrap().state, JobState::RolledBack);

    harness.cluster.clear_failures();
    onboarding.reprovision(tenant.id).await.unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.attempt, 2);

    let err = onboarding.reprovision(tenant.id).await.unwrap_err();
    assert!(matches!(err, TenancyError::ConflictError(_)));

    queue.shutdown().await;
}
