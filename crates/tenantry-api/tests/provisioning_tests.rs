//! Provisioning Workflow Tests
//!
//! Runs the nine-step tenant database workflow and the background queue
//! against the simulated cluster:
//! - Happy path: role, database, extensions, schema, seed, functions, stamp
//! - Rollback completeness for failures at every step from 4 to 8
//! - Recovery from a role left behind by a crashed attempt
//! - Rollback never drops objects another tenant owns
//! - Concurrent runs for one tenant: one provisions, the other declines
//! - Queue rate limiting, depth bound, and duplicate rejection
//!
//! Run with: `cargo test -p tenantry-api --features test-utils --test provisioning_tests`

#![cfg(feature = "test-utils")]

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tenantry_api::test_utils::TestHarness;
use tenantry_api::{JobState, ProvisioningStep, QueueConfig};
use tenantry_core::{TenancyError, TenantFilter, TenantPatch, TenantRecord};
use tokio::time::Instant;
use uuid::Uuid;

fn assert_rolled_back(harness: &TestHarness, tenant: &TenantRecord) {
    assert!(
        !harness.cluster.has_database(&tenant.database_name),
        "database {} should have been dropped",
        tenant.database_name
    );
    assert!(
        !harness.cluster.has_role(&tenant.database_user),
        "role {} should have been dropped",
        tenant.database_user
    );
    assert!(!harness.pools.is_cached(tenant.id));
}

// ============================================================================
// Workflow
// ============================================================================

#[tokio::test]
async fn test_provision_creates_database_and_schema() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("acme").await;
    assert!(tenant.database_created_on.is_none());

    let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;
    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    assert_eq!(outcome.state, JobState::Succeeded);
    assert!(outcome.failed_step.is_none());

    assert!(harness.cluster.has_role("acme"));
    assert!(harness.cluster.has_database("acme"));
    assert_eq!(harness.cluster.database_owner("acme").as_deref(), Some("acme"));
    assert!(harness.cluster.has_extension("acme", "postgis"));
    assert!(harness.cluster.has_table("acme", "employees"));
    assert!(harness.cluster.has_table("acme", "departments"));
    assert!(harness.cluster.has_function("acme", "list_employees"));

    let stored = harness.registry.get(tenant.id).await.unwrap();
    assert!(stored.database_created_on.is_some());
    assert!(stored.provisioning_error.is_none());

    // The pool opened in step 5 stays cached for requests
    assert!(harness.pools.is_cached(tenant.id));
    // The scoped extension connection was released
    assert_eq!(harness.cluster.open_connections("acme"), 1);
}

#[tokio::test]
async fn test_schema_failure_rolls_back_database_and_role() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("beta").await;
    harness.cluster.fail_on(Some("beta"), "CREATE TABLE");

    let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;

    assert_eq!(outcome.state, JobState::RolledBack);
    assert_eq!(outcome.failed_step, Some(ProvisioningStep::MigrateSchema));
    assert!(outcome.error.as_deref().unwrap().contains("001_employees"));
    assert_rolled_back(&harness, &tenant);

    let stored = harness.registry.get(tenant.id).await.unwrap();
    assert!(stored.database_created_on.is_none());
    let recorded = stored.provisioning_error.expect("error recorded");
    assert!(recorded.contains("migrate_schema"));

    // Still active for login, just without a database
    assert!(stored.is_active);
}

#[tokio::test]
async fn test_every_late_step_failure_rolls_back() {
    let cases = [
        ("step-four", ProvisioningStep::InstallExtensions),
        ("step-five", ProvisioningStep::OpenTenantPool),
        ("step-six", ProvisioningStep::MigrateSchema),
        ("step-seven", ProvisioningStep::SeedData),
        ("step-eight", ProvisioningStep::InstallFunctions),
    ];

    for (subdomain, expected) in cases {
        let mut harness = TestHarness::new();
        let tenant = harness.seed_tenant(subdomain).await;
        let database = tenant.database_name.as_str();

        match expected {
            ProvisioningStep::InstallExtensions => {
                harness.cluster.fail_on(Some(database), "CREATE EXTENSION")
            }
            ProvisioningStep::OpenTenantPool => {
                // Skip extensions so the first connection to the new database is the tenant's
                harness.extensions.clear();
                harness.cluster.refuse_connections(database);
            }
            ProvisioningStep::MigrateSchema => harness.cluster.fail_on(Some(database), "CREATE TABLE"),
            ProvisioningStep::SeedData => harness.cluster.fail_on(Some(database), "INSERT INTO"),
            ProvisioningStep::InstallFunctions => {
                harness.cluster.fail_on(Some(database), "CREATE OR REPLACE FUNCTION")
            }
            _ => unreachable!(),
        }

        let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;

        assert_eq!(outcome.failed_step, Some(expected), "tenant {}", subdomain);
        assert_eq!(outcome.state, JobState::RolledBack);
        assert_rolled_back(&harness, &tenant);
        assert_eq!(harness.cluster.open_connections(database), 0);

        let stored = harness.registry.get(tenant.id).await.unwrap();
        assert!(stored.database_created_on.is_none(), "tenant {}", subdomain);
    }
}

#[tokio::test]
async fn test_leftover_role_is_cleared_for_retry() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("gamma").await;
    harness.cluster.create_role("gamma", "stale-password");

    let first = harness.provisioner().run(&harness.job_for(&tenant)).await;
    assert_eq!(first.failed_step, Some(ProvisioningStep::CreateRole));
    assert!(!harness.cluster.has_role("gamma"));

    let second = harness.provisioner().run(&harness.job_for(&tenant)).await;
    assert!(second.is_success(), "retry failed: {:?}", second);
    assert!(harness.cluster.has_table("gamma", "employees"));
}

#[tokio::test]
async fn test_rollback_spares_objects_of_deleted_tenant() {
    let harness = TestHarness::new();
    let old = harness.seed_provisioned_tenant("acme").await;
    harness.pools.invalidate(old.id).await;
    harness.registry.soft_delete(old.id).await.unwrap();

    // A row that reuses the deleted tenant's names, as a pre-uniqueness
    // registry could hold
    let now = Utc::now();
    let reused = TenantRecord {
        id: Uuid::new_v4(),
        subdomain_name: "acme-again".to_string(),
        email: "owner@acme-again.example.com".to_string(),
        contact_number: "+15550001".to_string(),
        database_created_on: None,
        provisioning_error: None,
        provisioning_started_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        ..old.clone()
    };
    harness.store.insert(reused.clone());

    let outcome = harness.provisioner().run(&harness.job_for(&reused)).await;
    assert_eq!(outcome.state, JobState::RolledBack);
    assert_eq!(outcome.failed_step, Some(ProvisioningStep::CreateRole));

    assert!(harness.cluster.has_role("acme"));
    assert!(harness.cluster.has_database("acme"));
    assert!(harness.cluster.has_table("acme", "employees"));
}

#[tokio::test]
async fn test_concurrent_runs_for_one_tenant_provision_once() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("acme").await;
    let job = harness.job_for(&tenant);
    let provisioner = harness.provisioner();

    let (first, second) = tokio::join!(provisioner.run(&job), provisioner.run(&job));
    let (won, lost) = if first.state == JobState::Succeeded {
        (first, second)
    } else {
        (second, first)
    };
    assert!(won.is_success(), "no run succeeded: {:?}", won);
    assert_eq!(lost.state, JobState::Declined);
    assert!(matches!(lost.into_result(), Err(TenancyError::ConflictError(_))));

    assert!(harness.cluster.has_table("acme", "employees"));
    let tenant = harness.registry.get(tenant.id).await.unwrap();
    assert!(tenant.database_created_on.is_some());
    assert!(tenant.provisioning_started_at.is_none());
}

#[tokio::test]
async fn test_claimed_tenant_is_declined_until_claim_goes_stale() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("beta").await;
    let by_id = TenantFilter::by_id(tenant.id);

    // Another process is mid-run
    harness
        .registry
        .update(&by_id, &TenantPatch::provisioning_claimed(Utc::now()))
        .await
        .unwrap();
    let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;
    assert_eq!(outcome.state, JobState::Declined);
    assert!(!harness.cluster.has_role("beta"));
    assert!(!harness.cluster.has_database("beta"));

    // That process died long ago
    harness
        .registry
        .update(
            &by_id,
            &TenantPatch::provisioning_claimed(Utc::now() - ChronoDuration::hours(2)),
        )
        .await
        .unwrap();
    let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;
    assert!(outcome.is_success(), "stale claim blocked provisioning: {:?}", outcome);
    assert!(harness.cluster.has_table("beta", "employees"));
}

#[tokio::test]
async fn test_outcome_into_result_carries_step() {
    let harness = TestHarness::new();
    let tenant = harness.seed_tenant("delta-co").await;
    harness.cluster.fail_on(Some("delta_co"), "INSERT INTO");

    let outcome = harness.provisioner().run(&harness.job_for(&tenant)).await;
    match outcome.into_result() {
        Err(TenancyError::ProvisioningError { step, .. }) => assert_eq!(step, "seed_data"),
        other => panic!("expected ProvisioningError, got {:?}", other),
    }
}

// ============================================================================
// Queue
// ============================================================================

#[tokio::test]
async fn test_queue_runs_job_and_broadcasts_outcome() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let tenant = harness.seed_tenant("acme").await;

    queue.enqueue(harness.job_for(&tenant)).unwrap();
    assert!(queue.is_in_flight(tenant.id));

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.tenant_id, tenant.id);
    assert_eq!(outcome.attempt, 1);
    assert!(outcome.is_success());
    assert_eq!(queue.state(tenant.id), Some(JobState::Succeeded));

    queue.shutdown().await;
}

#[tokio::test]
async fn test_queue_rejects_duplicate_in_flight_job() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let tenant = harness.seed_tenant("acme").await;

    queue.enqueue(harness.job_for(&tenant)).unwrap();
    let err = queue.enqueue(harness.job_for(&tenant)).unwrap_err();
    assert!(matches!(err, TenancyError::ConflictError(_)));

    queue.shutdown().await;
    assert_eq!(queue.state(tenant.id), Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_queue_full_is_reported() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig {
        queue_depth: 1,
        ..QueueConfig::default()
    });
    let first = harness.seed_tenant("first").await;
    let second = harness.seed_tenant("second").await;

    // Nothing awaited in between, so the dispatcher has not drained the channel
    queue.enqueue(harness.job_for(&first)).unwrap();
    let err = queue.enqueue(harness.job_for(&second)).unwrap_err();

    assert!(matches!(err, TenancyError::QueueFull(1)));
    assert_eq!(queue.state(second.id), None);

    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_respects_rate_limit() {
    let harness = TestHarness::new();
    let window = Duration::from_secs(60);
    let queue = harness.start_queue(QueueConfig {
        rate_limit: 2,
        rate_window: window,
        concurrency: 4,
        queue_depth: 10,
    });
    let mut outcomes = queue.subscribe();
    let start = Instant::now();

    let mut tenants = Vec::new();
    for subdomain in ["one-co", "two-co", "three-co"] {
        let tenant = harness.seed_tenant(subdomain).await;
        queue.enqueue(harness.job_for(&tenant)).unwrap();
        tenants.push(tenant);
    }

    outcomes.recv().await.unwrap();
    outcomes.recv().await.unwrap();
    assert!(start.elapsed() < window);
    assert_eq!(queue.state(tenants[2].id), Some(JobState::Queued));

    let third = outcomes.recv().await.unwrap();
    assert_eq!(third.tenant_id, tenants[2].id);
    assert!(start.elapsed() >= window);

    queue.shutdown().await;
}

#[tokio::test]
async fn test_failed_job_can_be_requeued() {
    let harness = TestHarness::new();
    let queue = harness.start_queue(QueueConfig::default());
    let mut outcomes = queue.subscribe();
    let tenant = harness.seed_tenant("beta").await;
    harness.cluster.fail_on(Some("beta"), "CREATE TABLE");

    queue.enqueue(harness.job_for(&tenant)).unwrap();
    let failed = outcomes.recv().await.unwrap();
    assert_eq!(failed.state, JobState::RolledBack);
    assert_eq!(queue.state(tenant.id), Some(JobState::RolledBack));

    harness.cluster.clear_failures();
    queue.enqueue(harness.job_for(&tenant)).unwrap();
    let retried = outcomes.recv().await.unwrap();
    assert!(retried.is_success());
    assert_eq!(retried.attempt, 2);

    queue.shutdown().await;
}
