//! Health Check Module
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `/health` - Basic health check (returns "ok")
//! - `/ready` - Readiness probe (checks the control-plane database)
//! - `/live` - Liveness probe (always returns healthy if the process is running)
//!
//! # Usage
//!
//! Kubernetes probes should be configured as:
//! ```yaml
//! livenessProbe:
//!   httpGet:
//!     path: /live
//!     port: 8080
//! readinessProbe:
//!   httpGet:
//!     path: /ready
//!     port: 8080
//!   periodSeconds: 5
//! ```

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tenantry_storage::DatabasePool;

use crate::AppState;

/// Health check response with detailed status
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ComponentHealth>,
    /// Live tenant pools / cache capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_pools: Option<PoolUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Component health status
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PoolUsage {
    pub cached: usize,
    pub capacity: usize,
}

/// Basic health check, suitable for load balancers.
pub async fn health_check() -> &'static str {
    "ok"
}

/// Liveness probe: succeeds while the process is alive.
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: HealthStatus::Healthy,
            control_plane: None,
            tenant_pools: None,
            message: Some("Service is alive".to_string()),
        }),
    )
}

/// Readiness probe: the control-plane database must answer.
///
/// Tenant databases are not checked; one unreachable tenant must not take the
/// whole service out of rotation.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let control_plane = match check_control_plane(&state).await {
        Ok(latency_ms) => ComponentHealth {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        },
        Err(e) => ComponentHealth {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(e),
        },
    };

    let status = control_plane.status;
    let status_code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let stats = state.pools.stats();
    let response = HealthResponse {
        status,
        control_plane: Some(control_plane),
        tenant_pools: Some(PoolUsage {
            cached: stats.size,
            capacity: stats.capacity,
        }),
        message: Some(
            if status == HealthStatus::Healthy {
                "Service is ready"
            } else {
                "Service is not ready"
            }
            .to_string(),
        ),
    };

    tracing::debug!(status = ?status, "Readiness check completed");

    (status_code, Json(response))
}

async fn check_control_plane(state: &AppState) -> Result<u64, String> {
    let start = std::time::Instant::now();

    let pool = state
        .pools
        .get_admin_pool()
        .await
        .map_err(|e| format!("Failed to get connection: {}", e))?;

    pool.ping()
        .await
        .map_err(|e| format!("Database query failed: {}", e))?;

    Ok(start.elapsed().as_millis() as u64)
}
