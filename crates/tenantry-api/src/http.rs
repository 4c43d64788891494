//! HTTP surface.
//!
//! | Method | Path | Guard |
//! |--------|------|-------|
//! | POST | `/api/v1/signup` | none |
//! | POST | `/api/v1/signup/verify` | none |
//! | GET | `/api/v1/tenant` | tenant context |
//! | POST | `/api/v1/admin/delta` | admin token |
//! | POST | `/api/v1/admin/tenants/:id/provision` | admin token |
//! | GET | `/api/v1/admin/tenants/:id/provisioning` | admin token |
//! | GET | `/health`, `/live`, `/ready` | none |

use crate::delta::DeltaReport;
use crate::onboarding::{Registration, SignupRequest};
use crate::provisioning::JobState;
use crate::resolver::tenant_context_middleware;
use crate::{health, AppState};
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tenantry_core::secrets::constant_time_eq;
use tenantry_core::{DeltaScript, TenancyError, TenantFilter, TenantRecord};
use tenantry_storage::{context, DatabasePool};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Lifetime of access tokens issued on verification
const ACCESS_TOKEN_TTL_HOURS: i64 = 12;

/// Seconds clients should wait before retrying a 503
const RETRY_AFTER_SECS: &str = "30";

// ============================================================================
// Errors
// ============================================================================

/// Error response with a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TenancyError> for ApiError {
    fn from(err: TenancyError) -> Self {
        let status = match &err {
            TenancyError::ValidationError(_) => StatusCode::BAD_REQUEST,
            TenancyError::AuthError(_) => StatusCode::UNAUTHORIZED,
            TenancyError::NotFound(_) => StatusCode::FORBIDDEN,
            TenancyError::ConflictError(_) => StatusCode::CONFLICT,
            TenancyError::NotProvisioned(_)
            | TenancyError::ConnectionError { .. }
            | TenancyError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &err {
            TenancyError::NotProvisioned(_) => "Tenant database is still being set up".to_string(),
            TenancyError::ConnectionError { .. } => "Tenant database is unavailable".to_string(),
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %err, "Request failed");
                "Internal server error".to_string()
            }
            _ => err.to_string(),
        };

        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            (self.status, [(RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/api/v1/tenant", get(current_tenant))
        .route_layer(middleware::from_fn_with_state(
            state.resolver.clone(),
            tenant_context_middleware,
        ));

    let admin_routes = Router::new()
        .route("/api/v1/admin/delta", post(apply_delta))
        .route("/api/v1/admin/tenants/:id/provision", post(provision_tenant))
        .route("/api/v1/admin/tenants/:id/provisioning", get(provisioning_state))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .route("/api/v1/signup", post(signup))
        .route("/api/v1/signup/verify", post(verify_signup))
        .route("/health", get(health::health_check))
        .route("/live", get(health::liveness_check))
        .route("/ready", get(health::readiness_check))
        .merge(tenant_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject admin requests without the configured operator token.
async fn require_admin_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> ApiResult<Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Admin routes are disabled"));
    };

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if !presented.is_some_and(|token| constant_time_eq(token, expected)) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid admin token"));
    }

    Ok(next.run(req).await)
}

// ============================================================================
// Handlers
// ============================================================================

async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    let registration = state.onboarding.register(request).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    subdomain: String,
    otp: String,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    tenant: TenantRecord,
    access_token: String,
}

async fn verify_signup(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<Json<VerifyResponse>> {
    let tenant = state
        .onboarding
        .verify(&request.subdomain, &request.otp)
        .await?;
    let access_token = state.resolver.tokens().issue(
        tenant.id,
        &tenant.subdomain_name,
        chrono::Duration::hours(ACCESS_TOKEN_TTL_HOURS),
    )?;
    Ok(Json(VerifyResponse {
        tenant,
        access_token,
    }))
}

#[derive(Debug, Serialize)]
struct CurrentTenant {
    tenant_id: Uuid,
    subdomain: String,
    database: String,
}

/// Reads the tenant connection bound by the middleware.
async fn current_tenant() -> ApiResult<Json<CurrentTenant>> {
    let connection = context::current()?;
    connection.pool().ping().await?;
    Ok(Json(CurrentTenant {
        tenant_id: connection.tenant_id(),
        subdomain: connection.subdomain().to_string(),
        database: connection.pool().database().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeltaRequest {
    name: String,
    sql: String,
    #[serde(default)]
    tenant_id: Option<Uuid>,
    #[serde(default)]
    include_inactive: bool,
}

async fn apply_delta(
    State(state): State<AppState>,
    Json(request): Json<DeltaRequest>,
) -> ApiResult<Json<DeltaReport>> {
    if request.sql.trim().is_empty() {
        return Err(TenancyError::ValidationError("sql is required".into()).into());
    }

    let mut filter = if request.include_inactive {
        TenantFilter::all()
    } else {
        TenantFilter::active()
    };
    filter.id = request.tenant_id;

    let script = DeltaScript::new(request.name, request.sql);
    let report = state.delta.apply(&script, &filter).await?;
    info!(script = %report.script, failed = report.failed.len(), "Delta rollout requested over HTTP");
    Ok(Json(report))
}

async fn provision_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.onboarding.reprovision(tenant_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "tenant_id": tenant_id, "state": JobState::Queued })),
    ))
}

async fn provisioning_state(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant = state.registry.get(tenant_id).await?;
    Ok(Json(json!({
        "tenant_id": tenant_id,
        "lifecycle": tenant.lifecycle(),
        "job": state.queue.state(tenant_id),
        "database_created_on": tenant.database_created_on,
        "provisioning_error": tenant.provisioning_error,
    })))
}
