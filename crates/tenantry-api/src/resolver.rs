//! Tenant Resolver
//!
//! The single choke point every inbound request passes through before any
//! tenant-scoped work: it works out which tenant the request is for, checks
//! that the tenant can be served, and binds that tenant's connection for the
//! rest of request handling.
//!
//! # Resolution order
//!
//! 1. `Authorization: Bearer <jwt>` whose `sub` is the tenant id
//! 2. `X-Tenant-Subdomain` header
//! 3. First label of the `Host` header (`acme.example.com` → `acme`)
//!
//! # Error Responses
//!
//! - 401 Unauthorized: missing credentials, invalid or expired token
//! - 403 Forbidden: unknown, inactive, or deleted tenant
//! - 503 Service Unavailable: tenant database still being set up, or unreachable

use crate::http::ApiError;
use crate::registry::TenantRegistry;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tenantry_core::{Result, TenancyError, TenantFilter, TenantRecord};
use tenantry_storage::{context, Subdomain, TenantConnection, TenantPoolCache};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header naming the tenant explicitly.
pub const TENANT_SUBDOMAIN_HEADER: &str = "x-tenant-subdomain";

/// Claims carried by a tenant access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Tenant id (UUID string)
    pub sub: String,
    pub subdomain: String,
    /// Issued-at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Issues and verifies HS256 tenant access tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Sign a token for `tenant_id` valid for `ttl`.
    pub fn issue(&self, tenant_id: Uuid, subdomain: &str, ttl: chrono::Duration) -> Result<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: tenant_id.to_string(),
            subdomain: subdomain.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TenancyError::Crypto(format!("JWT encode: {}", e)))
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub", "exp", "iat"]);

        jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    TenancyError::AuthError("Token has expired".into())
                }
                _ => TenancyError::AuthError(format!("Invalid token: {}", e)),
            })
    }
}

/// Maps requests to bound tenant connections.
pub struct TenantResolver {
    registry: TenantRegistry,
    pools: Arc<TenantPoolCache>,
    tokens: TokenVerifier,
}

impl TenantResolver {
    pub fn new(registry: TenantRegistry, pools: Arc<TenantPoolCache>, tokens: TokenVerifier) -> Self {
        Self {
            registry,
            pools,
            tokens,
        }
    }

    pub fn tokens(&self) -> &TokenVerifier {
        &self.tokens
    }

    /// Verify a bearer token and return the tenant it names.
    ///
    /// # Errors
    ///
    /// `AuthError` if the token is invalid, expired, or its subject is not a
    /// tenant id.
    pub fn resolve_by_token(&self, token: &str) -> Result<(Uuid, String)> {
        let claims = self.tokens.verify(token)?;
        let tenant_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| TenancyError::AuthError("Token subject is not a tenant id".into()))?;
        Ok((tenant_id, claims.subdomain))
    }

    /// Active, non-deleted tenant for a subdomain.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such tenant exists or it is inactive.
    pub async fn resolve_by_subdomain(&self, subdomain: &str) -> Result<TenantRecord> {
        let tenant = self
            .registry
            .find_one(&TenantFilter::by_subdomain(subdomain).with_active(true))
            .await?
            .ok_or_else(|| TenancyError::NotFound(subdomain.to_string()))?;
        Ok(tenant)
    }

    /// Build the connection for a tenant, creating its pool on first use.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the tenant is missing, deleted, or inactive
    /// - `NotProvisioned` if its database has not been created yet; no pool
    ///   construction is attempted in that case
    /// - `ConnectionError` if the pool cannot be opened
    pub async fn establish(&self, tenant_id: Uuid) -> Result<TenantConnection> {
        let tenant = self.registry.get(tenant_id).await?;

        if !tenant.is_active {
            return Err(TenancyError::NotFound(tenant_id.to_string()));
        }
        if !tenant.is_provisioned() {
            debug!(tenant_id = %tenant_id, "Tenant database not provisioned yet");
            return Err(TenancyError::NotProvisioned(tenant.subdomain_name));
        }

        let pool = self.pools.get_or_create(tenant_id).await?;
        Ok(TenantConnection::new(tenant_id, tenant.subdomain_name, pool))
    }

    /// Establish the tenant's connection and run `work` with it bound.
    pub async fn scope<F>(&self, tenant_id: Uuid, work: F) -> Result<F::Output>
    where
        F: Future,
    {
        let connection = self.establish(tenant_id).await?;
        Ok(context::bind(connection, work).await)
    }

    /// Work out the tenant a request is for, without touching any pool.
    pub async fn identify(&self, headers: &HeaderMap) -> Result<Uuid> {
        if let Some(token) = bearer_token(headers) {
            let (tenant_id, subdomain) = self.resolve_by_token(token)?;
            debug!(tenant_id = %tenant_id, subdomain = %subdomain, "Resolved tenant from token");
            return Ok(tenant_id);
        }

        let subdomain = match header_str(headers, TENANT_SUBDOMAIN_HEADER) {
            Some(value) => Subdomain::new(value.trim().to_ascii_lowercase())
                .map_err(|_| TenancyError::NotFound(value.to_string()))?,
            None => {
                let host = header_str(headers, HOST.as_str())
                    .ok_or_else(|| TenancyError::AuthError("No tenant credentials".into()))?;
                Subdomain::from_host(host)
                    .map_err(|_| TenancyError::AuthError("No tenant credentials".into()))?
            }
        };

        let tenant = self.resolve_by_subdomain(subdomain.as_str()).await?;
        debug!(tenant_id = %tenant.id, subdomain = %subdomain, "Resolved tenant from subdomain");
        Ok(tenant.id)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the tenant and bind its connection around the rest of the request.
///
/// Handlers below reach the connection with [`context::current`].
pub async fn tenant_context_middleware(
    State(resolver): State<Arc<TenantResolver>>,
    req: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let tenant_id = resolver.identify(req.headers()).await.map_err(|e| {
        debug!(error = %e, path = %req.uri().path(), "Tenant resolution failed");
        ApiError::from(e)
    })?;

    let connection = resolver.establish(tenant_id).await.map_err(|e| {
        if !matches!(e, TenancyError::NotProvisioned(_)) {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to establish tenant connection");
        }
        ApiError::from(e)
    })?;

    Ok(context::bind(connection, next.run(req)).await)
}
