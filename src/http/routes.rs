//! Introspection endpoints.
//!
//! [`introspection_router`] is read-only. Resetting a window lives on
//! [`admin_router`], which the embedding application mounts behind its own
//! authorization.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::middleware::{enforce, request_origin, PolicyGuard};
use crate::error::TollgateError;
use crate::ratelimit::identifier::normalize_address;
use crate::ratelimit::{Policy, PolicyCatalog, UsageService, WindowStore};

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Failures of the introspection endpoints.
#[derive(Debug)]
pub enum ApiError {
    UnknownPolicy(String),
    Unresolvable,
    Backend(TollgateError),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    error: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::UnknownPolicy(name) => (
                StatusCode::NOT_FOUND,
                "POLICY_NOT_FOUND",
                format!("Unknown rate limit policy '{}'", name),
            ),
            ApiError::Unresolvable => (
                StatusCode::BAD_REQUEST,
                "IDENTIFIER_UNRESOLVABLE",
                "Could not determine the caller identifier".to_string(),
            ),
            ApiError::Backend(e) => {
                warn!(error = %e, "Usage introspection failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "Usage data is temporarily unavailable".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                message,
                error,
            }),
        )
            .into_response()
    }
}

impl From<TollgateError> for ApiError {
    fn from(e: TollgateError) -> Self {
        ApiError::Backend(e)
    }
}

/// Shared state of the introspection routes.
#[derive(Clone)]
pub struct IntrospectionState {
    usage: Arc<UsageService>,
    store: Arc<dyn WindowStore>,
    catalog: Arc<PolicyCatalog>,
    default_policy: String,
    recent_limit: usize,
    trust_proxy: bool,
}

impl IntrospectionState {
    pub fn new(
        usage: Arc<UsageService>,
        store: Arc<dyn WindowStore>,
        catalog: Arc<PolicyCatalog>,
        default_policy: impl Into<String>,
    ) -> Self {
        Self {
            usage,
            store,
            catalog,
            default_policy: default_policy.into(),
            recent_limit: 10,
            trust_proxy: false,
        }
    }

    /// Rows of recent activity returned when the request does not say.
    pub fn recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    fn policy(&self, requested: Option<&str>) -> Result<Arc<Policy>, ApiError> {
        let name = requested.unwrap_or(&self.default_policy);
        self.catalog
            .get(name)
            .ok_or_else(|| ApiError::UnknownPolicy(name.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub policy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ResetOutcome {
    pub identifier: String,
    pub removed: bool,
}

/// Read-only routes under `/rate-limit`.
pub fn introspection_router(state: IntrospectionState) -> Router {
    Router::new()
        .route("/rate-limit/usage", get(own_usage))
        .route("/rate-limit/usage/{identifier}", get(identifier_usage))
        .route("/rate-limit/stats", get(global_stats))
        .with_state(state)
}

/// Mutating routes. Not mounted by [`service_router`].
pub fn admin_router(state: IntrospectionState) -> Router {
    Router::new()
        .route("/rate-limit/usage/{identifier}", delete(reset_usage))
        .with_state(state)
}

/// The router the binary serves: introspection guarded by `guard`, plus an
/// unguarded `/health`.
pub fn service_router(state: IntrospectionState, guard: PolicyGuard) -> Router {
    introspection_router(state)
        .route_layer(axum::middleware::from_fn_with_state(guard, enforce))
        .route("/health", get(health))
}

/// Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn own_usage(
    State(state): State<IntrospectionState>,
    Query(query): Query<UsageQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let policy = state.policy(query.policy.as_deref())?;
    let origin = request_origin(request.headers(), request.extensions(), state.trust_proxy);
    let identifier = origin
        .resolve(policy.strategy())
        .ok_or(ApiError::Unresolvable)?;

    let report = state.usage.usage(&identifier.key, &policy).await?;
    Ok(ApiResponse::ok(report).into_response())
}

async fn identifier_usage(
    State(state): State<IntrospectionState>,
    Path(identifier): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, ApiError> {
    let policy = state.policy(query.policy.as_deref())?;
    let report = state.usage.usage(&store_key(&identifier), &policy).await?;
    Ok(ApiResponse::ok(report).into_response())
}

async fn global_stats(
    State(state): State<IntrospectionState>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(state.recent_limit);
    let stats = state.usage.global_stats(limit).await?;
    Ok(ApiResponse::ok(stats).into_response())
}

async fn reset_usage(
    State(state): State<IntrospectionState>,
    Path(identifier): Path<String>,
) -> Result<Response, ApiError> {
    let identifier = store_key(&identifier);
    let removed = state
        .store
        .reset(&identifier)
        .await
        .map_err(TollgateError::from)?;

    info!(identifier = %identifier, removed = removed, "Usage window reset");

    Ok(ApiResponse::ok(ResetOutcome {
        identifier,
        removed,
    })
    .into_response())
}

/// Store key for an identifier named in a path.
///
/// Addresses are normalized the way the resolver keys them, so `127.0.0.1`,
/// `::1` and `localhost` name the same window. User ids pass through as is.
fn store_key(raw: &str) -> String {
    if raw.trim().parse::<IpAddr>().is_ok() {
        if let Some(key) = normalize_address(raw) {
            return key;
        }
    }
    raw.to_string()
}
