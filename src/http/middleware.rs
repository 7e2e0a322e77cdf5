//! Admission middleware for axum routes.
//!
//! Windows are keyed by identifier alone, so every guard sharing one store
//! bills the same window for a given caller. Give each policy its own store
//! (and engine) when one process enforces several:
//!
//! ```rust,ignore
//! let login = Arc::new(AdmissionEngine::new(Arc::new(MemoryStore::new())));
//! let guard = PolicyGuard::new(login, catalog.require("auth-strict")?);
//! let app = Router::new()
//!     .route("/login", post(login_handler))
//!     .route_layer(axum::middleware::from_fn_with_state(guard, enforce));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::trace;

use crate::ratelimit::{
    AdmissionEngine, CallerIdentity, Decision, Policy, RateLimitInfo, Rejection, RequestOrigin,
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Middleware state binding an engine to one policy.
#[derive(Clone)]
pub struct PolicyGuard {
    engine: Arc<AdmissionEngine>,
    policy: Arc<Policy>,
    trust_proxy: bool,
}

impl PolicyGuard {
    pub fn new(engine: Arc<AdmissionEngine>, policy: Arc<Policy>) -> Self {
        Self {
            engine,
            policy,
            trust_proxy: false,
        }
    }

    /// Take the caller address from the first `X-Forwarded-For` entry.
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Build the resolver input for a request.
///
/// The authenticated identity is whatever [`CallerIdentity`] the auth layer
/// stored in the request extensions. The address is the peer address, or the
/// first forwarded hop when `trust_proxy` is set.
pub fn request_origin(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> RequestOrigin {
    let caller = extensions.get::<CallerIdentity>().cloned();

    let forwarded = if trust_proxy {
        headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty())
    } else {
        None
    };

    let remote_addr = forwarded.or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });

    RequestOrigin {
        caller,
        remote_addr,
    }
}

/// Admit or reject a request under the guard's policy.
pub async fn enforce(State(guard): State<PolicyGuard>, request: Request, next: Next) -> Response {
    let origin = request_origin(request.headers(), request.extensions(), guard.trust_proxy);
    let identifier = origin.resolve(guard.policy.strategy());

    let decision = guard.engine.decide(identifier.as_ref(), &guard.policy).await;

    trace!(
        policy = %guard.policy.name(),
        decision = ?decision,
        "Admission decided"
    );

    match decision {
        Decision::Skipped(_) => next.run(request).await,
        Decision::Rejected(rejection) => rejection_response(&rejection),
        Decision::Admitted(info) => {
            let mut response = next.run(request).await;

            if let Some(ref identifier) = identifier {
                if guard.policy.refunds_status(response.status().as_u16()) {
                    guard.engine.release(identifier).await;
                }
            }

            apply_headers(response.headers_mut(), &info);
            response
        }
    }
}

/// The 429 response for a rejection.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(rejection.body())).into_response();

    let headers = response.headers_mut();
    apply_headers(headers, &rejection.info);
    headers.insert(RETRY_AFTER, HeaderValue::from(rejection.retry_after_secs));

    response
}

/// Write the `X-RateLimit-*` headers.
pub fn apply_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    for (name, value) in info.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
