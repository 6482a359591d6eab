//! Per-route authentication and rate limiting
//!
//! Runs as route middleware so it happens before any body extraction: an unauthenticated
//! request never touches a rate limit counter, and a rate-limited request is never validated
//! or forwarded.
use crate::auth::{ConstantTimeString, validate_api_key};
use crate::errors::GatewayError;
use crate::rate_limit::{FixedWindowLimiter, Route};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity used for callers whose address can't be determined.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Everything the middleware for one route needs.
#[derive(Clone, Debug)]
pub struct RouteGuard {
    pub route: Route,
    pub api_key: Arc<ConstantTimeString>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub trust_forwarded_for: bool,
}

/// Rejects unauthenticated or over-budget requests, and stamps the quota headers on the rest.
pub async fn enforce(State(guard): State<RouteGuard>, req: Request, next: Next) -> Response {
    if !validate_api_key(&guard.api_key, req.headers()) {
        debug!(route = %guard.route, "Rejecting request with missing or invalid api key");
        return GatewayError::Unauthorized.into_response();
    }

    let caller = caller_identity(&req, guard.trust_forwarded_for);
    let status = guard.limiter.check(guard.route, &caller);
    if !status.allowed {
        warn!(route = %guard.route, caller = %caller, "Rate limit exceeded");
        return GatewayError::RateLimited(status).into_response();
    }

    let mut response = next.run(req).await;
    status.apply_headers(response.headers_mut());
    response
}

/// The caller's IP: the first `X-Forwarded-For` hop when that header is trusted, otherwise the
/// peer address of the connection.
pub fn caller_identity(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(forwarded) = req
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    {
        return forwarded.to_owned();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CALLER.to_owned())
}
