//! Admission middleware.
//!
//! The transport-facing face of the limiter: derives a caller identifier and
//! policy tier from the inbound request, asks the orchestrator, and turns
//! the outcome into a response. All algorithmic weight stays in the limiter;
//! this layer only translates.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use crate::error::TurnstileError;
use crate::limit::{LimitDecision, Outcome, RateLimiter};

use super::tiers::TierMap;

/// Authenticated principal, inserted as a request extension by the host
/// application's auth layer. Preferred over the network address when
/// deriving the rate limit identifier.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

/// Shared state for the tier-driven admission middleware.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    tiers: Arc<TierMap>,
    fail_open: bool,
}

impl RateLimitState {
    /// Middleware state rejecting requests (503) when the store is down.
    pub fn new(limiter: Arc<RateLimiter>, tiers: Arc<TierMap>) -> Self {
        Self {
            limiter,
            tiers,
            fail_open: false,
        }
    }

    /// Choose what happens when the counter store is unreachable: admit the
    /// request (true) or reject with 503 (false, the default).
    pub fn fail_open(mut self, enabled: bool) -> Self {
        self.fail_open = enabled;
        self
    }
}

/// Tier-driven admission middleware for use with
/// `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let namespace = state.tiers.namespace_for(request.uri().path()).to_string();
    let identifier = derive_identifier(&request);

    match state.limiter.is_allowed(&identifier, &namespace, 1).await {
        Ok(Outcome::Allowed(decision)) => {
            let mut response = next.run(request).await;
            apply_limit_headers(&mut response, &decision);
            response
        }
        Ok(outcome) => {
            debug!(
                identifier = %identifier,
                namespace = %namespace,
                "Rejecting rate limited request"
            );
            deny_response(&outcome)
        }
        Err(TurnstileError::Store(err)) if state.fail_open => {
            error!(error = %err, "Counter store unavailable, admitting request");
            next.run(request).await
        }
        Err(TurnstileError::Store(err)) => {
            error!(error = %err, "Counter store unavailable, rejecting request");
            store_unavailable_response()
        }
        Err(err) => {
            error!(error = %err, "Rate limit evaluation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// A declarative per-route limit: budget plus key function, applied to a
/// single route.
#[derive(Clone)]
pub struct RouteLimit {
    limiter: Arc<RateLimiter>,
    namespace: String,
    key_fn: Arc<dyn Fn(&Request) -> String + Send + Sync>,
    exempt_when: Option<Arc<dyn Fn(&Request) -> bool + Send + Sync>>,
    fail_open: bool,
}

impl RouteLimit {
    /// Register `max_requests` per `window_seconds` under `name` and build
    /// the route state. `key_fn` derives the identifier from the request.
    pub fn new(
        limiter: Arc<RateLimiter>,
        name: impl Into<String>,
        max_requests: u64,
        window_seconds: u64,
        key_fn: impl Fn(&Request) -> String + Send + Sync + 'static,
    ) -> Self {
        let namespace = name.into();
        limiter.configure_limit(&namespace, max_requests, window_seconds, None, None);
        Self {
            limiter,
            namespace,
            key_fn: Arc::new(key_fn),
            exempt_when: None,
            fail_open: false,
        }
    }

    /// Skip limiting entirely when the predicate holds (admin bypass and
    /// the like).
    pub fn exempt_when(mut self, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        self.exempt_when = Some(Arc::new(predicate));
        self
    }

    /// Admit requests when the counter store is unreachable.
    pub fn fail_open(mut self, enabled: bool) -> Self {
        self.fail_open = enabled;
        self
    }
}

/// Per-route admission middleware for use with
/// `axum::middleware::from_fn_with_state`.
pub async fn route_limit_middleware(
    State(limit): State<RouteLimit>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(exempt) = &limit.exempt_when {
        if exempt(&request) {
            return next.run(request).await;
        }
    }
    let identifier = (limit.key_fn)(&request);

    match limit.limiter.is_allowed(&identifier, &limit.namespace, 1).await {
        Ok(Outcome::Allowed(decision)) => {
            let mut response = next.run(request).await;
            apply_limit_headers(&mut response, &decision);
            response
        }
        Ok(outcome) => deny_response(&outcome),
        Err(TurnstileError::Store(err)) if limit.fail_open => {
            error!(error = %err, "Counter store unavailable, admitting request");
            next.run(request).await
        }
        Err(TurnstileError::Store(err)) => {
            error!(error = %err, "Counter store unavailable, rejecting request");
            store_unavailable_response()
        }
        Err(err) => {
            error!(error = %err, "Rate limit evaluation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Identifier precedence: authenticated principal, forwarded client
/// address, then the peer address.
pub fn derive_identifier(request: &Request) -> String {
    if let Some(principal) = request.extensions().get::<Principal>() {
        return format!("user:{}", principal.0);
    }
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(client) = forwarded.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
            return format!("ip:{client}");
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

fn apply_limit_headers(response: &mut Response, decision: &LimitDecision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_time));
}

fn deny_response(outcome: &Outcome) -> Response {
    let message = match outcome {
        Outcome::DeniedBlocked(_) => "temporarily blocked",
        _ => "rate limit exceeded",
    };
    let decision = outcome.decision();
    let body = Json(json!({
        "error": message,
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset_time": decision.reset_time,
        "retry_after": decision.retry_after,
    }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    apply_limit_headers(&mut response, decision);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after));
    response
}

fn store_unavailable_response() -> Response {
    let body = Json(json!({
        "error": "admission control temporarily unavailable",
        "retry_after": 1,
    }));
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(1u64));
    response
}
