//! Axum middleware wrapping the rate limiter and size guard.
//!
//! Layers are attached with `route_layer`, so they must be added after the
//! routes they protect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceBuilder;
use tracing::warn;

use crate::error::GuardError;
use crate::ratelimit::class;
use crate::ratelimit::{
    check_content_length, Decision, RateLimitHeaders, RateLimitKey, RateLimiter,
    RequestDescriptor, SizeBucket,
};

/// Requests slower than this are logged.
const SLOW_REQUEST: Duration = Duration::from_secs(2);
/// Keys with more recorded requests than this are logged.
const HIGH_FREQUENCY_REQUESTS: usize = 50;

/// Identity of the caller, inserted into request extensions by upstream
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Collect the attributes the limiter keys on.
pub fn request_descriptor(request: &Request) -> RequestDescriptor {
    let headers = request.headers();
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let forwarded_ip = header_str("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str("x-real-ip").map(str::trim))
        .map(str::to_string);

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());

    RequestDescriptor {
        forwarded_ip,
        remote_addr,
        user_agent,
        user_id,
    }
}

/// Middleware state: the limiter plus the class the route belongs to.
#[derive(Clone)]
pub struct ClassGuard {
    limiter: Arc<RateLimiter>,
    class: Arc<str>,
}

impl ClassGuard {
    pub fn new(limiter: Arc<RateLimiter>, class: &str) -> Self {
        Self {
            limiter,
            class: Arc::from(class),
        }
    }
}

/// Set the `X-RateLimit-*` headers unless a limiter closer to the handler
/// already did.
fn apply_headers(response: &mut Response, headers: &RateLimitHeaders) {
    if response.headers().contains_key(RateLimitHeaders::LIMIT) {
        return;
    }
    for (name, value) in headers.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
    }
}

/// Rate limit a route under the class held by `guard`.
pub async fn rate_limit(State(guard): State<ClassGuard>, request: Request, next: Next) -> Response {
    let descriptor = request_descriptor(&request);

    let decision = match guard.limiter.check(&descriptor, &guard.class) {
        Ok(decision) => decision,
        Err(e) => return e.into_response(),
    };

    match decision {
        Decision::Bypassed => next.run(request).await,
        Decision::Denied { headers, error } => {
            warn!(
                class = %guard.class,
                ip = %descriptor.client_ip(),
                reset_in = error.reset_in,
                "Rate limit exceeded"
            );
            let mut response = GuardError::from(error).into_response();
            apply_headers(&mut response, &headers);
            response
        }
        Decision::Allowed {
            headers,
            key,
            recorded_at,
            skip_successful,
        } => {
            let mut response = next.run(request).await;
            if skip_successful && response.status().is_success() {
                guard.limiter.release(&key, recorded_at);
            }
            apply_headers(&mut response, &headers);
            response
        }
    }
}

/// Reject requests whose declared body exceeds `bucket`.
pub async fn size_limit(State(bucket): State<SizeBucket>, request: Request, next: Next) -> Response {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = check_content_length(declared, bucket) {
        warn!(
            limit = e.limit,
            actual = e.actual_size,
            "Request body exceeds size limit"
        );
        return GuardError::from(e).into_response();
    }

    next.run(request).await
}

/// Report the store size to the adaptive controller.
pub async fn adaptive(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    limiter.observe_load();
    next.run(request).await
}

/// Log slow requests and high-frequency callers.
pub async fn request_metrics(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let key = RateLimitKey::derive(&request_descriptor(&request), class::GENERAL).to_string_key();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    if elapsed > SLOW_REQUEST {
        warn!(
            method = %method,
            path = %path,
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow request detected"
        );
    }

    if let Some(count) = limiter.request_count(&key) {
        if count > HIGH_FREQUENCY_REQUESTS {
            warn!(key = %key, requests = count, "High frequency requests");
        }
    }

    response
}

/// Rate limit every route of `router` under `class`.
pub fn with_rate_limit<S>(router: Router<S>, limiter: &Arc<RateLimiter>, class: &str) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(
        ClassGuard::new(limiter.clone(), class),
        rate_limit,
    ))
}

/// Reject bodies larger than `bucket` on every route of `router`.
pub fn with_size_limit<S>(router: Router<S>, bucket: SizeBucket) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(bucket, size_limit))
}

/// Order creation: size guard (5mb), load shedding, `order_create` limit,
/// then request metrics.
pub fn protect_order_creation<S>(router: Router<S>, limiter: &Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(
        ServiceBuilder::new()
            .layer(from_fn_with_state(SizeBucket::FiveMb, size_limit))
            .layer(from_fn_with_state(limiter.clone(), adaptive))
            .layer(from_fn_with_state(
                ClassGuard::new(limiter.clone(), class::ORDER_CREATE),
                rate_limit,
            ))
            .layer(from_fn_with_state(limiter.clone(), request_metrics)),
    )
}

/// Admin operations: `admin_operations` limit, then request metrics.
pub fn protect_admin_operations<S>(router: Router<S>, limiter: &Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(
        ServiceBuilder::new()
            .layer(from_fn_with_state(
                ClassGuard::new(limiter.clone(), class::ADMIN_OPERATIONS),
                rate_limit,
            ))
            .layer(from_fn_with_state(limiter.clone(), request_metrics)),
    )
}
