//! Health and admin endpoints for the rate limiter.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::middleware::{protect_admin_operations, with_rate_limit};
use crate::error::GuardError;
use crate::ratelimit::class;
use crate::ratelimit::RateLimiter;

/// Body of `POST /admin/rate-limit/reset`.
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub key: String,
}

/// Build the router exposing rate limit health and admin operations.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    let health = Router::new().route("/health/rate-limit", get(health));
    let health = with_rate_limit(health, &limiter, class::GENERAL);

    let admin = Router::new()
        .route("/admin/rate-limit/reset", post(reset_key))
        .route("/admin/rate-limit/reset-all", post(reset_all));
    let admin = protect_admin_operations(admin, &limiter);

    health.merge(admin).with_state(limiter)
}

async fn health(State(limiter): State<Arc<RateLimiter>>) -> Result<Json<Value>, GuardError> {
    let health = limiter.health()?;
    Ok(Json(json!({
        "success": true,
        "data": health,
    })))
}

async fn reset_key(
    State(limiter): State<Arc<RateLimiter>>,
    Json(body): Json<ResetRequest>,
) -> Json<Value> {
    let removed = limiter.reset(&body.key);
    Json(json!({
        "success": true,
        "data": { "key": body.key, "removed": removed },
    }))
}

async fn reset_all(State(limiter): State<Arc<RateLimiter>>) -> Json<Value> {
    let cleared = limiter.reset_all();
    Json(json!({
        "success": true,
        "data": { "cleared": cleared },
    }))
}
