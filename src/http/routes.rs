//! HTTP handlers for the rate limiting service.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::error::LimiterError;
use crate::ratelimit::{CheckRequest, CheckResponse, RateLimiter, Rule, RuleResolver, RuleSet};
use crate::store::{CircuitBreaker, RedisStore};

use super::correlation::correlation_middleware;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<RedisStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub rules: Arc<RuleResolver>,
    pub registry: Registry,
    pub service_name: String,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/check", post(check))
        .route("/v1/admin/rules", post(update_rule))
        .route("/rules", get(get_rules))
        .route("/health", get(health))
        .route("/circuit-breaker-status", get(breaker_status))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state)
}

/// Error wrapper mapping [`LimiterError`] kinds onto HTTP status codes.
pub struct ApiError(LimiterError);

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LimiterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LimiterError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal error");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let response = state.limiter.check(&req).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    store_available: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_available = state.store.ping().await.is_ok();
    Json(HealthResponse {
        status: if store_available { "healthy" } else { "degraded" },
        service: state.service_name.clone(),
        store_available,
    })
}

#[derive(Debug, Serialize)]
struct BreakerStatusResponse {
    state: &'static str,
    failure_count: u32,
    time_until_retry_seconds: u64,
}

async fn breaker_status(State(state): State<AppState>) -> Json<BreakerStatusResponse> {
    let status = state.breaker.status();
    Json(BreakerStatusResponse {
        state: status.state.as_str(),
        failure_count: status.failure_count,
        time_until_retry_seconds: status.seconds_until_retry,
    })
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|e| LimiterError::Internal(format!("metrics encoding failed: {e}")))?;
    let body = String::from_utf8(buffer)
        .map_err(|e| LimiterError::Internal(format!("metrics encoding failed: {e}")))?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], body).into_response())
}

/// Request to update a rate limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRuleRequest {
    pub client_id: String,
    pub rate: u64,
    pub window: u64,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Information about a rate limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub client_id: String,
    pub rate: u64,
    pub window: u64,
    pub endpoint: Option<String>,
}

async fn update_rule(
    State(state): State<AppState>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<RuleInfo>, ApiError> {
    if req.client_id.is_empty() {
        return Err(LimiterError::BadRequest("client_id must not be empty".to_string()).into());
    }
    if req.rate == 0 || req.window == 0 {
        return Err(
            LimiterError::BadRequest("rate and window must be positive".to_string()).into(),
        );
    }

    state.rules.upsert(
        &req.client_id,
        req.endpoint.as_deref(),
        Rule {
            rate: req.rate,
            window: req.window,
        },
    );
    info!(
        client_id = %req.client_id,
        endpoint = ?req.endpoint,
        rate = req.rate,
        window = req.window,
        "rate limit rule updated"
    );

    Ok(Json(RuleInfo {
        client_id: req.client_id,
        rate: req.rate,
        window: req.window,
        endpoint: req.endpoint,
    }))
}

async fn get_rules(State(state): State<AppState>) -> Json<RuleSet> {
    Json(RuleSet::clone(&state.rules.snapshot()))
}
