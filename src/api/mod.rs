//! Control plane: a thin axum router over the streaming and
//! executor internals. Authentication here is intentionally minimal — a
//! single shared-secret header check — per the documented decision that
//! full auth/session management sits outside this gateway.

mod handlers;
mod middleware;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::accounts::AccountOrchestrator;
use crate::clock::MarketCalendar;
use crate::config::Config;
use crate::executor::Executor;
use crate::middleware::logging::request_logging;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
use crate::streaming::StreamingOrchestrator;
use crate::subscriptions::SubscriptionStore;

pub struct AppState {
    pub config: Arc<Config>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub streaming: Arc<StreamingOrchestrator>,
    pub executor: Arc<Executor>,
    pub accounts: Arc<AccountOrchestrator>,
    pub calendar: Arc<MarketCalendar>,
    pub metrics_handle: PrometheusHandle,
    pub started_at: Instant,
}

/// Control-plane rate limiting is per source IP, independent of the
/// per-account/per-endpoint-class limiter that governs broker-facing
/// subscribe/order traffic.
pub fn router(state: Arc<AppState>) -> Router {
    let api_key_enabled = state.config.api_key_enabled;
    let api_key = state.config.api_key.clone();
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    let protected = Router::new()
        .route("/subscriptions", post(handlers::create_subscription).get(handlers::list_subscriptions))
        .route("/subscriptions/:token", delete(handlers::remove_subscription))
        .route("/orders", post(handlers::submit_order))
        .route("/orders/:task_id", get(handlers::get_order))
        .route("/orders/:task_id/retry", post(handlers::retry_order))
        .layer(axum::middleware::from_fn(move |req, next| {
            middleware::api_key_guard(api_key_enabled, api_key.clone(), req, next)
        }));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
