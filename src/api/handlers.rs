use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::{AccountId, Mode, SubscriptionRecord, Token};
use crate::errors::{GatewayError, Result};
use crate::executor::{OrderRequest, Task};

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub token: Token,
    pub mode: Mode,
}

pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<SubscriptionRecord>> {
    state.streaming.add(req.token, req.mode).await?;
    let record = state
        .subscriptions
        .get(req.token)
        .await?
        .ok_or_else(|| GatewayError::Fatal("subscription vanished after add".into()))?;
    Ok(Json(record))
}

pub async fn remove_subscription(
    State(state): State<Arc<AppState>>,
    Path(token): Path<Token>,
) -> Result<Json<serde_json::Value>> {
    state.streaming.remove(token).await?;
    Ok(Json(serde_json::json!({ "token": token, "status": "removed" })))
}

pub async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SubscriptionRecord>>> {
    Ok(Json(state.subscriptions.list_all().await?))
}

#[derive(Deserialize)]
pub struct SubmitOrderRequest {
    pub idempotency_key: String,
    pub account_id: AccountId,
    pub instrument_token: Token,
    pub side: String,
    pub quantity: u64,
    pub order_type: String,
    pub price: Option<f64>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub state: &'static str,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self { task_id: t.task_id, state: t.state.as_str(), attempt: t.attempt, last_error: t.last_error }
    }
}

pub async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitOrderRequest>,
) -> Result<Json<TaskResponse>> {
    let request = OrderRequest {
        account_id: req.account_id,
        instrument_token: req.instrument_token,
        side: req.side,
        quantity: req.quantity,
        order_type: req.order_type,
        price: req.price,
    };
    let task = state.executor.submit(&req.idempotency_key, request).await?;
    Ok(Json(task.into()))
}

pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>> {
    let task = state
        .executor
        .get(&task_id)
        .await?
        .ok_or_else(|| GatewayError::Validation(format!("unknown task {task_id}")))?;
    Ok(Json(task.into()))
}

pub async fn retry_order(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.executor.retry_dead_letter(&task_id).await?;
    Ok(Json(serde_json::json!({ "task_id": task_id, "status": "requeued" })))
}

#[derive(Serialize)]
pub struct DepsHealth {
    pub bus: &'static str,
    pub store: &'static str,
    pub registry: &'static str,
}

#[derive(Serialize)]
pub struct TickerHealth {
    pub running: bool,
    /// Includes subscriptions not yet assigned to an account; see
    /// `unassigned_subscriptions` to isolate that count.
    pub active_subscriptions: usize,
    pub unassigned_subscriptions: usize,
    pub per_account: std::collections::HashMap<AccountId, usize>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub market_open: bool,
    pub uptime_seconds: u64,
    pub deps: DepsHealth,
    pub ticker: TickerHealth,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let subs = state.subscriptions.list_active().await?;
    let unassigned = subs.iter().filter(|s| s.account_id.is_none()).count();

    let mut per_account: std::collections::HashMap<AccountId, usize> = std::collections::HashMap::new();
    for sub in &subs {
        if let Some(account_id) = &sub.account_id {
            *per_account.entry(account_id.clone()).or_insert(0) += 1;
        }
    }

    Ok(Json(HealthResponse {
        status: "ok",
        market_open: state.calendar.is_market_open(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        deps: DepsHealth { bus: "ok", store: "ok", registry: "ok" },
        ticker: TickerHealth { running: true, active_subscriptions: subs.len(), unassigned_subscriptions: unassigned, per_account },
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
