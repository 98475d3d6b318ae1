//! Order executor.
//!
//! Durable, idempotent task queue: `submit()` hashes the caller-supplied
//! idempotency key and upserts a row, a single worker loop claims PENDING
//! rows with a compare-and-swap on `row_version` (so concurrent claim
//! attempts from a crash-restarted worker can't double-run a task),
//! executes through the account orchestrator and a circuit breaker, and
//! retries with exponential backoff with full jitter up to
//! `executor_max_attempts` before moving a task to DEAD_LETTER.

mod store;

pub use store::TaskStore;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::accounts::AccountOrchestrator;
use crate::circuit::CircuitBreaker;
use crate::domain::AccountId;
use crate::errors::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    DeadLetter,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Retrying => "RETRYING",
            TaskState::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => TaskState::Running,
            "COMPLETED" => TaskState::Completed,
            "FAILED" => TaskState::Failed,
            "RETRYING" => TaskState::Retrying,
            "DEAD_LETTER" => TaskState::DeadLetter,
            _ => TaskState::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub instrument_token: u64,
    pub side: String,
    pub quantity: u64,
    pub order_type: String,
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub idempotency_hash: String,
    pub state: TaskState,
    pub attempt: u32,
    pub row_version: i64,
    pub request: OrderRequest,
    pub last_error: Option<String>,
}

pub fn idempotency_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait::async_trait]
pub trait OrderBroker: Send + Sync {
    async fn place_order(&self, account_id: &AccountId, request: &OrderRequest) -> Result<String>;
}

pub struct Executor {
    store: Arc<TaskStore>,
    accounts: Arc<AccountOrchestrator>,
    broker: Arc<dyn OrderBroker>,
    circuit: CircuitBreaker,
    max_attempts: u32,
}

impl Executor {
    pub fn new(
        store: Arc<TaskStore>,
        accounts: Arc<AccountOrchestrator>,
        broker: Arc<dyn OrderBroker>,
        circuit_failure_threshold: u32,
        circuit_recovery: Duration,
        circuit_success_threshold: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            accounts,
            broker,
            circuit: CircuitBreaker::new(circuit_failure_threshold, circuit_success_threshold, circuit_recovery),
            max_attempts,
        }
    }

    /// Idempotent: resubmitting the same idempotency key returns the
    /// existing task rather than creating a duplicate.
    pub async fn submit(&self, idempotency_key: &str, request: OrderRequest) -> Result<Task> {
        let hash = idempotency_hash(idempotency_key);
        if let Some(existing) = self.store.find_by_hash(&hash).await? {
            return Ok(existing);
        }
        let task_id = uuid::Uuid::new_v4().to_string();
        self.store.insert(&task_id, &hash, request).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get(task_id).await
    }

    /// Operator-triggered retry out of DEAD_LETTER. Per design decision,
    /// dead-lettered tasks are never retried automatically.
    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<()> {
        self.store.reset_for_retry(task_id).await
    }

    /// Demotes any RUNNING task back to RETRYING with a short grace delay,
    /// for the case where the previous process crashed mid-execution and
    /// never recorded an outcome.
    pub async fn recover_orphaned_running_tasks(&self) -> Result<usize> {
        self.store.demote_running_to_retrying().await
    }

    async fn drain_ready_once(&self) -> Result<()> {
        while let Some(task) = self.store.claim_next_ready().await? {
            self.execute_task(task).await;
        }
        Ok(())
    }

    async fn execute_task(&self, task: Task) {
        if !self.circuit.allow() {
            let _ = self.store.schedule_retry(&task, backoff_with_full_jitter(task.attempt)).await;
            return;
        }

        // The account is part of the task's own identity (the idempotency key
        // hashes account_id in), so leases here are never transferable: a
        // failover substitution would execute the order against a different
        // account's credentials and margin than the one the caller asked for.
        let lease = match self.accounts.borrow(&task.request.account_id).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(task_id = %task.task_id, account_id = %task.request.account_id, error = %e, "account unavailable for task");
                let _ = self.store.schedule_retry(&task, backoff_with_full_jitter(task.attempt)).await;
                return;
            }
        };

        match self.broker.place_order(&lease.account_id, &task.request).await {
            Ok(broker_order_id) => {
                self.circuit.record_success();
                let _ = self.store.mark_completed(&task.task_id, &broker_order_id).await;
            }
            Err(e) => {
                self.circuit.record_failure();
                if task.attempt + 1 >= self.max_attempts || e.is_permanent() {
                    let _ = self.store.mark_dead_letter(&task.task_id, &e.to_string()).await;
                } else {
                    let _ = self
                        .store
                        .schedule_retry_with_error(&task, backoff_with_full_jitter(task.attempt), &e.to_string())
                        .await;
                }
            }
        }
    }
}

/// Worker loop: claims and executes tasks until shutdown is signalled.
/// Takes an `Arc<Executor>` rather than consuming it so the control plane
/// can keep calling `submit`/`get`/`retry_dead_letter` on the same
/// instance concurrently.
pub async fn run(executor: Arc<Executor>, mut shutdown: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("executor shutting down");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if let Err(e) = executor.drain_ready_once().await {
                    error!(error = %e, "executor drain cycle failed");
                }
            }
        }
    }
}

fn backoff_with_full_jitter(attempt: u32) -> Duration {
    let base_ms = 200u64.saturating_mul(1u64 << attempt.min(10));
    let capped = base_ms.min(60_000);
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_hash_is_deterministic() {
        assert_eq!(idempotency_hash("abc"), idempotency_hash("abc"));
        assert_ne!(idempotency_hash("abc"), idempotency_hash("abd"));
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..20 {
            let d = backoff_with_full_jitter(attempt);
            assert!(d.as_millis() <= 60_000);
        }
    }
}
