//! End-to-end exercises of the order executor against a real (in-memory)
//! `TaskStore`, driven through the same `executor::run` loop the binary
//! uses, with a fake broker standing in for the real HTTP/WS one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use streamgate::accounts::AccountOrchestrator;
use streamgate::domain::AccountId;
use streamgate::errors::{GatewayError, Result};
use streamgate::executor::{self, Executor, OrderBroker, OrderRequest, TaskState, TaskStore};

fn accounts() -> Arc<AccountOrchestrator> {
    Arc::new(AccountOrchestrator::new(
        vec![("acct-a".to_string(), "creds".to_string())],
        Duration::from_secs(5),
    ))
}

fn request() -> OrderRequest {
    OrderRequest {
        account_id: "acct-a".to_string(),
        instrument_token: 13660418,
        side: "BUY".into(),
        quantity: 50,
        order_type: "MARKET".into(),
        price: None,
    }
}

struct CountingBroker {
    calls: AtomicU32,
}

#[async_trait]
impl OrderBroker for CountingBroker {
    async fn place_order(&self, _account_id: &AccountId, _request: &OrderRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("BROKER-1".to_string())
    }
}

struct AlwaysFailsBroker;

#[async_trait]
impl OrderBroker for AlwaysFailsBroker {
    async fn place_order(&self, _account_id: &AccountId, _request: &OrderRequest) -> Result<String> {
        Err(GatewayError::Transient("broker returned 503".into()))
    }
}

async fn poll_until<F>(executor: &Executor, task_id: &str, timeout: Duration, mut done: F) -> TaskState
where
    F: FnMut(TaskState) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = executor.get(task_id).await.unwrap().expect("task must exist");
        if done(task.state) {
            return task.state;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for task {task_id}, last state {:?}", task.state);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// S4: two submissions with the same idempotency key within the
/// non-terminal window return the same task and the broker is called once.
#[tokio::test]
async fn duplicate_submission_is_idempotent_and_calls_broker_once() {
    let store = Arc::new(TaskStore::open(":memory:", 1000).unwrap());
    let broker = Arc::new(CountingBroker { calls: AtomicU32::new(0) });
    let executor = Arc::new(Executor::new(
        store,
        accounts(),
        broker.clone(),
        5,
        Duration::from_secs(30),
        2,
        5,
    ));

    let first = executor.submit("order-key-1", request()).await.unwrap();
    let second = executor.submit("order-key-1", request()).await.unwrap();
    assert_eq!(first.task_id, second.task_id);

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    let worker = tokio::spawn(executor::run(executor.clone(), shutdown_rx));

    let state = poll_until(&executor, &first.task_id, Duration::from_secs(5), |s| {
        matches!(s, TaskState::Completed)
    })
    .await;
    assert_eq!(state, TaskState::Completed);
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(()).await;
    let _ = worker.await;
}

/// S5: a persistently failing broker exhausts `max_attempts` and the task
/// lands in DEAD_LETTER with the attempt count pinned at the configured max.
#[tokio::test]
async fn persistent_failures_reach_dead_letter_at_max_attempts() {
    let store = Arc::new(TaskStore::open(":memory:", 1000).unwrap());
    let broker = Arc::new(AlwaysFailsBroker);
    let max_attempts = 3;
    let executor = Arc::new(Executor::new(
        store,
        accounts(),
        broker,
        5,
        Duration::from_secs(30),
        2,
        max_attempts,
    ));

    let task = executor.submit("order-key-2", request()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    let worker = tokio::spawn(executor::run(executor.clone(), shutdown_rx));

    let state = poll_until(&executor, &task.task_id, Duration::from_secs(10), |s| {
        matches!(s, TaskState::DeadLetter)
    })
    .await;
    assert_eq!(state, TaskState::DeadLetter);

    let final_task = executor.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(final_task.attempt, max_attempts);
    assert!(final_task.last_error.is_some());

    let _ = shutdown_tx.send(()).await;
    let _ = worker.await;
}

/// Dead-lettered tasks never retry on their own; only an explicit operator
/// action moves them back to PENDING.
#[tokio::test]
async fn dead_letter_task_requires_explicit_retry() {
    let store = Arc::new(TaskStore::open(":memory:", 1000).unwrap());
    let broker = Arc::new(AlwaysFailsBroker);
    let executor = Arc::new(Executor::new(store, accounts(), broker, 5, Duration::from_secs(30), 2, 1));

    let task = executor.submit("order-key-3", request()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    let worker = tokio::spawn(executor::run(executor.clone(), shutdown_rx));
    poll_until(&executor, &task.task_id, Duration::from_secs(5), |s| matches!(s, TaskState::DeadLetter)).await;
    let _ = shutdown_tx.send(()).await;
    let _ = worker.await;

    executor.retry_dead_letter(&task.task_id).await.unwrap();
    let retried = executor.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(retried.state, TaskState::Pending);
    assert_eq!(retried.attempt, 0);
}

/// S6: crash recovery demotes every RUNNING task to RETRYING rather than
/// leaving it stuck or silently marking it complete.
#[tokio::test]
async fn orphaned_running_tasks_are_demoted_on_recovery() {
    let store = Arc::new(TaskStore::open(":memory:", 1000).unwrap());
    for i in 0..5 {
        store.insert(&format!("t{i}"), &format!("hash{i}"), request()).await.unwrap();
        store.claim_next_ready().await.unwrap();
    }

    let broker = Arc::new(CountingBroker { calls: AtomicU32::new(0) });
    let executor = Executor::new(store.clone(), accounts(), broker, 5, Duration::from_secs(30), 2, 5);

    let recovered = executor.recover_orphaned_running_tasks().await.unwrap();
    assert_eq!(recovered, 5);

    for i in 0..5 {
        let task = store.get(&format!("t{i}")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Retrying);
    }
}
