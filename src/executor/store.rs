//! Durable task storage for the executor, same `Arc<Mutex<Connection>>`
//! rusqlite shape as `SubscriptionStore`. Claiming a task is a
//! compare-and-swap on `row_version`: a worker reads a candidate row then
//! updates it conditioned on the row_version it just read, so two workers
//! racing to claim the same row can't both succeed.
//!
//! Terminal tasks (COMPLETED/DEAD_LETTER) are additionally kept in a
//! bounded in-memory index capped at `max_in_memory`, LRU-evicted the same
//! way `MockState` caps per-token price history — eviction only drops the
//! entry from the fast path, the row itself stays in SQLite.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::domain::AccountId;
use crate::errors::{GatewayError, Result};
use crate::executor::{OrderRequest, Task, TaskState};

struct TerminalCache {
    by_id: HashMap<String, Task>,
    order: VecDeque<String>,
    cap: usize,
}

impl TerminalCache {
    fn new(cap: usize) -> Self {
        Self { by_id: HashMap::new(), order: VecDeque::new(), cap }
    }

    fn insert(&mut self, task: Task) {
        if !self.by_id.contains_key(&task.task_id) {
            if self.by_id.len() >= self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.by_id.remove(&evicted);
                }
            }
            self.order.push_back(task.task_id.clone());
        }
        self.by_id.insert(task.task_id.clone(), task);
    }

    fn get(&self, task_id: &str) -> Option<Task> {
        self.by_id.get(task_id).cloned()
    }

    fn remove(&mut self, task_id: &str) {
        self.by_id.remove(task_id);
    }
}

pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    terminal_cache: SyncMutex<TerminalCache>,
}

impl TaskStore {
    pub fn open(dsn: &str, max_in_memory: usize) -> anyhow::Result<Self> {
        let conn = Connection::open(dsn)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id          TEXT PRIMARY KEY,
                idempotency_hash TEXT NOT NULL UNIQUE,
                state            TEXT NOT NULL,
                attempt          INTEGER NOT NULL,
                row_version      INTEGER NOT NULL,
                account_id       TEXT NOT NULL,
                instrument_token INTEGER NOT NULL,
                side             TEXT NOT NULL,
                quantity         INTEGER NOT NULL,
                order_type       TEXT NOT NULL,
                price            REAL,
                last_error       TEXT,
                broker_order_id  TEXT,
                next_attempt_at  TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            terminal_cache: SyncMutex::new(TerminalCache::new(max_in_memory.max(1))),
        })
    }

    /// Re-reads a task straight from SQLite and, if it landed in a terminal
    /// state, installs it in the bounded in-memory index.
    async fn refresh_cache(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT task_id, idempotency_hash, state, attempt, row_version, account_id,
                        instrument_token, side, quantity, order_type, price, last_error
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()
            .map_err(|e| GatewayError::Other(e.into()))?;
        drop(conn);
        if let Some(task) = task {
            match task.state {
                TaskState::Completed | TaskState::DeadLetter => self.terminal_cache.lock().insert(task),
                _ => self.terminal_cache.lock().remove(task_id),
            }
        }
        Ok(())
    }

    pub async fn insert(&self, task_id: &str, hash: &str, request: OrderRequest) -> Result<Task> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks (
                task_id, idempotency_hash, state, attempt, row_version,
                account_id, instrument_token, side, quantity, order_type, price,
                last_error, broker_order_id, next_attempt_at, created_at, updated_at
            ) VALUES (?1, ?2, 'PENDING', 0, 0, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, ?9, ?9)",
            params![
                task_id,
                hash,
                request.account_id,
                request.instrument_token as i64,
                request.side,
                request.quantity as i64,
                request.order_type,
                request.price,
                now,
            ],
        )
        .map_err(|e| GatewayError::Other(e.into()))?;
        self.get(task_id).await?.ok_or_else(|| GatewayError::Fatal("task vanished after insert".into()))
    }

    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT task_id, idempotency_hash, state, attempt, row_version, account_id,
                    instrument_token, side, quantity, order_type, price, last_error
             FROM tasks WHERE idempotency_hash = ?1",
            params![hash],
            row_to_task,
        )
        .optional()
        .map_err(|e| GatewayError::Other(e.into()))
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        if let Some(task) = self.terminal_cache.lock().get(task_id) {
            return Ok(Some(task));
        }
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT task_id, idempotency_hash, state, attempt, row_version, account_id,
                    instrument_token, side, quantity, order_type, price, last_error
             FROM tasks WHERE task_id = ?1",
            params![task_id],
            row_to_task,
        )
        .optional()
        .map_err(|e| GatewayError::Other(e.into()))
    }

    /// Finds one PENDING or RETRYING task whose `next_attempt_at` has
    /// elapsed and atomically claims it (CAS on row_version), or returns
    /// `None` if nothing is ready.
    pub async fn claim_next_ready(&self) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let candidate = conn
            .query_row(
                "SELECT task_id, row_version FROM tasks
                 WHERE state IN ('PENDING', 'RETRYING') AND next_attempt_at <= ?1
                 ORDER BY created_at ASC LIMIT 1",
                params![now],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(|e| GatewayError::Other(e.into()))?;

        let Some((task_id, row_version)) = candidate else { return Ok(None) };

        let updated = conn
            .execute(
                "UPDATE tasks SET state = 'RUNNING', row_version = row_version + 1, updated_at = ?2
                 WHERE task_id = ?1 AND row_version = ?3",
                params![task_id, Utc::now().to_rfc3339(), row_version],
            )
            .map_err(|e| GatewayError::Other(e.into()))?;

        if updated == 0 {
            // Another worker won the race; caller will poll again.
            return Ok(None);
        }

        conn.query_row(
            "SELECT task_id, idempotency_hash, state, attempt, row_version, account_id,
                    instrument_token, side, quantity, order_type, price, last_error
             FROM tasks WHERE task_id = ?1",
            params![task_id],
            row_to_task,
        )
        .optional()
        .map_err(|e| GatewayError::Other(e.into()))
    }

    pub async fn mark_completed(&self, task_id: &str, broker_order_id: &str) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE tasks SET state = 'COMPLETED', broker_order_id = ?2, updated_at = ?3,
                                  row_version = row_version + 1
                 WHERE task_id = ?1",
                params![task_id, broker_order_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| GatewayError::Other(e.into()))?;
        }
        self.refresh_cache(task_id).await
    }

    pub async fn schedule_retry(&self, task: &Task, delay: Duration) -> Result<()> {
        self.schedule_retry_with_error(task, delay, "").await
    }

    pub async fn schedule_retry_with_error(&self, task: &Task, delay: Duration, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let next_attempt_at = (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()).to_rfc3339();
        conn.execute(
            "UPDATE tasks SET state = 'RETRYING', attempt = attempt + 1, next_attempt_at = ?2,
                              last_error = ?3, updated_at = ?4, row_version = row_version + 1
             WHERE task_id = ?1",
            params![task.task_id, next_attempt_at, error, Utc::now().to_rfc3339()],
        )
        .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(())
    }

    pub async fn mark_dead_letter(&self, task_id: &str, error: &str) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE tasks SET state = 'DEAD_LETTER', last_error = ?2, updated_at = ?3,
                                  row_version = row_version + 1
                 WHERE task_id = ?1",
                params![task_id, error, Utc::now().to_rfc3339()],
            )
            .map_err(|e| GatewayError::Other(e.into()))?;
        }
        self.refresh_cache(task_id).await
    }

    /// Operator-triggered only: resets a DEAD_LETTER task back to PENDING
    /// with attempt counter cleared.
    pub async fn reset_for_retry(&self, task_id: &str) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            let updated = conn
                .execute(
                    "UPDATE tasks SET state = 'PENDING', attempt = 0, next_attempt_at = ?2,
                                      updated_at = ?2, row_version = row_version + 1
                     WHERE task_id = ?1 AND state = 'DEAD_LETTER'",
                    params![task_id, Utc::now().to_rfc3339()],
                )
                .map_err(|e| GatewayError::Other(e.into()))?;
            if updated == 0 {
                return Err(GatewayError::Validation(format!("task {task_id} is not in DEAD_LETTER state")));
            }
        }
        self.terminal_cache.lock().remove(task_id);
        Ok(())
    }

    /// Crash recovery: any task stuck RUNNING (the previous process died
    /// mid-execution) is demoted to RETRYING with a short grace delay so
    /// it isn't claimed again instantly.
    pub async fn demote_running_to_retrying(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let next_attempt_at = (Utc::now() + chrono::Duration::seconds(5)).to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE tasks SET state = 'RETRYING', next_attempt_at = ?1, updated_at = ?1,
                                  row_version = row_version + 1
                 WHERE state = 'RUNNING'",
                params![next_attempt_at],
            )
            .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(updated)
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let state_s: String = row.get(2)?;
    let account_id: AccountId = row.get(5)?;
    Ok(Task {
        task_id: row.get(0)?,
        idempotency_hash: row.get(1)?,
        state: TaskState::from_str(&state_s),
        attempt: row.get::<_, i64>(3)? as u32,
        row_version: row.get(4)?,
        request: OrderRequest {
            account_id,
            instrument_token: row.get::<_, i64>(6)? as u64,
            side: row.get(7)?,
            quantity: row.get::<_, i64>(8)? as u64,
            order_type: row.get(9)?,
            price: row.get(10)?,
        },
        last_error: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OrderRequest {
        OrderRequest {
            account_id: "acct-a".to_string(),
            instrument_token: 1,
            side: "BUY".into(),
            quantity: 50,
            order_type: "MARKET".into(),
            price: None,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_under_concurrent_attempts() {
        let store = Arc::new(TaskStore::open(":memory:", 100).unwrap());
        store.insert("t1", "hash1", request()).await.unwrap();

        let a = store.clone().claim_next_ready();
        let b = store.claim_next_ready();
        let (ra, rb) = tokio::join!(a, b);
        let claims = [ra.unwrap(), rb.unwrap()].into_iter().flatten().count();
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn dead_letter_only_retried_explicitly() {
        let store = TaskStore::open(":memory:", 100).unwrap();
        store.insert("t1", "hash1", request()).await.unwrap();
        store.mark_dead_letter("t1", "broker rejected").await.unwrap();
        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::DeadLetter);

        store.reset_for_retry("t1").await.unwrap();
        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt, 0);
    }
}
