//! Subscription lifecycle store.
//!
//! Durable set of `(token, mode)` subscriptions with the account each is
//! currently assigned to: one `Arc<tokio::sync::Mutex<Connection>>`, WAL
//! journal, hand-written SQL rather than an ORM.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::domain::{AccountId, Mode, SubscriptionRecord, SubscriptionStatus, Token};
use crate::errors::{GatewayError, Result};

pub struct SubscriptionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SubscriptionStore {
    pub fn open(dsn: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(dsn)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                token       INTEGER PRIMARY KEY,
                mode        TEXT NOT NULL,
                account_id  TEXT,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Idempotent: calling twice for the same token updates the mode rather
    /// than erroring, and re-activates a previously removed subscription.
    pub async fn upsert(&self, token: Token, mode: Mode) -> Result<SubscriptionRecord> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO subscriptions (token, mode, account_id, status, created_at, updated_at)
             VALUES (?1, ?2, NULL, 'active', ?3, ?3)
             ON CONFLICT(token) DO UPDATE SET mode = ?2, status = 'active', updated_at = ?3",
            params![token as i64, mode_str(mode), now.to_rfc3339()],
        )
        .map_err(|e| GatewayError::Other(e.into()))?;
        self.get(token)
            .await?
            .ok_or_else(|| GatewayError::Fatal("subscription vanished after upsert".into()))
    }

    pub async fn deactivate(&self, token: Token) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "UPDATE subscriptions SET status = 'inactive', account_id = NULL, updated_at = ?2
             WHERE token = ?1",
            params![token as i64, now.to_rfc3339()],
        )
        .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(())
    }

    pub async fn set_account(&self, token: Token, account_id: Option<&AccountId>) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "UPDATE subscriptions SET account_id = ?2, updated_at = ?3 WHERE token = ?1",
            params![token as i64, account_id, now.to_rfc3339()],
        )
        .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(())
    }

    pub async fn get(&self, token: Token) -> Result<Option<SubscriptionRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT token, mode, account_id, status, created_at, updated_at
                 FROM subscriptions WHERE token = ?1",
                params![token as i64],
                row_to_record,
            )
            .optional()
            .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(row)
    }

    pub async fn list_active(&self) -> Result<Vec<SubscriptionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT token, mode, account_id, status, created_at, updated_at
                 FROM subscriptions WHERE status = 'active'",
            )
            .map_err(|e| GatewayError::Other(e.into()))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| GatewayError::Other(e.into()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(rows)
    }

    pub async fn list_all(&self) -> Result<Vec<SubscriptionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT token, mode, account_id, status, created_at, updated_at
                 FROM subscriptions",
            )
            .map_err(|e| GatewayError::Other(e.into()))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| GatewayError::Other(e.into()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(rows)
    }
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Ltp => "LTP",
        Mode::Quote => "QUOTE",
        Mode::Full => "FULL",
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<SubscriptionRecord> {
    let mode_s: String = row.get(1)?;
    let status_s: String = row.get(3)?;
    let created_s: String = row.get(4)?;
    let updated_s: String = row.get(5)?;
    Ok(SubscriptionRecord {
        token: row.get::<_, i64>(0)? as u64,
        mode: match mode_s.as_str() {
            "QUOTE" => Mode::Quote,
            "FULL" => Mode::Full,
            _ => Mode::Ltp,
        },
        account_id: row.get(2)?,
        status: if status_s == "active" { SubscriptionStatus::Active } else { SubscriptionStatus::Inactive },
        created_at: created_s.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_s.parse().unwrap_or_else(|_| Utc::now()),
    })
}
