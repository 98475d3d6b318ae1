//! Streaming orchestrator.
//!
//! Owns the account-to-token assignment: at startup it loads every active
//! subscription from the store and assigns each to the account with the
//! most remaining capacity (ties broken by fewest in-flight assignments,
//! then by account id), then subscribes on that account's broker
//! connection pool. After startup, `add`/`remove` update only the
//! affected account's pool rather than reloading everything. A debounced
//! full reconcile runs on a timer to catch drift between the store and
//! the pools (a connection silently dropped tokens, for instance).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::accounts::AccountOrchestrator;
use crate::broker::ConnectionPool;
use crate::bus::MessageBus;
use crate::domain::{AccountId, Mode, SubscriptionEvent, SubscriptionEventType, SubscriptionStatus, Token};
use crate::errors::Result;
use crate::subscriptions::SubscriptionStore;

pub struct StreamingOrchestrator {
    store: Arc<SubscriptionStore>,
    accounts: Arc<AccountOrchestrator>,
    pools: HashMap<AccountId, Arc<ConnectionPool>>,
    bus: Arc<MessageBus>,
    market: String,
    /// Held for the duration of any full reconcile so an `add`/`remove`
    /// racing a reconcile sees a consistent view.
    reconcile_lock: Mutex<()>,
}

impl StreamingOrchestrator {
    pub fn new(
        store: Arc<SubscriptionStore>,
        accounts: Arc<AccountOrchestrator>,
        pools: HashMap<AccountId, Arc<ConnectionPool>>,
        bus: Arc<MessageBus>,
        market: String,
    ) -> Self {
        Self { store, accounts, pools, bus, market, reconcile_lock: Mutex::new(()) }
    }

    /// Runs once at startup: assigns every active, unassigned subscription
    /// using most-remaining-capacity and subscribes it on the broker.
    pub async fn startup_assign(&self) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;
        let subs = self.store.list_active().await?;
        for sub in subs {
            if sub.account_id.is_some() {
                continue;
            }
            self.assign_one(sub.token, sub.mode).await?;
        }
        Ok(())
    }

    pub async fn add(&self, token: Token, mode: Mode) -> Result<()> {
        {
            let _guard = self.reconcile_lock.lock().await;
            self.store.upsert(token, mode).await?;
            self.assign_one(token, mode).await?;
        }
        self.emit_event(SubscriptionEventType::SubscriptionCreated, token).await;
        Ok(())
    }

    pub async fn remove(&self, token: Token) -> Result<()> {
        {
            let _guard = self.reconcile_lock.lock().await;
            if let Some(sub) = self.store.get(token).await? {
                if let Some(account_id) = &sub.account_id {
                    if let Some(pool) = self.pools.get(account_id) {
                        pool.unsubscribe(&[token]).await?;
                    }
                }
            }
            self.store.deactivate(token).await?;
        }
        self.emit_event(SubscriptionEventType::SubscriptionRemoved, token).await;
        Ok(())
    }

    /// Best-effort: a dropped event does not roll back the subscription
    /// change, it's only a backfill hint for downstream consumers.
    async fn emit_event(&self, event_type: SubscriptionEventType, token: Token) {
        let event = SubscriptionEvent {
            event_type,
            instrument_token: token,
            metadata: serde_json::json!({}),
            timestamp: chrono::Utc::now(),
        };
        let channel = format!("ticker:{}:events", self.market);
        if let Err(e) = self.bus.publish_batch(&channel, &[event]).await {
            warn!(%channel, error = %e, "failed to publish subscription event");
        }
    }

    async fn assign_one(&self, token: Token, mode: Mode) -> Result<()> {
        let account_id = self.pick_account_with_most_capacity();
        let Some(account_id) = account_id else {
            warn!(token, "no accounts configured, leaving subscription unassigned");
            return Ok(());
        };
        let pool = self.pools.get(&account_id).expect("picked account must have a pool");
        pool.subscribe(&[token], mode).await?;
        self.store.set_account(token, Some(&account_id)).await?;
        info!(token, %account_id, "subscription assigned");
        Ok(())
    }

    fn pick_account_with_most_capacity(&self) -> Option<AccountId> {
        self.accounts
            .account_ids()
            .iter()
            .map(|id| {
                let assigned = self.pools.get(id).map(|p| p.assigned_token_count()).unwrap_or(usize::MAX);
                (id.clone(), assigned)
            })
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    /// Debounced: callers should schedule this on a timer (e.g. every few
    /// minutes) rather than call it inline on every tick.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;
        let subs = self.store.list_active().await?;
        for sub in subs {
            if sub.status != SubscriptionStatus::Active {
                continue;
            }
            if sub.account_id.is_none() {
                self.assign_one(sub.token, sub.mode).await?;
            }
        }
        Ok(())
    }
}
