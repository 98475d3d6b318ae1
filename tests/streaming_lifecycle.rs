//! S1-style exercise of the streaming orchestrator: incremental add and
//! remove against a real (in-memory) subscription store and connection
//! pool, checking the round-trip law from the testable-properties section
//! (add then remove restores the pre-add state modulo timestamps).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use streamgate::accounts::AccountOrchestrator;
use streamgate::broker::pool::{ConnectionPool, PoolConfig};
use streamgate::broker::BrokerConnection;
use streamgate::bus::MessageBus;
use streamgate::domain::{AccountId, Mode, SubscriptionStatus, Token};
use streamgate::errors::Result;
use streamgate::streaming::StreamingOrchestrator;
use streamgate::subscriptions::SubscriptionStore;

struct FakeConn {
    healthy: AtomicBool,
}

#[async_trait]
impl BrokerConnection for FakeConn {
    async fn subscribe(&self, _tokens: &[Token], _mode: Mode) -> Result<()> {
        Ok(())
    }
    async fn unsubscribe(&self, _tokens: &[Token]) -> Result<()> {
        Ok(())
    }
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

fn fake_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        PoolConfig { max_connections: 3, max_tokens_per_connection: 3000 },
        Box::new(|| Arc::new(FakeConn { healthy: AtomicBool::new(true) }) as Arc<dyn BrokerConnection>),
    ))
}

fn orchestrator(store: Arc<SubscriptionStore>) -> StreamingOrchestrator {
    let accounts = Arc::new(AccountOrchestrator::new(
        vec![("primary".to_string(), "creds".to_string())],
        std::time::Duration::from_secs(5),
    ));
    // Deliberately not reachable; `publish_batch` failures on the events
    // channel are logged and swallowed, never roll back the subscription
    // change (see `StreamingOrchestrator::emit_event`).
    let bus = Arc::new(MessageBus::connect(
        "redis://127.0.0.1:1",
        std::time::Duration::from_millis(50),
        5,
        std::time::Duration::from_secs(30),
        2,
    ).unwrap());

    let mut pools: HashMap<AccountId, Arc<ConnectionPool>> = HashMap::new();
    pools.insert("primary".to_string(), fake_pool());

    StreamingOrchestrator::new(store, accounts, pools, bus, "nifty".to_string())
}

#[tokio::test]
async fn add_assigns_token_to_the_only_account() {
    let store = Arc::new(SubscriptionStore::open(":memory:").unwrap());
    let orch = orchestrator(store.clone());

    orch.add(13660418, Mode::Full).await.unwrap();

    let rec = store.get(13660418).await.unwrap().unwrap();
    assert_eq!(rec.status, SubscriptionStatus::Active);
    assert_eq!(rec.account_id.as_deref(), Some("primary"));
}

#[tokio::test]
async fn add_then_remove_restores_pre_add_state() {
    let store = Arc::new(SubscriptionStore::open(":memory:").unwrap());
    let orch = orchestrator(store.clone());

    let before = store.list_active().await.unwrap();

    orch.add(999, Mode::Ltp).await.unwrap();
    assert!(store.get(999).await.unwrap().is_some());

    orch.remove(999).await.unwrap();
    let after_record = store.get(999).await.unwrap().unwrap();
    assert_eq!(after_record.status, SubscriptionStatus::Inactive);
    assert!(after_record.account_id.is_none());

    let after_active = store.list_active().await.unwrap();
    assert_eq!(before.len(), after_active.len());
}

#[tokio::test]
async fn startup_assign_picks_up_preexisting_unassigned_subscriptions() {
    let store = Arc::new(SubscriptionStore::open(":memory:").unwrap());
    store.upsert(111, Mode::Quote).await.unwrap();
    store.upsert(222, Mode::Quote).await.unwrap();

    let orch = orchestrator(store.clone());
    orch.startup_assign().await.unwrap();

    for token in [111, 222] {
        let rec = store.get(token).await.unwrap().unwrap();
        assert_eq!(rec.account_id.as_deref(), Some("primary"));
    }
}
