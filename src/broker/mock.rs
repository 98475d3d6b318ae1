//! Synthetic broker for `enable_mock_data` mode and tests.
//!
//! Tick pacing comes from a dedicated OS thread (mirroring how a real
//! broker SDK's callback thread is independent of the async runtime),
//! handed to the async side over a bounded `crossbeam` channel so the
//! generator thread never blocks on the tokio reactor and the tokio side
//! never blocks the generator. Per-token last-price state is capped at
//! `MOCK_STATE_CAP` entries with LRU eviction so a long-running mock
//! session with churny subscriptions doesn't grow unbounded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::broker::{BrokerConnection, TickSender};
use crate::domain::{Mode, Tick, Token};
use crate::errors::Result;

const MOCK_STATE_CAP: usize = 5_000;
const TICK_PACE: Duration = Duration::from_millis(250);

struct MockState {
    last_price: HashMap<Token, f64>,
    order: VecDeque<Token>,
}

impl MockState {
    fn price_for(&mut self, token: Token, rng: &mut impl Rng) -> f64 {
        if let Some(&p) = self.last_price.get(&token) {
            let drift: f64 = rng.gen_range(-0.5..0.5);
            let updated = (p + drift).max(0.01);
            self.last_price.insert(token, updated);
            return updated;
        }
        if self.order.len() >= MOCK_STATE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.last_price.remove(&evicted);
            }
        }
        let base = 100.0 + (token % 1000) as f64;
        self.last_price.insert(token, base);
        self.order.push_back(token);
        base
    }
}

pub struct MockBroker {
    subscribed: Arc<Mutex<Vec<Token>>>,
}

impl MockBroker {
    pub fn new(tick_tx: TickSender) -> Self {
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(MockState { last_price: HashMap::new(), order: VecDeque::new() }));

        let (pace_tx, pace_rx) = crossbeam::channel::bounded::<()>(1);
        std::thread::spawn(move || loop {
            std::thread::sleep(TICK_PACE);
            if pace_tx.send(()).is_err() {
                break;
            }
        });

        let pumped_subscribed = subscribed.clone();
        tokio::spawn(async move {
            let mut rng = rand::thread_rng();
            loop {
                let paced = tokio::task::spawn_blocking({
                    let pace_rx = pace_rx.clone();
                    move || pace_rx.recv().is_ok()
                })
                .await
                .unwrap_or(false);
                if !paced {
                    break;
                }
                let tokens: Vec<Token> = pumped_subscribed.lock().clone();
                for token in tokens {
                    let price = state.lock().price_for(token, &mut rng);
                    let tick = Tick {
                        token,
                        last_price: price,
                        volume: Some(rng.gen_range(0..10_000)),
                        oi: None,
                        depth: None,
                        timestamp: chrono::Utc::now(),
                    };
                    if tick_tx.try_send(tick).is_err() {
                        metrics::counter!("mock_broker_dropped_total").increment(1);
                    }
                }
            }
        });

        Self { subscribed }
    }
}

#[async_trait]
impl BrokerConnection for MockBroker {
    async fn subscribe(&self, tokens: &[Token], _mode: Mode) -> Result<()> {
        let mut subscribed = self.subscribed.lock();
        for &t in tokens {
            if !subscribed.contains(&t) {
                subscribed.push(t);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, tokens: &[Token]) -> Result<()> {
        self.subscribed.lock().retain(|t| !tokens.contains(t));
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Order placement for `enable_mock_data` mode: always fills immediately
/// at the requested price (or a synthetic one) with a fabricated order id.
pub struct MockOrderBroker;

#[async_trait]
impl crate::executor::OrderBroker for MockOrderBroker {
    async fn place_order(
        &self,
        _account_id: &crate::domain::AccountId,
        request: &crate::executor::OrderRequest,
    ) -> Result<String> {
        let _ = request;
        Ok(format!("MOCK-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribed_tokens_eventually_produce_ticks() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let broker = MockBroker::new(tx);
        broker.subscribe(&[1, 2], Mode::Ltp).await.unwrap();

        let tick = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(tick.is_ok());
    }
}
