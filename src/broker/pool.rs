//! Connection pool for a single account's broker connections.
//!
//! The pool mutex is reentrant: the public `subscribe`/`unsubscribe` path
//! and the internal reconnect watchdog can both end up on the same thread
//! (the watchdog firing on a timer while a subscribe call is in flight and
//! re-entering pool state to mark a connection unhealthy). A plain
//! `parking_lot::Mutex` deadlocks in that path; `ReentrantMutex` plus an
//! inner `RefCell` is the fix.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::broker::BrokerConnection;
use crate::domain::{Mode, Token};
use crate::errors::{GatewayError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_tokens_per_connection: usize,
}

struct ConnectionSlot {
    conn: Arc<dyn BrokerConnection>,
    tokens: Vec<Token>,
}

struct PoolState {
    slots: Vec<ConnectionSlot>,
    token_location: HashMap<Token, usize>,
}

pub struct ConnectionPool {
    config: PoolConfig,
    state: ReentrantMutex<RefCell<PoolState>>,
    factory: Box<dyn Fn() -> Arc<dyn BrokerConnection> + Send + Sync>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        factory: Box<dyn Fn() -> Arc<dyn BrokerConnection> + Send + Sync>,
    ) -> Self {
        Self {
            config,
            state: ReentrantMutex::new(RefCell::new(PoolState {
                slots: Vec::new(),
                token_location: HashMap::new(),
            })),
            factory,
        }
    }

    pub async fn subscribe(&self, tokens: &[Token], mode: Mode) -> Result<()> {
        let conn = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            self.connection_with_room(&mut state, tokens.len())?
        };
        conn.subscribe(tokens, mode).await?;

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.record_assignment(&mut state, &conn, tokens);
        Ok(())
    }

    pub async fn unsubscribe(&self, tokens: &[Token]) -> Result<()> {
        let by_conn = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            self.group_by_connection(&mut state, tokens)
        };
        for (conn, toks) in by_conn {
            conn.unsubscribe(&toks).await?;
        }
        Ok(())
    }

    /// Called by the reconnect watchdog; may re-enter while a subscribe is
    /// mid-flight on the same thread.
    pub fn mark_unhealthy_connections_evicted(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.slots.retain(|slot| slot.conn.is_healthy());
        let remaining: std::collections::HashSet<Token> =
            state.slots.iter().flat_map(|s| s.tokens.iter().copied()).collect();
        state.token_location.retain(|token, _| remaining.contains(token));
    }

    pub fn assigned_token_count(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.token_location.len()
    }

    fn connection_with_room(
        &self,
        state: &mut PoolState,
        needed: usize,
    ) -> Result<Arc<dyn BrokerConnection>> {
        for slot in state.slots.iter() {
            if slot.tokens.len() + needed <= self.config.max_tokens_per_connection {
                return Ok(slot.conn.clone());
            }
        }
        if state.slots.len() < self.config.max_connections {
            let conn = (self.factory)();
            state.slots.push(ConnectionSlot { conn: conn.clone(), tokens: Vec::new() });
            return Ok(conn);
        }
        Err(GatewayError::AccountCapacityExceeded)
    }

    fn record_assignment(&self, state: &mut PoolState, conn: &Arc<dyn BrokerConnection>, tokens: &[Token]) {
        let idx = state
            .slots
            .iter()
            .position(|s| Arc::ptr_eq(&s.conn, conn))
            .expect("connection must already be in the pool");
        for &token in tokens {
            if !state.slots[idx].tokens.contains(&token) {
                state.slots[idx].tokens.push(token);
            }
            state.token_location.insert(token, idx);
        }
    }

    fn group_by_connection(
        &self,
        state: &mut PoolState,
        tokens: &[Token],
    ) -> Vec<(Arc<dyn BrokerConnection>, Vec<Token>)> {
        let mut grouped: HashMap<usize, Vec<Token>> = HashMap::new();
        for &token in tokens {
            if let Some(&idx) = state.token_location.get(&token) {
                grouped.entry(idx).or_default().push(token);
            }
        }
        for (&idx, toks) in grouped.iter() {
            state.slots[idx].tokens.retain(|t| !toks.contains(t));
            for t in toks {
                state.token_location.remove(t);
            }
        }
        grouped
            .into_iter()
            .map(|(idx, toks)| (state.slots[idx].conn.clone(), toks))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

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

    fn test_pool(max_connections: usize, max_tokens: usize) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig { max_connections, max_tokens_per_connection: max_tokens },
            Box::new(|| Arc::new(FakeConn { healthy: AtomicBool::new(true) }) as Arc<dyn BrokerConnection>),
        )
    }

    #[tokio::test]
    async fn subscribe_spills_to_new_connection_when_full() {
        let pool = test_pool(2, 2);
        pool.subscribe(&[1, 2], Mode::Ltp).await.unwrap();
        pool.subscribe(&[3], Mode::Ltp).await.unwrap();
        assert_eq!(pool.assigned_token_count(), 3);
    }

    #[tokio::test]
    async fn subscribe_fails_past_capacity() {
        let pool = test_pool(1, 1);
        pool.subscribe(&[1], Mode::Ltp).await.unwrap();
        let err = pool.subscribe(&[2], Mode::Ltp).await.unwrap_err();
        assert!(matches!(err, GatewayError::AccountCapacityExceeded));
    }

    #[tokio::test]
    async fn unsubscribe_frees_capacity() {
        let pool = test_pool(1, 1);
        pool.subscribe(&[1], Mode::Ltp).await.unwrap();
        pool.unsubscribe(&[1]).await.unwrap();
        pool.subscribe(&[2], Mode::Ltp).await.unwrap();
        assert_eq!(pool.assigned_token_count(), 1);
    }
}
