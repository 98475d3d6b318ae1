//! Broker connection pool.

pub mod mock;
pub mod pool;
pub mod ws;

use async_trait::async_trait;

use crate::domain::{Mode, Tick, Token};
use crate::errors::Result;

/// Common surface every broker implementation (live WS, mock) exposes to
/// the connection pool. Subscribe/unsubscribe are idempotent.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn subscribe(&self, tokens: &[Token], mode: Mode) -> Result<()>;
    async fn unsubscribe(&self, tokens: &[Token]) -> Result<()>;
    /// True while the underlying transport is connected and receiving.
    fn is_healthy(&self) -> bool;
}

pub use pool::ConnectionPool;
pub use pool::PoolConfig;

pub type TickSender = tokio::sync::mpsc::Sender<Tick>;
pub type TickReceiver = tokio::sync::mpsc::Receiver<Tick>;
