//! Instrument Registry.
//!
//! Cache of `token -> descriptor`, refreshed on a configurable interval
//! (default: once per trading-day boundary) and on explicit request.
//! First load must succeed; later failures keep the last good snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::domain::{InstrumentDescriptor, Token};
use crate::errors::{GatewayError, Result};

#[async_trait::async_trait]
pub trait InstrumentSource: Send + Sync {
    async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>>;
}

/// Fetches the instrument dump from the broker's bulk HTTP endpoint.
pub struct HttpInstrumentSource {
    client: crate::broker::ws::BrokerHttpClient,
}

impl HttpInstrumentSource {
    pub fn new(base_url: String) -> Self {
        Self { client: crate::broker::ws::BrokerHttpClient::new(base_url) }
    }
}

#[async_trait::async_trait]
impl InstrumentSource for HttpInstrumentSource {
    async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>> {
        let raw = self.client.fetch_instruments_raw().await?;
        let descriptors: Vec<InstrumentDescriptor> = serde_json::from_str(&raw)?;
        Ok(descriptors)
    }
}

/// Fixed catalog for `enable_mock_data` mode — no network call.
pub struct StaticInstrumentSource {
    descriptors: Vec<InstrumentDescriptor>,
}

impl StaticInstrumentSource {
    pub fn new(descriptors: Vec<InstrumentDescriptor>) -> Self {
        Self { descriptors }
    }
}

#[async_trait::async_trait]
impl InstrumentSource for StaticInstrumentSource {
    async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>> {
        Ok(self.descriptors.clone())
    }
}

pub struct InstrumentRegistry {
    source: Arc<dyn InstrumentSource>,
    snapshot: RwLock<HashMap<Token, InstrumentDescriptor>>,
    loaded: std::sync::atomic::AtomicBool,
    staleness_count: AtomicU64,
}

impl InstrumentRegistry {
    pub fn new(source: Arc<dyn InstrumentSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(HashMap::new()),
            loaded: std::sync::atomic::AtomicBool::new(false),
            staleness_count: AtomicU64::new(0),
        }
    }

    /// Must succeed before the registry is usable.
    pub async fn initial_load(&self) -> Result<()> {
        match self.source.fetch_all().await {
            Ok(descriptors) => {
                self.install(descriptors);
                self.loaded.store(true, Ordering::SeqCst);
                info!(count = self.snapshot.read().len(), "instrument registry loaded");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "instrument registry initial load failed");
                Err(GatewayError::RegistryUnavailable)
            }
        }
    }

    pub async fn refresh(&self, force: bool) -> Result<()> {
        if !self.loaded.load(Ordering::SeqCst) && !force {
            return self.initial_load().await;
        }
        match self.source.fetch_all().await {
            Ok(descriptors) => {
                self.install(descriptors);
                metrics::counter!("registry_refresh_total").increment(1);
                Ok(())
            }
            Err(e) => {
                self.staleness_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("registry_staleness_total").increment(1);
                warn!(error = %e, "registry refresh failed, keeping last good snapshot");
                Ok(())
            }
        }
    }

    fn install(&self, descriptors: Vec<InstrumentDescriptor>) {
        let map = descriptors.into_iter().map(|d| (d.token, d)).collect();
        *self.snapshot.write() = map;
    }

    pub fn lookup(&self, token: Token) -> Option<InstrumentDescriptor> {
        self.snapshot.read().get(&token).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Token, InstrumentDescriptor> {
        self.snapshot.read().clone()
    }

    pub fn staleness_count(&self) -> u64 {
        self.staleness_count.load(Ordering::Relaxed)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Segment;
    use std::sync::atomic::AtomicBool;

    struct FlakySource {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl InstrumentSource for FlakySource {
        async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("broker unavailable")
            }
            Ok(vec![InstrumentDescriptor {
                token: 1,
                trading_symbol: "NIFTY".into(),
                segment: Segment::UnderlyingIndex,
                option_type: None,
                strike: None,
                expiry: None,
                lot_size: 1,
                tick_size: 0.05,
                exchange: "NSE".into(),
                underlying_token: None,
            }])
        }
    }

    #[tokio::test]
    async fn initial_load_failure_is_registry_unavailable() {
        let source = Arc::new(FlakySource { fail: AtomicBool::new(true) });
        let registry = InstrumentRegistry::new(source);
        let err = registry.initial_load().await.unwrap_err();
        assert!(matches!(err, GatewayError::RegistryUnavailable));
        assert!(!registry.is_loaded());
    }

    #[tokio::test]
    async fn refresh_failure_keeps_last_good_snapshot() {
        let source = Arc::new(FlakySource { fail: AtomicBool::new(false) });
        let registry = InstrumentRegistry::new(source.clone());
        registry.initial_load().await.unwrap();
        assert!(registry.lookup(1).is_some());

        source.fail.store(true, Ordering::SeqCst);
        registry.refresh(false).await.unwrap();
        assert!(registry.lookup(1).is_some());
        assert_eq!(registry.staleness_count(), 1);
    }
}
