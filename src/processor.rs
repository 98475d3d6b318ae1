//! Tick processing pipeline.
//!
//! Dispatches each validated tick by segment: underlying ticks update the
//! last-price table other options read for Greeks; option ticks are
//! enriched with Greeks and forwarded to the batcher. Per-path latency is
//! recorded as a `metrics` histogram.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::warn;

use crate::domain::{Greeks, InstrumentDescriptor, OptionSnapshot, Segment, Tick, Token, UnderlyingSnapshot};
use crate::greeks::{black_scholes_greeks, implied_volatility, GreeksCondition, GreeksInput};
use crate::registry::InstrumentRegistry;

pub enum ProcessedTick {
    Underlying(UnderlyingSnapshot),
    Option(OptionSnapshot),
}

pub struct Processor {
    registry: Arc<InstrumentRegistry>,
    underlying_prices: RwLock<HashMap<Token, f64>>,
    risk_free_rate: f64,
}

impl Processor {
    pub fn new(registry: Arc<InstrumentRegistry>, risk_free_rate: f64) -> Self {
        Self { registry, underlying_prices: RwLock::new(HashMap::new()), risk_free_rate }
    }

    pub fn process(&self, tick: Tick, seconds_to_expiry: impl Fn(chrono::NaiveDate) -> f64) -> Option<ProcessedTick> {
        let start = Instant::now();
        let Some(descriptor) = self.registry.lookup(tick.token) else {
            warn!(token = tick.token, "tick for unknown token, dropping");
            metrics::counter!("processor_unknown_token_total").increment(1);
            return None;
        };

        let result = match descriptor.segment {
            Segment::UnderlyingIndex | Segment::Equity | Segment::Future => {
                self.underlying_prices.write().insert(tick.token, tick.last_price);
                Some(ProcessedTick::Underlying(UnderlyingSnapshot {
                    token: tick.token,
                    symbol: descriptor.trading_symbol.clone(),
                    last_price: tick.last_price,
                    volume: tick.volume,
                    timestamp: tick.timestamp,
                }))
            }
            Segment::EquityOption => self.process_option(&descriptor, tick, seconds_to_expiry),
        };

        let label = if descriptor.segment.is_option() { "option" } else { "underlying" };
        metrics::histogram!("processing_latency_seconds", "path" => label).record(start.elapsed().as_secs_f64());
        result
    }

    fn process_option(
        &self,
        descriptor: &InstrumentDescriptor,
        tick: Tick,
        seconds_to_expiry: impl Fn(chrono::NaiveDate) -> f64,
    ) -> Option<ProcessedTick> {
        let underlying_price = descriptor
            .underlying_token
            .and_then(|u| self.underlying_prices.read().get(&u).copied());

        let (iv, greeks, condition) = match (descriptor.strike, descriptor.expiry, descriptor.option_type) {
            (Some(strike), Some(expiry), Some(option_type)) => {
                let seconds = seconds_to_expiry(expiry);
                let iv = underlying_price
                    .and_then(|s| {
                        implied_volatility(tick.last_price, s, strike, seconds, option_type, self.risk_free_rate)
                    })
                    .unwrap_or(0.0);
                let input = GreeksInput {
                    underlying_price,
                    strike,
                    seconds_to_expiry: seconds,
                    option_type,
                    risk_free_rate: self.risk_free_rate,
                    iv,
                };
                let (greeks, condition) = black_scholes_greeks(&input);
                (iv, greeks, condition)
            }
            _ => (0.0, Greeks::default(), GreeksCondition::MissingUnderlying),
        };

        if condition != GreeksCondition::Ok {
            metrics::counter!("greeks_degraded_total").increment(1);
        }

        let fingerprint = fingerprint(tick.token, tick.last_price, tick.volume, tick.oi);

        Some(ProcessedTick::Option(OptionSnapshot {
            token: tick.token,
            last_price: tick.last_price,
            volume: tick.volume,
            oi: tick.oi,
            timestamp: tick.timestamp,
            underlying_price,
            iv,
            greeks,
            fingerprint,
        }))
    }
}

fn fingerprint(token: Token, last_price: f64, volume: Option<u64>, oi: Option<u64>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    last_price.to_bits().hash(&mut hasher);
    volume.hash(&mut hasher);
    oi.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OptionType;
    use std::sync::Arc;

    struct StaticSource(Vec<InstrumentDescriptor>);

    #[async_trait::async_trait]
    impl crate::registry::InstrumentSource for StaticSource {
        async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>> {
            Ok(self.0.clone())
        }
    }

    fn underlying() -> InstrumentDescriptor {
        InstrumentDescriptor {
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
        }
    }

    fn option() -> InstrumentDescriptor {
        InstrumentDescriptor {
            token: 2,
            trading_symbol: "NIFTY24JAN22000CE".into(),
            segment: Segment::EquityOption,
            option_type: Some(OptionType::Call),
            strike: Some(22000.0),
            expiry: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 25).unwrap()),
            lot_size: 50,
            tick_size: 0.05,
            exchange: "NFO".into(),
            underlying_token: Some(1),
        }
    }

    async fn test_processor() -> Processor {
        let source = Arc::new(StaticSource(vec![underlying(), option()]));
        let registry = Arc::new(InstrumentRegistry::new(source));
        registry.initial_load().await.unwrap();
        Processor::new(registry, 0.06)
    }

    #[tokio::test]
    async fn underlying_tick_updates_price_table() {
        let p = test_processor().await;
        let tick = Tick { token: 1, last_price: 22050.0, volume: Some(1), oi: None, depth: None, timestamp: chrono::Utc::now() };
        let result = p.process(tick, |_| 86_400.0);
        assert!(matches!(result, Some(ProcessedTick::Underlying(_))));
        assert_eq!(*p.underlying_prices.read().get(&1).unwrap(), 22050.0);
    }

    #[tokio::test]
    async fn option_tick_uses_prior_underlying_price_for_greeks() {
        let p = test_processor().await;
        let underlying_tick = Tick { token: 1, last_price: 22050.0, volume: None, oi: None, depth: None, timestamp: chrono::Utc::now() };
        p.process(underlying_tick, |_| 86_400.0);

        let option_tick = Tick { token: 2, last_price: 150.0, volume: Some(10), oi: Some(100), depth: None, timestamp: chrono::Utc::now() };
        let result = p.process(option_tick, |_| 30.0 * 86_400.0);
        match result {
            Some(ProcessedTick::Option(snap)) => {
                assert_eq!(snap.underlying_price, Some(22050.0));
                assert!(snap.greeks.delta > 0.0);
            }
            _ => panic!("expected option snapshot"),
        }
    }

    #[tokio::test]
    async fn unknown_token_is_dropped() {
        let p = test_processor().await;
        let tick = Tick { token: 999, last_price: 1.0, volume: None, oi: None, depth: None, timestamp: chrono::Utc::now() };
        assert!(p.process(tick, |_| 86_400.0).is_none());
    }
}
