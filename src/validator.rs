//! Tick validation.
//!
//! Strict mode rejects any field out of range; lenient mode (the default)
//! clamps/drops the offending optional field and keeps the tick. Either
//! way a rejected-or-repaired tick increments a counter tagged by reason.
//!
//! Price bounds are segment-aware: a zero `last_price` is a legitimate
//! worthless-expired-option quote and is only rejected for non-option
//! segments, so validation consults the instrument registry for the
//! tick's segment before applying the price rule.

use std::sync::Arc;

use crate::domain::Tick;
use crate::errors::GatewayError;
use crate::registry::InstrumentRegistry;

const OI_MAX: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Lenient,
}

pub struct Validator {
    mode: ValidationMode,
    registry: Option<Arc<InstrumentRegistry>>,
}

impl Validator {
    pub fn new(mode: ValidationMode, registry: Arc<InstrumentRegistry>) -> Self {
        Self { mode, registry: Some(registry) }
    }

    /// In lenient mode, may mutate `tick` in place to drop an invalid
    /// optional field and still return `Ok`. In strict mode any violation
    /// is a `Validation` error.
    pub fn validate(&self, tick: &mut Tick) -> Result<(), GatewayError> {
        if tick.token == 0 {
            return Err(self.reject("token", "token must be positive"));
        }

        let is_option = self
            .registry
            .as_ref()
            .and_then(|r| r.lookup(tick.token))
            .map(|d| d.segment.is_option())
            .unwrap_or(false);
        let price_in_range = if is_option { tick.last_price >= 0.0 } else { tick.last_price > 0.0 };
        if !tick.last_price.is_finite() || !price_in_range {
            return Err(self.reject("last_price", "last_price out of range for segment"));
        }

        if let Some(oi) = tick.oi {
            if oi >= OI_MAX {
                match self.mode {
                    ValidationMode::Strict => {
                        return Err(self.reject("oi", "open interest at or above the upper bound"));
                    }
                    ValidationMode::Lenient => {
                        metrics::counter!("tick_validation_repaired_total", "field" => "oi").increment(1);
                        tick.oi = None;
                    }
                }
            }
        }

        if let Some(depth) = &tick.depth {
            let bad = depth.iter().any(|l| !l.price.is_finite() || l.price < 0.0);
            if bad {
                match self.mode {
                    ValidationMode::Strict => {
                        return Err(self.reject("depth", "negative or non-finite depth price"));
                    }
                    ValidationMode::Lenient => {
                        metrics::counter!("tick_validation_repaired_total", "field" => "depth").increment(1);
                        tick.depth = None;
                    }
                }
            }
        }

        if tick.timestamp > chrono::Utc::now() + chrono::Duration::seconds(5) {
            match self.mode {
                ValidationMode::Strict => {
                    return Err(self.reject("timestamp", "tick timestamped in the future"));
                }
                ValidationMode::Lenient => {
                    metrics::counter!("tick_validation_repaired_total", "field" => "timestamp").increment(1);
                    tick.timestamp = chrono::Utc::now();
                }
            }
        }

        Ok(())
    }

    fn reject(&self, field: &str, reason: &str) -> GatewayError {
        metrics::counter!("tick_validation_rejected_total", "field" => field.to_string()).increment(1);
        GatewayError::Validation(format!("{field}: {reason}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DepthLevel, InstrumentDescriptor, OptionType, Segment};
    use crate::registry::InstrumentSource;

    struct StaticSource(Vec<InstrumentDescriptor>);

    #[async_trait::async_trait]
    impl InstrumentSource for StaticSource {
        async fn fetch_all(&self) -> anyhow::Result<Vec<InstrumentDescriptor>> {
            Ok(self.0.clone())
        }
    }

    fn underlying_descriptor() -> InstrumentDescriptor {
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

    fn option_descriptor() -> InstrumentDescriptor {
        InstrumentDescriptor {
            token: 2,
            trading_symbol: "NIFTY24JAN22000CE".into(),
            segment: Segment::EquityOption,
            option_type: Some(OptionType::Call),
            strike: Some(22000.0),
            expiry: None,
            lot_size: 50,
            tick_size: 0.05,
            exchange: "NFO".into(),
            underlying_token: Some(1),
        }
    }

    async fn test_validator(mode: ValidationMode) -> Validator {
        let source = Arc::new(StaticSource(vec![underlying_descriptor(), option_descriptor()]));
        let registry = Arc::new(InstrumentRegistry::new(source));
        registry.initial_load().await.unwrap();
        Validator::new(mode, registry)
    }

    fn base_tick() -> Tick {
        Tick {
            token: 1,
            last_price: 100.0,
            volume: Some(10),
            oi: None,
            depth: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn rejects_non_positive_price_for_underlying_in_either_mode() {
        let mut t = base_tick();
        t.last_price = -1.0;
        assert!(test_validator(ValidationMode::Lenient).await.validate(&mut t).is_err());
        assert!(test_validator(ValidationMode::Strict).await.validate(&mut t).is_err());
    }

    #[tokio::test]
    async fn zero_price_is_accepted_for_options() {
        let mut t = base_tick();
        t.token = 2;
        t.last_price = 0.0;
        assert!(test_validator(ValidationMode::Strict).await.validate(&mut t).is_ok());
    }

    #[tokio::test]
    async fn zero_price_is_rejected_for_underlying() {
        let mut t = base_tick();
        t.last_price = 0.0;
        assert!(test_validator(ValidationMode::Lenient).await.validate(&mut t).is_err());
    }

    #[tokio::test]
    async fn token_zero_is_always_rejected() {
        let mut t = base_tick();
        t.token = 0;
        assert!(test_validator(ValidationMode::Lenient).await.validate(&mut t).is_err());
    }

    #[tokio::test]
    async fn lenient_mode_drops_oi_at_or_above_the_upper_bound() {
        let mut t = base_tick();
        t.oi = Some(OI_MAX);
        let v = test_validator(ValidationMode::Lenient).await;
        assert!(v.validate(&mut t).is_ok());
        assert!(t.oi.is_none());
    }

    #[tokio::test]
    async fn strict_mode_rejects_oi_at_or_above_the_upper_bound() {
        let mut t = base_tick();
        t.oi = Some(OI_MAX);
        let v = test_validator(ValidationMode::Strict).await;
        assert!(v.validate(&mut t).is_err());
    }

    #[tokio::test]
    async fn lenient_mode_drops_bad_depth_instead_of_rejecting() {
        let mut t = base_tick();
        t.depth = Some(vec![DepthLevel { price: -5.0, quantity: 1, orders: 1 }]);
        let v = test_validator(ValidationMode::Lenient).await;
        assert!(v.validate(&mut t).is_ok());
        assert!(t.depth.is_none());
    }

    #[tokio::test]
    async fn strict_mode_rejects_bad_depth() {
        let mut t = base_tick();
        t.depth = Some(vec![DepthLevel { price: -5.0, quantity: 1, orders: 1 }]);
        let v = test_validator(ValidationMode::Strict).await;
        assert!(v.validate(&mut t).is_err());
    }
}
