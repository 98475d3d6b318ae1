//! Message bus publisher.
//!
//! Wraps a `deadpool_redis` connection pool with a per-publish timeout
//! and the shared circuit breaker. Under sustained publish failure the
//! sampler degrades
//! from HEALTHY through WARNING and CRITICAL to OVERLOAD, thinning how
//! much of each batch actually gets published so a struggling bus
//! connection doesn't fall further behind trying to catch up.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{error, warn};

use crate::circuit::CircuitBreaker;
use crate::errors::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLevel {
    Healthy,
    Warning,
    Critical,
    Overload,
}

impl SampleLevel {
    /// Fraction of a batch to actually publish at this degradation level.
    fn keep_fraction(self) -> f64 {
        match self {
            SampleLevel::Healthy => 1.0,
            SampleLevel::Warning => 0.8,
            SampleLevel::Critical => 0.5,
            SampleLevel::Overload => 0.2,
        }
    }

    fn from_consecutive_failures(failures: u32) -> Self {
        match failures {
            0 => SampleLevel::Healthy,
            1..=2 => SampleLevel::Warning,
            3..=5 => SampleLevel::Critical,
            _ => SampleLevel::Overload,
        }
    }
}

pub struct MessageBus {
    pool: Pool,
    circuit: CircuitBreaker,
    publish_timeout: Duration,
    consecutive_failures: AtomicU32,
}

impl MessageBus {
    pub fn connect(
        url: &str,
        publish_timeout: Duration,
        circuit_failure_threshold: u32,
        circuit_recovery: Duration,
        circuit_success_threshold: u32,
    ) -> anyhow::Result<Self> {
        let cfg = RedisConfig::from_url(url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self {
            pool,
            circuit: CircuitBreaker::new(circuit_failure_threshold, circuit_success_threshold, circuit_recovery),
            publish_timeout,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn sample_level(&self) -> SampleLevel {
        SampleLevel::from_consecutive_failures(self.consecutive_failures.load(Ordering::Relaxed))
    }

    /// Publishes a batch to `channel`, applying the current adaptive
    /// sample level and routing through the circuit breaker. Returns the
    /// number of messages actually published.
    pub async fn publish_batch<T: Serialize>(&self, channel: &str, items: &[T]) -> Result<usize> {
        if !self.circuit.allow() {
            metrics::counter!("bus_circuit_skipped_total").increment(1);
            return Err(GatewayError::CircuitOpen);
        }

        let keep = self.sample_level().keep_fraction();
        let take = ((items.len() as f64) * keep).ceil() as usize;
        let take = take.min(items.len());
        let sampled: Vec<&T> = if take >= items.len() {
            items.iter().collect()
        } else {
            let mut indices = rand::seq::index::sample(&mut rand::thread_rng(), items.len(), take).into_vec();
            indices.sort_unstable();
            indices.into_iter().map(|i| &items[i]).collect()
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| GatewayError::Transient(format!("redis pool exhausted: {e}")))?;

        let mut published = 0usize;
        let publish_fut = async {
            for item in sampled {
                let payload = serde_json::to_string(item)
                    .map_err(|e| GatewayError::Fatal(format!("serialize failure: {e}")))?;
                conn.publish::<_, _, ()>(channel, payload)
                    .await
                    .map_err(|e| GatewayError::Transient(format!("redis publish failed: {e}")))?;
                published += 1;
            }
            Ok::<(), GatewayError>(())
        };

        match tokio::time::timeout(self.publish_timeout, publish_fut).await {
            Ok(Ok(())) => {
                self.circuit.record_success();
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if take < items.len() {
                    metrics::counter!("bus_sampled_dropped_total").increment((items.len() - take) as u64);
                }
                Ok(published)
            }
            Ok(Err(e)) => {
                self.circuit.record_failure();
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%channel, error = %e, "bus publish failed");
                Err(e)
            }
            Err(_) => {
                self.circuit.record_failure();
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                error!(%channel, "bus publish timed out");
                Err(GatewayError::Transient("publish timed out".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_level_degrades_with_consecutive_failures() {
        assert_eq!(SampleLevel::from_consecutive_failures(0), SampleLevel::Healthy);
        assert_eq!(SampleLevel::from_consecutive_failures(2), SampleLevel::Warning);
        assert_eq!(SampleLevel::from_consecutive_failures(4), SampleLevel::Critical);
        assert_eq!(SampleLevel::from_consecutive_failures(10), SampleLevel::Overload);
    }

    #[test]
    fn keep_fraction_shrinks_as_level_worsens() {
        assert!(SampleLevel::Healthy.keep_fraction() > SampleLevel::Warning.keep_fraction());
        assert!(SampleLevel::Warning.keep_fraction() > SampleLevel::Critical.keep_fraction());
        assert!(SampleLevel::Critical.keep_fraction() > SampleLevel::Overload.keep_fraction());
    }
}
