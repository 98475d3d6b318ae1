//! Clock & Calendar.
//!
//! Monotonic clock plus a market-hours test in a configurable timezone.

use chrono::{NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketCalendar {
    pub fn new(timezone: &str, open: &str, close: &str) -> anyhow::Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid market_timezone {timezone}: {e}"))?;
        let open = NaiveTime::parse_from_str(open, "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid market_open {open}: {e}"))?;
        let close = NaiveTime::parse_from_str(close, "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid market_close {close}: {e}"))?;
        Ok(Self { tz, open, close })
    }

    /// True if `now` (UTC) falls within market hours in the configured
    /// timezone, Monday through Friday.
    pub fn is_market_open(&self) -> bool {
        self.is_market_open_at(Utc::now())
    }

    pub fn is_market_open_at(&self, now: chrono::DateTime<Utc>) -> bool {
        use chrono::Datelike;
        let local = now.with_timezone(&self.tz);
        if matches!(local.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }

    /// Seconds-since-now until the session-close time on `expiry`, used by
    /// the Greeks engine to compute T.
    pub fn seconds_to_session_close(
        &self,
        expiry: chrono::NaiveDate,
        now: chrono::DateTime<Utc>,
    ) -> f64 {
        let close_local = expiry.and_time(self.close);
        let close_utc = self
            .tz
            .from_local_datetime(&close_local)
            .single()
            .unwrap_or_else(|| {
                // Ambiguous/nonexistent local time (DST fold) — pick the
                // earliest candidate rather than panicking.
                self.tz
                    .from_local_datetime(&close_local)
                    .earliest()
                    .unwrap_or_else(|| now.with_timezone(&self.tz))
            })
            .with_timezone(&Utc);
        (close_utc - now).num_milliseconds() as f64 / 1000.0
    }

    pub fn hour(&self, now: chrono::DateTime<Utc>) -> u32 {
        now.with_timezone(&self.tz).hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_hours_weekday() {
        let cal = MarketCalendar::new("Asia/Kolkata", "09:15", "15:30").unwrap();
        // 2024-01-02 is a Tuesday, 10:00 IST = 04:30 UTC
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 4, 30, 0).unwrap();
        assert!(cal.is_market_open_at(t));
    }

    #[test]
    fn market_closed_weekend() {
        let cal = MarketCalendar::new("Asia/Kolkata", "09:15", "15:30").unwrap();
        // 2024-01-06 is a Saturday
        let t = Utc.with_ymd_and_hms(2024, 1, 6, 6, 0, 0).unwrap();
        assert!(!cal.is_market_open_at(t));
    }

    #[test]
    fn seconds_to_close_is_positive_before_expiry() {
        let cal = MarketCalendar::new("Asia/Kolkata", "09:15", "15:30").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap();
        let expiry = chrono::NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        let secs = cal.seconds_to_session_close(expiry, now);
        assert!(secs > 0.0);
    }
}
