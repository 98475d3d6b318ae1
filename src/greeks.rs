//! Black-Scholes Greeks and implied volatility.
//!
//! `T` (time to expiry, in years) comes from `MarketCalendar::seconds_to_session_close`
//! rather than a naive calendar-day count, so Greeks respect market hours
//! and weekends. When the underlying price is unavailable or `T <= 0`,
//! Greeks are zeroed and the condition is recorded rather than the call
//! erroring — an expired/unpriceable option is a normal occurrence, not a
//! fault.

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use crate::domain::{Greeks, OptionType};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;
const IV_MIN: f64 = 0.001;
const IV_MAX: f64 = 5.0;
const NEWTON_MAX_ITERS: u32 = 50;
const NEWTON_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreeksCondition {
    Ok,
    MissingUnderlying,
    Expired,
}

pub struct GreeksInput {
    pub underlying_price: Option<f64>,
    pub strike: f64,
    pub seconds_to_expiry: f64,
    pub option_type: OptionType,
    pub risk_free_rate: f64,
    pub iv: f64,
}

pub fn black_scholes_greeks(input: &GreeksInput) -> (Greeks, GreeksCondition) {
    let Some(s) = input.underlying_price else {
        return (Greeks::default(), GreeksCondition::MissingUnderlying);
    };
    let t = input.seconds_to_expiry / SECONDS_PER_YEAR;
    if t <= 0.0 {
        return (Greeks::default(), GreeksCondition::Expired);
    }

    let k = input.strike;
    let r = input.risk_free_rate;
    let sigma = input.iv.max(IV_MIN);
    let normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");

    let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / (sigma * t.sqrt());
    let d2 = d1 - sigma * t.sqrt();

    let (delta, rho_sign) = match input.option_type {
        OptionType::Call => (normal.cdf(d1), 1.0),
        OptionType::Put => (normal.cdf(d1) - 1.0, -1.0),
    };

    let pdf_d1 = normal.pdf(d1);
    let gamma = pdf_d1 / (s * sigma * t.sqrt());
    let vega = s * pdf_d1 * t.sqrt() / 100.0;

    let theta = match input.option_type {
        OptionType::Call => {
            (-(s * pdf_d1 * sigma) / (2.0 * t.sqrt()) - r * k * (-r * t).exp() * normal.cdf(d2)) / 365.0
        }
        OptionType::Put => {
            (-(s * pdf_d1 * sigma) / (2.0 * t.sqrt()) + r * k * (-r * t).exp() * normal.cdf(-d2)) / 365.0
        }
    };

    let rho = rho_sign * k * t * (-r * t).exp() * normal.cdf(rho_sign * d2) / 100.0;

    (Greeks { delta, gamma, theta, vega, rho }, GreeksCondition::Ok)
}

/// Bounded Newton-Raphson solve for implied volatility from an observed
/// option price. Falls back to a bisection-style clamp rather than
/// diverging when the derivative collapses near expiry.
pub fn implied_volatility(
    market_price: f64,
    underlying_price: f64,
    strike: f64,
    seconds_to_expiry: f64,
    option_type: OptionType,
    risk_free_rate: f64,
) -> Option<f64> {
    if seconds_to_expiry <= 0.0 || underlying_price <= 0.0 || market_price <= 0.0 {
        return None;
    }
    let t = seconds_to_expiry / SECONDS_PER_YEAR;
    let normal = Normal::new(0.0, 1.0).ok()?;

    let mut sigma = 0.3_f64;
    for _ in 0..NEWTON_MAX_ITERS {
        let d1 = ((underlying_price / strike).ln() + (risk_free_rate + 0.5 * sigma * sigma) * t)
            / (sigma * t.sqrt());
        let d2 = d1 - sigma * t.sqrt();

        let price = match option_type {
            OptionType::Call => {
                underlying_price * normal.cdf(d1)
                    - strike * (-risk_free_rate * t).exp() * normal.cdf(d2)
            }
            OptionType::Put => {
                strike * (-risk_free_rate * t).exp() * normal.cdf(-d2) - underlying_price * normal.cdf(-d1)
            }
        };

        let vega = underlying_price * normal.pdf(d1) * t.sqrt();
        if vega.abs() < 1e-8 {
            metrics::counter!("iv_solver_non_convergent_total", "reason" => "vega_collapse").increment(1);
            return Some(0.0);
        }

        let diff = price - market_price;
        if diff.abs() < NEWTON_TOLERANCE {
            return Some(sigma.clamp(IV_MIN, IV_MAX));
        }
        sigma -= diff / vega;
        sigma = sigma.clamp(IV_MIN, IV_MAX);
    }
    metrics::counter!("iv_solver_non_convergent_total", "reason" => "max_iters").increment(1);
    Some(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_underlying_yields_zero_greeks() {
        let input = GreeksInput {
            underlying_price: None,
            strike: 100.0,
            seconds_to_expiry: 86_400.0,
            option_type: OptionType::Call,
            risk_free_rate: 0.06,
            iv: 0.2,
        };
        let (g, cond) = black_scholes_greeks(&input);
        assert_eq!(cond, GreeksCondition::MissingUnderlying);
        assert_eq!(g.delta, 0.0);
    }

    #[test]
    fn expired_option_yields_zero_greeks() {
        let input = GreeksInput {
            underlying_price: Some(100.0),
            strike: 100.0,
            seconds_to_expiry: -10.0,
            option_type: OptionType::Call,
            risk_free_rate: 0.06,
            iv: 0.2,
        };
        let (g, cond) = black_scholes_greeks(&input);
        assert_eq!(cond, GreeksCondition::Expired);
        assert_eq!(g.vega, 0.0);
    }

    #[test]
    fn atm_call_delta_is_near_half() {
        let input = GreeksInput {
            underlying_price: Some(100.0),
            strike: 100.0,
            seconds_to_expiry: 30.0 * 86_400.0,
            option_type: OptionType::Call,
            risk_free_rate: 0.06,
            iv: 0.2,
        };
        let (g, cond) = black_scholes_greeks(&input);
        assert_eq!(cond, GreeksCondition::Ok);
        assert!(g.delta > 0.4 && g.delta < 0.7);
    }

    #[test]
    fn implied_vol_round_trips_through_price() {
        let input = GreeksInput {
            underlying_price: Some(100.0),
            strike: 100.0,
            seconds_to_expiry: 30.0 * 86_400.0,
            option_type: OptionType::Call,
            risk_free_rate: 0.06,
            iv: 0.25,
        };
        let normal = Normal::new(0.0, 1.0).unwrap();
        let t = input.seconds_to_expiry / SECONDS_PER_YEAR;
        let d1 = ((input.underlying_price.unwrap() / input.strike).ln()
            + (input.risk_free_rate + 0.5 * input.iv * input.iv) * t)
            / (input.iv * t.sqrt());
        let d2 = d1 - input.iv * t.sqrt();
        let price = input.underlying_price.unwrap() * normal.cdf(d1)
            - input.strike * (-input.risk_free_rate * t).exp() * normal.cdf(d2);

        let iv = implied_volatility(
            price,
            input.underlying_price.unwrap(),
            input.strike,
            input.seconds_to_expiry,
            input.option_type,
            input.risk_free_rate,
        )
        .unwrap();
        assert!((iv - 0.25).abs() < 0.01);
    }
}
