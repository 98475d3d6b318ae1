//! Shared data types for the streaming pipeline and control plane.
//!
//! Tagged sums over tick variants rather than dynamic dicts — see
//! DESIGN.md "Dynamic tick dicts" note.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Broker's numeric instrument identifier.
pub type Token = u64;
pub type AccountId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    UnderlyingIndex,
    EquityOption,
    Future,
    Equity,
}

impl Segment {
    pub fn is_option(&self) -> bool {
        matches!(self, Segment::EquityOption)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

/// Immutable-within-a-trading-day instrument metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub token: Token,
    pub trading_symbol: String,
    pub segment: Segment,
    pub option_type: Option<OptionType>,
    pub strike: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub lot_size: u32,
    pub tick_size: f64,
    pub exchange: String,
    /// For options, the token of the underlying instrument used for Greeks.
    pub underlying_token: Option<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Ltp,
    Quote,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub token: Token,
    pub mode: Mode,
    pub account_id: Option<AccountId>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Depth levels, kept opaque to the core beyond validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    pub orders: u32,
}

/// A single tick as received from the broker, tagged by segment so the
/// processor can dispatch without probing fields dynamically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub token: Token,
    pub last_price: f64,
    pub volume: Option<u64>,
    pub oi: Option<u64>,
    pub depth: Option<Vec<DepthLevel>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Tick plus Greeks, emitted on the options channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub token: Token,
    pub last_price: f64,
    pub volume: Option<u64>,
    pub oi: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub underlying_price: Option<f64>,
    pub iv: f64,
    pub greeks: Greeks,
    /// Dedup fingerprint for the current batch window.
    pub fingerprint: u64,
}

/// Underlying bar snapshot, emitted on the underlying channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingSnapshot {
    pub token: Token,
    pub symbol: String,
    pub last_price: f64,
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventType {
    SubscriptionCreated,
    SubscriptionRemoved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub event_type: SubscriptionEventType,
    pub instrument_token: Token,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
