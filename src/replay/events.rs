//! Event Model
//!
//! Canonical market events produced by normalization, and the raw order /
//! fill / position records handed back by the simulation engine.

use crate::replay::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for orders within one engine run.
pub type OrderId = u64;

/// Price in the instrument's quote currency.
pub type Price = f64;

/// Size/quantity in the instrument's base units.
pub type Size = f64;

/// Canonical, venue-qualified instrument key (e.g. `BTCUSDT-PERP.BINANCE`).
pub type InstrumentId = String;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of market data stored in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Trades,
    Quotes,
}

impl DataKind {
    /// Canonical name used in storage paths and catalog keys.
    pub fn storage_name(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Quotes => "quotes",
        }
    }

    pub fn from_storage_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trades" | "trade" | "ticks" => Some(Self::Trades),
            "quotes" | "quote" | "bbo" => Some(Self::Quotes),
            _ => None,
        }
    }

    pub fn all() -> &'static [DataKind] {
        &[Self::Trades, Self::Quotes]
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_name())
    }
}

/// Canonical market event. Every raw layout normalizes to this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Exchange event time (nanoseconds since epoch).
    pub event_time_ns: Nanos,
    /// Processing/receive time. Never earlier than `event_time_ns`.
    pub init_time_ns: Nanos,
    pub price: Price,
    pub size: Size,
    pub side: Side,
    /// Position in replay order within the partition (0-based, dense).
    pub sequence_id: u64,
    /// Venue trade id when the raw layout carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

// =============================================================================
// ENGINE RAW RECORDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Terminal (or last observed) status of an order as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// One order's lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub client_order_id: String,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Size,
    /// Limit price, or the reference price at submission for market orders.
    pub price: Price,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub submitted_at_ns: Nanos,
    pub last_update_ns: Nanos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiquiditySide {
    Maker,
    Taker,
}

/// One execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: u64,
    pub order_id: OrderId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub quantity: Size,
    pub price: Price,
    /// Commission paid, as a positive cost.
    pub commission: f64,
    pub liquidity: LiquiditySide,
    pub ts_event_ns: Nanos,
    /// Set on engine-issued close-out fills at end of run.
    #[serde(default)]
    pub closing: bool,
}

impl FillRecord {
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// When a position snapshot was taken relative to the explicit end-of-run close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStage {
    BeforeClose,
    AfterClose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument_id: InstrumentId,
    pub ts_ns: Nanos,
    /// Signed quantity (positive long, negative short).
    pub quantity: Size,
    pub avg_price: Price,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub stage: SnapshotStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub ts_ns: Nanos,
    pub balance: f64,
    pub equity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), -1.0);
        assert_eq!(Side::Buy.to_string(), "BUY");
    }

    #[test]
    fn test_data_kind_names() {
        for kind in DataKind::all() {
            assert_eq!(DataKind::from_storage_name(kind.storage_name()), Some(*kind));
        }
        assert_eq!(DataKind::from_storage_name(" BBO "), Some(DataKind::Quotes));
        assert_eq!(DataKind::from_storage_name("candles"), None);
    }

    #[test]
    fn test_event_serde_skips_missing_trade_id() {
        let ev = NormalizedEvent {
            event_time_ns: 1,
            init_time_ns: 1,
            price: 100.0,
            size: 1.0,
            side: Side::Buy,
            sequence_id: 0,
            trade_id: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("trade_id"));
        let back: NormalizedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
