//! Run Metrics
//!
//! Execution counts, rejected-order analysis, PnL decomposition, drawdown and
//! win rate, all derived from the engine's raw order / fill / position
//! records.
//!
//! # PnL decomposition
//!
//! ```text
//! realized                  average-cost PnL of every non-closing fill
//! unrealized_before_closing latest BeforeClose snapshot per instrument,
//!                           else PnL realized by the engine's close-out fills
//! unrealized_after_closing  latest AfterClose snapshot per instrument
//! commissions               minus the sum of all fill commissions
//! net                       realized + unrealized_before_closing + commissions
//! ```

use crate::replay::events::{
    FillRecord, InstrumentId, LiquiditySide, OrderRecord, PositionSnapshot, Price, Side, Size,
    SnapshotStage,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Positions smaller than this are flat.
const FLAT_EPSILON: f64 = 1e-9;
const UNSPECIFIED_REASON: &str = "unspecified";

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    pub orders: u64,
    pub fills: u64,
    /// Distinct orders with at least one fill.
    pub filled_orders: u64,
    /// `filled_orders / orders`.
    pub fill_rate: f64,
    pub volume: Size,
    pub notional: f64,
    pub maker_fills: u64,
    pub taker_fills: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideCounts {
    pub buy: u64,
    pub sell: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Price,
    pub max: Price,
    pub avg: Price,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectedOrderAnalysis {
    pub total: u64,
    pub by_side: SideCounts,
    pub reasons: BTreeMap<String, u64>,
    /// Present iff `total > 0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_range: Option<PriceRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub realized: f64,
    pub unrealized_before_closing: f64,
    pub unrealized_after_closing: f64,
    /// Signed negative.
    pub commissions: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub counts: ExecutionCounts,
    pub rejected: RejectedOrderAnalysis,
    pub pnl: PnlBreakdown,
    pub max_drawdown_pct: f64,
    /// Profitable flat-to-flat cycles over all completed cycles.
    pub win_rate: f64,
    pub round_trips: u64,
    pub final_equity: f64,
}

// ============================================================================
// Position accounting
// ============================================================================

/// Average-cost position for one instrument.
#[derive(Debug, Clone, Default)]
struct CostBasis {
    quantity: Size,
    avg_price: Price,
    cycle_pnl: f64,
}

impl CostBasis {
    /// Apply a fill, returning the PnL it realizes.
    fn apply(&mut self, side: Side, qty: Size, price: Price) -> f64 {
        if qty <= 0.0 {
            return 0.0;
        }
        let delta = side.sign() * qty;
        if self.quantity.abs() <= FLAT_EPSILON || self.quantity.signum() == delta.signum() {
            let held = self.quantity.abs();
            self.avg_price = (held * self.avg_price + qty * price) / (held + qty);
            self.quantity += delta;
            return 0.0;
        }

        let closed = qty.min(self.quantity.abs());
        let realized = closed * (price - self.avg_price) * self.quantity.signum();
        let opened = qty - closed;
        if opened > FLAT_EPSILON {
            // Flipped through flat.
            self.quantity = delta.signum() * opened;
            self.avg_price = price;
        } else {
            self.quantity += delta;
            if self.quantity.abs() <= FLAT_EPSILON {
                self.quantity = 0.0;
                self.avg_price = 0.0;
            }
        }
        realized
    }

    fn is_flat(&self) -> bool {
        self.quantity.abs() <= FLAT_EPSILON
    }
}

// ============================================================================
// Calculator
// ============================================================================

/// Derives [`RunMetrics`] from raw engine output.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    starting_balance: f64,
}

impl MetricsCalculator {
    pub fn new(starting_balance: f64) -> Self {
        Self { starting_balance }
    }

    pub fn compute(
        &self,
        orders: &[OrderRecord],
        fills: &[FillRecord],
        positions: &[PositionSnapshot],
    ) -> RunMetrics {
        let counts = execution_counts(orders, fills);
        let rejected = rejected_analysis(orders);

        // Replay fills in event order; equal timestamps keep emission order.
        let mut ordered: Vec<&FillRecord> = fills.iter().collect();
        ordered.sort_by_key(|f| f.ts_event_ns);

        let mut books: HashMap<&str, CostBasis> = HashMap::new();
        let mut realized = 0.0;
        let mut closing_realized = 0.0;
        let mut commission_paid = 0.0;
        let mut equity = self.starting_balance;
        let mut peak = self.starting_balance;
        let mut max_drawdown_pct: f64 = 0.0;
        let mut wins = 0u64;
        let mut cycles = 0u64;

        for fill in ordered {
            let book = books.entry(fill.instrument_id.as_str()).or_default();
            let was_flat = book.is_flat();
            let prev_sign = book.quantity.signum();
            let pnl = book.apply(fill.side, fill.quantity, fill.price);

            if fill.closing {
                closing_realized += pnl;
            } else {
                realized += pnl;
            }
            commission_paid += fill.commission;

            if was_flat {
                book.cycle_pnl = 0.0;
            }
            book.cycle_pnl += pnl - fill.commission;
            // A cycle ends when the position returns to flat or flips through it.
            if !was_flat && (book.is_flat() || book.quantity.signum() != prev_sign) {
                cycles += 1;
                if book.cycle_pnl > 0.0 {
                    wins += 1;
                }
                book.cycle_pnl = 0.0;
            }

            equity += pnl - fill.commission;
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_drawdown_pct = max_drawdown_pct.max((peak - equity) / peak * 100.0);
            }
        }

        let before = latest_unrealized(positions, SnapshotStage::BeforeClose);
        let after = latest_unrealized(positions, SnapshotStage::AfterClose);
        let unrealized_before_closing = before.unwrap_or(closing_realized);
        let unrealized_after_closing = after.unwrap_or(0.0);
        let commissions = 0.0 - commission_paid;

        RunMetrics {
            counts,
            rejected,
            pnl: PnlBreakdown {
                realized,
                unrealized_before_closing,
                unrealized_after_closing,
                commissions,
                net: realized + unrealized_before_closing + commissions,
            },
            max_drawdown_pct,
            win_rate: if cycles == 0 {
                0.0
            } else {
                wins as f64 / cycles as f64
            },
            round_trips: cycles,
            final_equity: equity,
        }
    }
}

fn execution_counts(orders: &[OrderRecord], fills: &[FillRecord]) -> ExecutionCounts {
    let filled: HashSet<_> = fills.iter().map(|f| f.order_id).collect();
    let order_ids: HashSet<_> = orders.iter().map(|o| o.order_id).collect();
    let filled_orders = filled.intersection(&order_ids).count() as u64;

    ExecutionCounts {
        orders: orders.len() as u64,
        fills: fills.len() as u64,
        filled_orders,
        fill_rate: if orders.is_empty() {
            0.0
        } else {
            filled_orders as f64 / orders.len() as f64
        },
        volume: fills.iter().map(|f| f.quantity).sum(),
        notional: fills.iter().map(|f| f.notional()).sum(),
        maker_fills: fills
            .iter()
            .filter(|f| f.liquidity == LiquiditySide::Maker)
            .count() as u64,
        taker_fills: fills
            .iter()
            .filter(|f| f.liquidity == LiquiditySide::Taker)
            .count() as u64,
    }
}

fn rejected_analysis(orders: &[OrderRecord]) -> RejectedOrderAnalysis {
    let rejected: Vec<&OrderRecord> = orders.iter().filter(|o| o.status.is_rejected()).collect();
    let mut analysis = RejectedOrderAnalysis {
        total: rejected.len() as u64,
        ..Default::default()
    };

    for order in &rejected {
        match order.side {
            Side::Buy => analysis.by_side.buy += 1,
            Side::Sell => analysis.by_side.sell += 1,
        }
        let reason = order
            .reject_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(UNSPECIFIED_REASON);
        *analysis.reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    if !rejected.is_empty() {
        let prices = rejected.iter().map(|o| o.price);
        let min = prices.clone().fold(f64::INFINITY, f64::min);
        let max = prices.clone().fold(f64::NEG_INFINITY, f64::max);
        let avg = prices.sum::<f64>() / rejected.len() as f64;
        analysis.price_range = Some(PriceRange { min, max, avg });
    }
    analysis
}

/// Sum of the latest snapshot of `stage` per instrument; `None` if there are none.
fn latest_unrealized(positions: &[PositionSnapshot], stage: SnapshotStage) -> Option<f64> {
    let mut latest: BTreeMap<&InstrumentId, &PositionSnapshot> = BTreeMap::new();
    for snap in positions.iter().filter(|p| p.stage == stage) {
        match latest.get(&snap.instrument_id) {
            Some(prev) if prev.ts_ns > snap.ts_ns => {}
            _ => {
                latest.insert(&snap.instrument_id, snap);
            }
        }
    }
    if latest.is_empty() {
        None
    } else {
        Some(latest.values().map(|s| s.unrealized_pnl).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::clock::Nanos;
    use crate::replay::events::{OrderStatus, OrderType};

    fn order(id: u64, side: Side, price: Price, status: OrderStatus, reason: Option<&str>) -> OrderRecord {
        OrderRecord {
            order_id: id,
            client_order_id: format!("c{}", id),
            instrument_id: "A.X".into(),
            side,
            order_type: OrderType::Limit,
            quantity: 1.0,
            price,
            status,
            reject_reason: reason.map(str::to_string),
            submitted_at_ns: id as Nanos,
            last_update_ns: id as Nanos,
        }
    }

    fn fill(id: u64, side: Side, qty: Size, price: Price, ts: Nanos, closing: bool) -> FillRecord {
        FillRecord {
            fill_id: id,
            order_id: id,
            instrument_id: "A.X".into(),
            side,
            quantity: qty,
            price,
            commission: 0.5,
            liquidity: LiquiditySide::Taker,
            ts_event_ns: ts,
            closing,
        }
    }

    fn snapshot(ts: Nanos, unrealized: f64, stage: SnapshotStage) -> PositionSnapshot {
        PositionSnapshot {
            instrument_id: "A.X".into(),
            ts_ns: ts,
            quantity: 1.0,
            avg_price: 100.0,
            realized_pnl: 0.0,
            unrealized_pnl: unrealized,
            stage,
        }
    }

    #[test]
    fn test_zero_fill_run_is_all_zeros() {
        let m = MetricsCalculator::new(1_000.0).compute(&[], &[], &[]);
        assert_eq!(m.counts, ExecutionCounts::default());
        assert_eq!(m.pnl, PnlBreakdown::default());
        assert_eq!(m.max_drawdown_pct, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert!(m.rejected.price_range.is_none());
        assert_eq!(m.final_equity, 1_000.0);
    }

    #[test]
    fn test_counts_and_fill_rate() {
        let orders = vec![
            order(1, Side::Buy, 100.0, OrderStatus::Filled, None),
            order(2, Side::Sell, 101.0, OrderStatus::Filled, None),
            order(3, Side::Buy, 99.0, OrderStatus::Canceled, None),
            order(4, Side::Buy, 98.0, OrderStatus::Accepted, None),
        ];
        let mut fills = vec![
            fill(1, Side::Buy, 1.0, 100.0, 10, false),
            fill(2, Side::Sell, 0.5, 101.0, 20, false),
        ];
        // Second partial on order 2.
        let mut extra = fill(3, Side::Sell, 0.5, 101.0, 21, false);
        extra.order_id = 2;
        fills.push(extra);

        let m = MetricsCalculator::new(1_000.0).compute(&orders, &fills, &[]);
        assert_eq!(m.counts.orders, 4);
        assert_eq!(m.counts.fills, 3);
        assert_eq!(m.counts.filled_orders, 2);
        assert_eq!(m.counts.fill_rate, 0.5);
        assert_eq!(m.counts.volume, 2.0);
        assert_eq!(m.counts.notional, 201.0);
        assert_eq!(m.counts.taker_fills, 3);
    }

    #[test]
    fn test_rejected_analysis() {
        let orders = vec![
            order(1, Side::Buy, 100.0, OrderStatus::Rejected, Some("insufficient balance")),
            order(2, Side::Sell, 110.0, OrderStatus::Rejected, Some("insufficient balance")),
            order(3, Side::Sell, 90.0, OrderStatus::Rejected, None),
            order(4, Side::Buy, 95.0, OrderStatus::Filled, None),
        ];
        let r = MetricsCalculator::new(1.0).compute(&orders, &[], &[]).rejected;
        assert_eq!(r.total, 3);
        assert_eq!(r.by_side.buy + r.by_side.sell, r.total);
        assert_eq!(r.by_side.sell, 2);
        assert_eq!(r.reasons.get("insufficient balance"), Some(&2));
        assert_eq!(r.reasons.get(UNSPECIFIED_REASON), Some(&1));
        let range = r.price_range.unwrap();
        assert!(range.min <= range.avg && range.avg <= range.max);
        assert_eq!(range.min, 90.0);
        assert_eq!(range.max, 110.0);
        assert_eq!(range.avg, 100.0);
    }

    #[test]
    fn test_average_cost_realized_pnl() {
        let fills = vec![
            fill(1, Side::Buy, 1.0, 100.0, 1, false),
            fill(2, Side::Buy, 1.0, 110.0, 2, false),
            // avg 105; selling 1 at 115 realizes 10
            fill(3, Side::Sell, 1.0, 115.0, 3, false),
        ];
        let m = MetricsCalculator::new(1_000.0).compute(&[], &fills, &[]);
        assert!((m.pnl.realized - 10.0).abs() < 1e-9);
        assert_eq!(m.pnl.commissions, -1.5);
        assert_eq!(m.round_trips, 0);
    }

    #[test]
    fn test_zero_quantity_fill_leaves_basis_untouched() {
        let fills = vec![
            fill(1, Side::Buy, 0.0, 100.0, 1, false),
            fill(2, Side::Buy, 1.0, 100.0, 2, false),
            fill(3, Side::Sell, 1.0, 110.0, 3, false),
        ];
        let m = MetricsCalculator::new(1_000.0).compute(&[], &fills, &[]);
        assert!(m.pnl.realized.is_finite());
        assert!((m.pnl.realized - 10.0).abs() < 1e-9);
        assert!(m.pnl.net.is_finite());
    }

    #[test]
    fn test_closing_fills_feed_unrealized_before() {
        let fills = vec![
            fill(1, Side::Buy, 2.0, 100.0, 1, false),
            fill(2, Side::Sell, 1.0, 104.0, 2, false),
            fill(3, Side::Sell, 1.0, 98.0, 3, true),
        ];
        let m = MetricsCalculator::new(1_000.0).compute(&[], &fills, &[]);
        assert!((m.pnl.realized - 4.0).abs() < 1e-9);
        assert!((m.pnl.unrealized_before_closing + 2.0).abs() < 1e-9);
        assert_eq!(m.pnl.unrealized_after_closing, 0.0);
        assert_eq!(
            m.pnl.net,
            m.pnl.realized + m.pnl.unrealized_before_closing + m.pnl.commissions
        );
        // One flat-to-flat cycle: +4 -2 -1.5 commissions > 0.
        assert_eq!(m.round_trips, 1);
        assert_eq!(m.win_rate, 1.0);
    }

    #[test]
    fn test_snapshots_take_precedence() {
        let fills = vec![
            fill(1, Side::Buy, 1.0, 100.0, 1, false),
            fill(2, Side::Sell, 1.0, 90.0, 5, true),
        ];
        let positions = vec![
            snapshot(3, 7.0, SnapshotStage::BeforeClose),
            snapshot(4, -3.0, SnapshotStage::BeforeClose),
            snapshot(6, 0.25, SnapshotStage::AfterClose),
        ];
        let m = MetricsCalculator::new(1_000.0).compute(&[], &fills, &positions);
        assert_eq!(m.pnl.unrealized_before_closing, -3.0);
        assert_eq!(m.pnl.unrealized_after_closing, 0.25);
        assert_eq!(
            m.pnl.net,
            m.pnl.realized + m.pnl.unrealized_before_closing + m.pnl.commissions
        );
    }

    #[test]
    fn test_drawdown_and_win_rate() {
        let fills = vec![
            // win: +10 - 1 commissions
            fill(1, Side::Buy, 1.0, 100.0, 1, false),
            fill(2, Side::Sell, 1.0, 110.0, 2, false),
            // loss: -20 - 1
            fill(3, Side::Sell, 1.0, 100.0, 3, false),
            fill(4, Side::Buy, 1.0, 120.0, 4, false),
        ];
        let m = MetricsCalculator::new(100.0).compute(&[], &fills, &[]);
        assert_eq!(m.round_trips, 2);
        assert_eq!(m.win_rate, 0.5);
        // peak 109 after the win, trough 88 after the loss
        assert!((m.final_equity - 88.0).abs() < 1e-9);
        let expected = (109.0 - 88.0) / 109.0 * 100.0;
        assert!((m.max_drawdown_pct - expected).abs() < 1e-9);
    }

    #[test]
    fn test_flip_through_flat_closes_cycle() {
        let fills = vec![
            fill(1, Side::Buy, 1.0, 100.0, 1, false),
            fill(2, Side::Sell, 2.0, 105.0, 2, false),
        ];
        let m = MetricsCalculator::new(1_000.0).compute(&[], &fills, &[]);
        assert_eq!(m.round_trips, 1);
        assert!((m.pnl.realized - 5.0).abs() < 1e-9);
    }
}
