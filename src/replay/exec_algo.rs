//! Execution Algorithm Adapters
//!
//! Split a parent quantity into child orders.
//!
//! # Supported Algorithms
//!
//! - `twap` - equal slices every `interval_secs` across the window
//! - `vwap` - slices proportional to a per-bucket volume share profile
//! - `iceberg` - one visible slice at a time, next slice only after a fill
//!
//! Every algorithm issues its final slice as `total - issued_so_far`, so the
//! child quantities summed in issue order equal the parent quantity exactly.

use crate::replay::clock::{Nanos, TimeWindow, NANOS_PER_SEC};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::{Side, Size};
use crate::replay::run_spec::ParamMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Fill amounts within this of the target count as complete.
const QTY_EPSILON: f64 = 1e-9;
/// Allowed drift of a share profile from 1.0.
const PROFILE_TOLERANCE: f64 = 1e-6;
const DEFAULT_VWAP_BUCKETS: usize = 10;

/// One child order emitted by an algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOrder {
    pub child_id: u64,
    pub side: Side,
    pub quantity: Size,
    /// `None` means submit immediately.
    pub scheduled_at_ns: Option<Nanos>,
}

/// Schedule bounds for slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceContext {
    pub start_ns: Nanos,
    pub end_ns: Nanos,
}

impl SliceContext {
    pub fn from_window(window: &TimeWindow) -> Self {
        Self {
            start_ns: window.start_ns,
            end_ns: window.end_ns,
        }
    }

    fn duration_ns(&self) -> ReplayResult<Nanos> {
        let duration = self.end_ns - self.start_ns;
        if duration <= 0 {
            return Err(ReplayError::config(format!(
                "execution window must be positive, got {}ns",
                duration
            )));
        }
        Ok(duration)
    }
}

/// Parent-order slicing contract.
pub trait ExecAlgorithm: Send {
    fn name(&self) -> &'static str;

    /// Plan the initial child orders for a parent of `total_quantity`.
    fn slice(
        &mut self,
        total_quantity: Size,
        side: Side,
        ctx: &SliceContext,
    ) -> ReplayResult<Vec<ChildOrder>>;

    /// Record a fill against a child; returns any follow-up children.
    fn on_fill(&mut self, child_id: u64, filled_qty: Size) -> Vec<ChildOrder>;

    /// Whether the whole parent quantity has been filled.
    fn is_complete(&self) -> bool;
}

fn validate_total(total_quantity: Size) -> ReplayResult<()> {
    if !total_quantity.is_finite() || total_quantity <= 0.0 {
        return Err(ReplayError::config(format!(
            "total quantity must be positive, got {}",
            total_quantity
        )));
    }
    Ok(())
}

/// Outstanding quantity per child, shared by the scheduled algorithms.
#[derive(Debug, Default)]
struct ChildBook {
    remaining: BTreeMap<u64, Size>,
    planned: bool,
}

impl ChildBook {
    fn track(&mut self, children: &[ChildOrder]) {
        self.planned = true;
        for child in children {
            self.remaining.insert(child.child_id, child.quantity);
        }
    }

    fn fill(&mut self, child_id: u64, qty: Size) {
        if let Some(left) = self.remaining.get_mut(&child_id) {
            *left -= qty;
            if *left <= QTY_EPSILON {
                self.remaining.remove(&child_id);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.planned && self.remaining.is_empty()
    }
}

/// Replace the last planned quantity with whatever the earlier slices left.
fn absorb_remainder(total: Size, mut quantities: Vec<Size>) -> Vec<Size> {
    let Some(last) = quantities.len().checked_sub(1) else {
        return quantities;
    };
    let issued: Size = quantities[..last].iter().sum();
    quantities[last] = total - issued;
    quantities
}

// =============================================================================
// TWAP
// =============================================================================

#[derive(Debug)]
pub struct TwapAlgorithm {
    interval_ns: Nanos,
    book: ChildBook,
}

impl TwapAlgorithm {
    pub fn new(interval_ns: Nanos) -> ReplayResult<Self> {
        if interval_ns <= 0 {
            return Err(ReplayError::config(format!(
                "twap interval must be positive, got {}ns",
                interval_ns
            )));
        }
        Ok(Self {
            interval_ns,
            book: ChildBook::default(),
        })
    }

    fn from_params(params: &ParamMap) -> ReplayResult<Self> {
        let secs = param_f64(params, "interval_secs")?.unwrap_or(60.0);
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ReplayError::config(format!(
                "twap interval_secs must be positive, got {}",
                secs
            )));
        }
        Self::new((secs * NANOS_PER_SEC as f64).round() as Nanos)
    }
}

impl ExecAlgorithm for TwapAlgorithm {
    fn name(&self) -> &'static str {
        "twap"
    }

    fn slice(
        &mut self,
        total_quantity: Size,
        side: Side,
        ctx: &SliceContext,
    ) -> ReplayResult<Vec<ChildOrder>> {
        validate_total(total_quantity)?;
        let duration = ctx.duration_ns()?;
        let n = ((duration + self.interval_ns - 1) / self.interval_ns) as usize;
        let planned = vec![total_quantity / n as f64; n];

        let children: Vec<ChildOrder> = absorb_remainder(total_quantity, planned)
            .into_iter()
            .enumerate()
            .map(|(i, quantity)| ChildOrder {
                child_id: i as u64,
                side,
                quantity,
                scheduled_at_ns: Some(ctx.start_ns + i as Nanos * self.interval_ns),
            })
            .collect();

        info!(
            algo = "twap",
            total_qty = total_quantity,
            slices = children.len(),
            interval_ns = self.interval_ns,
            "Sliced parent order"
        );
        self.book.track(&children);
        Ok(children)
    }

    fn on_fill(&mut self, child_id: u64, filled_qty: Size) -> Vec<ChildOrder> {
        self.book.fill(child_id, filled_qty);
        Vec::new()
    }

    fn is_complete(&self) -> bool {
        self.book.is_complete()
    }
}

// =============================================================================
// VWAP
// =============================================================================

#[derive(Debug)]
pub struct VwapAlgorithm {
    profile: Vec<f64>,
    book: ChildBook,
}

impl VwapAlgorithm {
    /// Fails unless shares are non-negative and sum to 1.0 within 1e-6.
    pub fn new(profile: Vec<f64>) -> ReplayResult<Self> {
        if profile.is_empty() {
            return Err(ReplayError::config("vwap profile must not be empty"));
        }
        if profile.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(ReplayError::config(
                "vwap profile shares must be finite and non-negative",
            ));
        }
        let sum: f64 = profile.iter().sum();
        if (sum - 1.0).abs() > PROFILE_TOLERANCE {
            return Err(ReplayError::config(format!(
                "vwap profile must sum to 1.0 (+/- {}), got {}",
                PROFILE_TOLERANCE, sum
            )));
        }
        Ok(Self {
            profile,
            book: ChildBook::default(),
        })
    }

    /// Intraday U shape: heavier at the open and close of the window.
    pub fn default_profile(buckets: usize) -> Vec<f64> {
        if buckets <= 1 {
            return vec![1.0; buckets];
        }
        let mid = (buckets - 1) as f64 / 2.0;
        let weights: Vec<f64> = (0..buckets)
            .map(|i| {
                let x = (i as f64 - mid) / mid;
                1.0 + 2.0 * x * x
            })
            .collect();
        let total: f64 = weights.iter().sum();
        weights.into_iter().map(|w| w / total).collect()
    }

    fn from_params(params: &ParamMap) -> ReplayResult<Self> {
        match params.get("profile") {
            Some(value) => {
                let shares = value
                    .as_array()
                    .ok_or_else(|| ReplayError::config("vwap profile must be an array"))?
                    .iter()
                    .map(|v| {
                        v.as_f64().ok_or_else(|| {
                            ReplayError::config(format!("vwap profile share {} is not a number", v))
                        })
                    })
                    .collect::<ReplayResult<Vec<f64>>>()?;
                Self::new(shares)
            }
            None => {
                let buckets = match param_f64(params, "buckets")? {
                    Some(b) if b >= 1.0 && b.fract() == 0.0 => b as usize,
                    Some(b) => {
                        return Err(ReplayError::config(format!(
                            "vwap buckets must be a positive integer, got {}",
                            b
                        )))
                    }
                    None => DEFAULT_VWAP_BUCKETS,
                };
                Self::new(Self::default_profile(buckets))
            }
        }
    }
}

impl ExecAlgorithm for VwapAlgorithm {
    fn name(&self) -> &'static str {
        "vwap"
    }

    fn slice(
        &mut self,
        total_quantity: Size,
        side: Side,
        ctx: &SliceContext,
    ) -> ReplayResult<Vec<ChildOrder>> {
        validate_total(total_quantity)?;
        let duration = ctx.duration_ns()?;
        let buckets = self.profile.len() as Nanos;

        // Zero-share buckets get no child.
        let active: Vec<(usize, f64)> = self
            .profile
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, share)| *share > 0.0)
            .collect();
        let planned: Vec<Size> = active.iter().map(|(_, s)| total_quantity * s).collect();

        let children: Vec<ChildOrder> = absorb_remainder(total_quantity, planned)
            .into_iter()
            .zip(&active)
            .enumerate()
            .map(|(n, (quantity, (bucket, _)))| ChildOrder {
                child_id: n as u64,
                side,
                quantity,
                scheduled_at_ns: Some(ctx.start_ns + duration * *bucket as Nanos / buckets),
            })
            .collect();

        info!(
            algo = "vwap",
            total_qty = total_quantity,
            buckets = self.profile.len(),
            slices = children.len(),
            "Sliced parent order"
        );
        self.book.track(&children);
        Ok(children)
    }

    fn on_fill(&mut self, child_id: u64, filled_qty: Size) -> Vec<ChildOrder> {
        self.book.fill(child_id, filled_qty);
        Vec::new()
    }

    fn is_complete(&self) -> bool {
        self.book.is_complete()
    }
}

// =============================================================================
// ICEBERG
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcebergState {
    Idle,
    VisibleWorking,
    Exhausted,
}

#[derive(Debug)]
pub struct IcebergAlgorithm {
    visible_fraction: f64,
    state: IcebergState,
    side: Side,
    total: Size,
    visible: Size,
    issued: Size,
    next_child_id: u64,
    working: Option<(u64, Size)>,
}

impl IcebergAlgorithm {
    pub fn new(visible_fraction: f64) -> ReplayResult<Self> {
        if !visible_fraction.is_finite() || visible_fraction <= 0.0 || visible_fraction > 1.0 {
            return Err(ReplayError::config(format!(
                "iceberg visible_fraction must be in (0, 1], got {}",
                visible_fraction
            )));
        }
        Ok(Self {
            visible_fraction,
            state: IcebergState::Idle,
            side: Side::Buy,
            total: 0.0,
            visible: 0.0,
            issued: 0.0,
            next_child_id: 0,
            working: None,
        })
    }

    fn from_params(params: &ParamMap) -> ReplayResult<Self> {
        Self::new(param_f64(params, "visible_fraction")?.unwrap_or(0.1))
    }

    pub fn state(&self) -> IcebergState {
        self.state
    }

    fn next_child(&mut self) -> ChildOrder {
        let left = self.total - self.issued;
        let quantity = if left <= self.visible + QTY_EPSILON {
            left
        } else {
            self.visible
        };
        self.issued += quantity;
        let child_id = self.next_child_id;
        self.next_child_id += 1;
        self.working = Some((child_id, quantity));
        self.state = IcebergState::VisibleWorking;
        ChildOrder {
            child_id,
            side: self.side,
            quantity,
            scheduled_at_ns: None,
        }
    }
}

impl ExecAlgorithm for IcebergAlgorithm {
    fn name(&self) -> &'static str {
        "iceberg"
    }

    fn slice(
        &mut self,
        total_quantity: Size,
        side: Side,
        ctx: &SliceContext,
    ) -> ReplayResult<Vec<ChildOrder>> {
        validate_total(total_quantity)?;
        ctx.duration_ns()?;
        if self.state != IcebergState::Idle {
            return Err(ReplayError::config("iceberg already sliced"));
        }
        self.side = side;
        self.total = total_quantity;
        self.visible = total_quantity * self.visible_fraction;
        self.issued = 0.0;

        let first = self.next_child();
        info!(
            algo = "iceberg",
            total_qty = total_quantity,
            visible_qty = self.visible,
            "Sliced parent order"
        );
        Ok(vec![first])
    }

    fn on_fill(&mut self, child_id: u64, filled_qty: Size) -> Vec<ChildOrder> {
        let Some((working_id, left)) = self.working else {
            return Vec::new();
        };
        if working_id != child_id {
            debug!(child_id, working_id, "Fill for non-working iceberg child ignored");
            return Vec::new();
        }
        let left = left - filled_qty;
        if left > QTY_EPSILON {
            self.working = Some((working_id, left));
            return Vec::new();
        }

        self.working = None;
        if self.total - self.issued <= QTY_EPSILON {
            self.state = IcebergState::Exhausted;
            return Vec::new();
        }
        vec![self.next_child()]
    }

    fn is_complete(&self) -> bool {
        self.state == IcebergState::Exhausted
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Registry of available execution algorithms with their descriptions.
pub fn available_exec_algorithms() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();
    map.insert("twap", "Equal slices at a fixed interval (param: interval_secs)");
    map.insert(
        "vwap",
        "Slices weighted by a volume profile (params: profile | buckets)",
    );
    map.insert(
        "iceberg",
        "One visible slice at a time (param: visible_fraction)",
    );
    map
}

/// Create an execution algorithm by name (case-insensitive).
pub fn make_exec_algorithm(name: &str, params: &ParamMap) -> ReplayResult<Box<dyn ExecAlgorithm>> {
    let name_lower = name.trim().to_lowercase();

    match name_lower.as_str() {
        "twap" | "time_weighted" | "time-weighted" => Ok(Box::new(TwapAlgorithm::from_params(params)?)),
        "vwap" | "volume_weighted" | "volume-weighted" => {
            Ok(Box::new(VwapAlgorithm::from_params(params)?))
        }
        "iceberg" | "ice" => Ok(Box::new(IcebergAlgorithm::from_params(params)?)),
        _ => {
            let mut available: Vec<_> = available_exec_algorithms().keys().copied().collect();
            available.sort_unstable();
            Err(ReplayError::config(format!(
                "Unknown execution algorithm: '{}'. Available: {}",
                name,
                available.join(", ")
            )))
        }
    }
}

fn param_f64(params: &ParamMap, key: &str) -> ReplayResult<Option<f64>> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| ReplayError::config(format!("param '{}' must be a number, got {}", key, value))),
    }
}
