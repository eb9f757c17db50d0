//! Run Specification
//!
//! Everything one engine invocation needs: instrument, venue, window, data
//! kind, strategy selection and optional execution algorithm. A `RunSpec` is
//! only produced by [`RunSpecBuilder::build`], which validates every field
//! before any I/O happens.
//!
//! # Canonicalization
//!
//! The canonical form is the compact JSON serialization. Struct fields
//! serialize in declaration order and every parameter map is a `BTreeMap`, so
//! identical specs always produce identical bytes and hashes.

use crate::replay::clock::{Nanos, TimeWindow};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::DataKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Free-form strategy / algorithm parameters, ordered for stable hashing.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

const MAX_PRECISION: u8 = 16;

// =============================================================================
// COMPONENTS
// =============================================================================

/// Instrument identity and precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Canonical venue-qualified id, `<symbol>.<venue>`.
    pub instrument_id: String,
    pub symbol: String,
    pub venue: String,
    pub price_precision: u8,
    pub size_precision: u8,
    pub tick_size: f64,
    pub lot_size: f64,
}

impl InstrumentSpec {
    /// Split `BTCUSDT-PERP.BINANCE` into symbol and venue at the last `.`.
    pub fn split_id(instrument_id: &str) -> Option<(&str, &str)> {
        let (symbol, venue) = instrument_id.trim().rsplit_once('.')?;
        if symbol.is_empty() || venue.is_empty() {
            return None;
        }
        Some((symbol, venue))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Cash,
    Margin,
}

impl AccountType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "margin" => Some(Self::Margin),
            _ => None,
        }
    }
}

/// Venue parameters passed through to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    pub account_type: AccountType,
    pub base_currency: String,
    pub starting_balance: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub mode: String,
    #[serde(default)]
    pub params: ParamMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecAlgoSpec {
    pub name: String,
    #[serde(default)]
    pub params: ParamMap,
}

// =============================================================================
// RUN SPEC
// =============================================================================

/// Immutable description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    instrument: InstrumentSpec,
    venue: VenueConfig,
    window: TimeWindow,
    data_kind: DataKind,
    strategy: StrategySpec,
    exec_algo: Option<ExecAlgoSpec>,
}

impl RunSpec {
    pub fn instrument(&self) -> &InstrumentSpec {
        &self.instrument
    }

    pub fn venue(&self) -> &VenueConfig {
        &self.venue
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn data_kind(&self) -> DataKind {
        self.data_kind
    }

    pub fn strategy(&self) -> &StrategySpec {
        &self.strategy
    }

    pub fn exec_algo(&self) -> Option<&ExecAlgoSpec> {
        self.exec_algo.as_ref()
    }

    /// Compact canonical JSON.
    pub fn canonical_json(&self) -> ReplayResult<String> {
        serde_json::to_string(self).map_err(|e| ReplayError::serialization("run_spec", e))
    }

    /// Hex SHA-256 of the canonical JSON.
    pub fn config_hash(&self) -> ReplayResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json()?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Collects run fields and validates them in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct RunSpecBuilder {
    instrument_id: Option<String>,
    price_precision: Option<u8>,
    size_precision: Option<u8>,
    venue_name: Option<String>,
    account_type: Option<AccountType>,
    base_currency: Option<String>,
    starting_balance: Option<f64>,
    maker_fee: f64,
    taker_fee: f64,
    start_ns: Option<Nanos>,
    end_ns: Option<Nanos>,
    data_kind: Option<DataKind>,
    strategy_name: Option<String>,
    strategy_mode: Option<String>,
    strategy_params: ParamMap,
    exec_algo: Option<ExecAlgoSpec>,
}

impl RunSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrument(mut self, instrument_id: impl Into<String>) -> Self {
        self.instrument_id = Some(instrument_id.into());
        self
    }

    pub fn precision(mut self, price_precision: u8, size_precision: u8) -> Self {
        self.price_precision = Some(price_precision);
        self.size_precision = Some(size_precision);
        self
    }

    /// Venue name defaults to the instrument id's venue suffix.
    pub fn venue_name(mut self, name: impl Into<String>) -> Self {
        self.venue_name = Some(name.into());
        self
    }

    pub fn account(
        mut self,
        account_type: AccountType,
        base_currency: impl Into<String>,
        starting_balance: f64,
    ) -> Self {
        self.account_type = Some(account_type);
        self.base_currency = Some(base_currency.into());
        self.starting_balance = Some(starting_balance);
        self
    }

    pub fn fees(mut self, maker_fee: f64, taker_fee: f64) -> Self {
        self.maker_fee = maker_fee;
        self.taker_fee = taker_fee;
        self
    }

    pub fn window(mut self, start_ns: Nanos, end_ns: Nanos) -> Self {
        self.start_ns = Some(start_ns);
        self.end_ns = Some(end_ns);
        self
    }

    pub fn data_kind(mut self, data_kind: DataKind) -> Self {
        self.data_kind = Some(data_kind);
        self
    }

    pub fn strategy(mut self, name: impl Into<String>, mode: impl Into<String>) -> Self {
        self.strategy_name = Some(name.into());
        self.strategy_mode = Some(mode.into());
        self
    }

    pub fn strategy_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.strategy_params.insert(key.into(), value);
        self
    }

    pub fn exec_algo(mut self, name: impl Into<String>, params: ParamMap) -> Self {
        self.exec_algo = Some(ExecAlgoSpec {
            name: name.into(),
            params,
        });
        self
    }

    pub fn build(self) -> ReplayResult<RunSpec> {
        let instrument_id = required(self.instrument_id, "instrument_id")?;
        let (symbol, venue_suffix) = InstrumentSpec::split_id(&instrument_id).ok_or_else(|| {
            ReplayError::config(format!(
                "instrument_id '{}' must be venue-qualified as <symbol>.<venue>",
                instrument_id
            ))
        })?;
        let (symbol, venue_suffix) = (symbol.to_string(), venue_suffix.to_string());

        let price_precision = required(self.price_precision, "price_precision")?;
        let size_precision = required(self.size_precision, "size_precision")?;
        if price_precision > MAX_PRECISION || size_precision > MAX_PRECISION {
            return Err(ReplayError::config(format!(
                "precision must be <= {} (price={}, size={})",
                MAX_PRECISION, price_precision, size_precision
            )));
        }

        let starting_balance = required(self.starting_balance, "starting_balance")?;
        if !starting_balance.is_finite() || starting_balance <= 0.0 {
            return Err(ReplayError::config(format!(
                "starting_balance must be positive, got {}",
                starting_balance
            )));
        }
        for (name, fee) in [("maker_fee", self.maker_fee), ("taker_fee", self.taker_fee)] {
            if !fee.is_finite() || fee.abs() >= 1.0 {
                return Err(ReplayError::config(format!(
                    "{} must be a finite rate in (-1, 1), got {}",
                    name, fee
                )));
            }
        }
        let base_currency = required(self.base_currency, "base_currency")?;
        if base_currency.trim().is_empty() {
            return Err(ReplayError::config("base_currency must not be empty"));
        }

        let start_ns = required(self.start_ns, "start")?;
        let end_ns = required(self.end_ns, "end")?;
        let window = TimeWindow::new(start_ns, end_ns).ok_or_else(|| {
            ReplayError::config(format!(
                "window end ({}) must be after start ({})",
                end_ns, start_ns
            ))
        })?;

        let strategy_name = required(self.strategy_name, "strategy")?;
        if strategy_name.trim().is_empty() {
            return Err(ReplayError::config("strategy name must not be empty"));
        }
        if let Some(algo) = &self.exec_algo {
            if algo.name.trim().is_empty() {
                return Err(ReplayError::config("exec_algo name must not be empty"));
            }
        }

        Ok(RunSpec {
            instrument: InstrumentSpec {
                instrument_id: instrument_id.trim().to_string(),
                symbol,
                venue: venue_suffix.clone(),
                price_precision,
                size_precision,
                tick_size: 10f64.powi(-(price_precision as i32)),
                lot_size: 10f64.powi(-(size_precision as i32)),
            },
            venue: VenueConfig {
                name: self.venue_name.unwrap_or(venue_suffix),
                account_type: self.account_type.unwrap_or(AccountType::Cash),
                base_currency,
                starting_balance,
                maker_fee: self.maker_fee,
                taker_fee: self.taker_fee,
            },
            window,
            data_kind: self.data_kind.unwrap_or(DataKind::Trades),
            strategy: StrategySpec {
                name: strategy_name,
                mode: self.strategy_mode.unwrap_or_else(|| "default".to_string()),
                params: self.strategy_params,
            },
            exec_algo: self.exec_algo,
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> ReplayResult<T> {
    value.ok_or_else(|| ReplayError::config(format!("missing required field '{}'", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> RunSpecBuilder {
        RunSpecBuilder::new()
            .instrument("BTCUSDT-PERP.BINANCE")
            .precision(2, 3)
            .account(AccountType::Margin, "USDT", 10_000.0)
            .fees(0.0002, 0.0004)
            .window(1_706_140_800_000_000_000, 1_706_140_860_000_000_000)
            .strategy("one_per_event", "backtest")
    }

    #[test]
    fn test_build_fills_derived_fields() {
        let spec = base_builder().build().unwrap();
        assert_eq!(spec.instrument().symbol, "BTCUSDT-PERP");
        assert_eq!(spec.instrument().venue, "BINANCE");
        assert_eq!(spec.venue().name, "BINANCE");
        assert!((spec.instrument().tick_size - 0.01).abs() < 1e-12);
        assert_eq!(spec.data_kind(), DataKind::Trades);
        assert!(spec.exec_algo().is_none());
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        let err = RunSpecBuilder::new().build().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("instrument_id"));

        let err = base_builder().window(10, 10).build().unwrap_err();
        assert!(err.to_string().contains("window"));

        let err = base_builder().instrument("BTCUSDT").build().unwrap_err();
        assert!(err.to_string().contains("venue-qualified"));

        let err = base_builder()
            .account(AccountType::Cash, "USD", 0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("starting_balance"));

        let err = base_builder().fees(1.5, 0.0).build().unwrap_err();
        assert!(err.to_string().contains("maker_fee"));
    }

    #[test]
    fn test_canonical_hash_is_stable() {
        let a = base_builder()
            .strategy_param("z", serde_json::json!(1))
            .strategy_param("a", serde_json::json!("x"))
            .build()
            .unwrap();
        let b = base_builder()
            .strategy_param("a", serde_json::json!("x"))
            .strategy_param("z", serde_json::json!(1))
            .build()
            .unwrap();
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());
        assert_eq!(a.config_hash().unwrap().len(), 64);

        let c = base_builder().fees(0.0, 0.0).build().unwrap();
        assert_ne!(a.config_hash().unwrap(), c.config_hash().unwrap());
    }
}
