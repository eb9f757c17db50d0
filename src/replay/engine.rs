//! Simulation engine boundary.
//!
//! The matching/accounting engine is an external capability. The orchestrator
//! drives it through [`SimulationEngine`] and never reinterprets its output.

use crate::replay::events::{AccountSnapshot, FillRecord, NormalizedEvent, OrderRecord, PositionSnapshot};
use crate::replay::exec_algo::ExecAlgorithm;
use crate::replay::run_spec::{InstrumentSpec, RunSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Opaque failure reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EngineError {}

/// Raw records produced by one engine run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub orders: Vec<OrderRecord>,
    pub fills: Vec<FillRecord>,
    pub positions: Vec<PositionSnapshot>,
    pub accounts: Vec<AccountSnapshot>,
}

/// External replay / execution-simulation engine.
///
/// Replay inside `run` is deterministic and single-threaded.
pub trait SimulationEngine: Send {
    fn register_instrument(&mut self, instrument: &InstrumentSpec) -> Result<(), EngineError>;

    /// Hand over the time-bounded catalog slice for the next run.
    fn load_data(&mut self, events: Vec<NormalizedEvent>) -> Result<(), EngineError>;

    fn run(
        &mut self,
        spec: &RunSpec,
        exec_algo: Option<Box<dyn ExecAlgorithm>>,
    ) -> Result<(), EngineError>;

    fn extract_results(&mut self) -> Result<EngineOutput, EngineError>;
}

/// Makes instrument registration idempotent across runs on one engine.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    registered: HashSet<String>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register unless already registered. Returns whether the engine was called.
    pub fn ensure_registered(
        &mut self,
        engine: &mut dyn SimulationEngine,
        instrument: &InstrumentSpec,
    ) -> Result<bool, EngineError> {
        if self.registered.contains(&instrument.instrument_id) {
            debug!(instrument_id = %instrument.instrument_id, "Instrument already registered");
            return Ok(false);
        }
        engine.register_instrument(instrument)?;
        self.registered.insert(instrument.instrument_id.clone());
        Ok(true)
    }

    pub fn is_registered(&self, instrument_id: &str) -> bool {
        self.registered.contains(instrument_id)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingEngine {
        registrations: usize,
    }

    impl SimulationEngine for CountingEngine {
        fn register_instrument(&mut self, instrument: &InstrumentSpec) -> Result<(), EngineError> {
            if instrument.instrument_id.is_empty() {
                return Err(EngineError::new("empty id"));
            }
            self.registrations += 1;
            Ok(())
        }

        fn load_data(&mut self, _events: Vec<NormalizedEvent>) -> Result<(), EngineError> {
            Ok(())
        }

        fn run(
            &mut self,
            _spec: &RunSpec,
            _exec_algo: Option<Box<dyn ExecAlgorithm>>,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn extract_results(&mut self) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput::default())
        }
    }

    fn instrument(id: &str) -> InstrumentSpec {
        InstrumentSpec {
            instrument_id: id.to_string(),
            symbol: "BTCUSDT".into(),
            venue: "BINANCE".into(),
            price_precision: 2,
            size_precision: 3,
            tick_size: 0.01,
            lot_size: 0.001,
        }
    }

    #[test]
    fn test_reregistration_is_noop() {
        let mut engine = CountingEngine::default();
        let mut registry = InstrumentRegistry::new();
        let btc = instrument("BTCUSDT.BINANCE");

        assert!(registry.ensure_registered(&mut engine, &btc).unwrap());
        assert!(!registry.ensure_registered(&mut engine, &btc).unwrap());
        assert_eq!(engine.registrations, 1);
        assert!(registry.is_registered("BTCUSDT.BINANCE"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_registration_not_recorded() {
        let mut engine = CountingEngine::default();
        let mut registry = InstrumentRegistry::new();
        assert!(registry.ensure_registered(&mut engine, &instrument("")).is_err());
        assert!(registry.is_empty());
    }
}
