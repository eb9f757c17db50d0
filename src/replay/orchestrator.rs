//! Run Orchestrator
//!
//! Drives one replay run end to end:
//!
//! 1. resolve the execution algorithm (fails before any I/O)
//! 2. register the instrument with the engine (idempotent)
//! 3. ensure catalog coverage, converting raw files on a miss
//! 4. one time-bounded catalog query, handed to the engine
//! 5. one synchronous engine run, then raw result extraction
//! 6. timeline, metrics, run id and summary from the raw records
//! 7. optional artifact write
//!
//! Progress is pushed as [`RunStatus`] messages. The status log of the last
//! run survives failure for diagnosis.

use crate::replay::artifact::{ArtifactWriter, DataQuality, RunSummary};
use crate::replay::cache::{CatalogCacheManager, CoverageOutcome};
use crate::replay::catalog::{CatalogQuery, PartitionKey};
use crate::replay::clock::wall_clock_ns;
use crate::replay::engine::{EngineError, EngineOutput, InstrumentRegistry, SimulationEngine};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::exec_algo::{make_exec_algorithm, ExecAlgorithm};
use crate::replay::metrics::{MetricsCalculator, RunMetrics};
use crate::replay::normalize::ConversionReport;
use crate::replay::run_id::RunId;
use crate::replay::run_spec::RunSpec;
use crate::replay::timeline::Timeline;
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// One-directional progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Started { instrument_id: String },
    CoverageChecked { cached: bool },
    DataLoaded { events: usize },
    EngineRunning,
    EngineCompleted { orders: usize, fills: usize },
    ResultsBuilt { run_id: String },
    Completed { run_id: String },
    Failed { kind: String, error: String },
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub spec: RunSpec,
    pub records: EngineOutput,
    pub timeline: Timeline,
    pub metrics: RunMetrics,
    pub summary: RunSummary,
    /// Present only when this run converted raw files.
    pub conversion: Option<ConversionReport>,
    pub status_log: Vec<RunStatus>,
}

pub struct RunOrchestrator {
    cache: Arc<CatalogCacheManager>,
    engine: Box<dyn SimulationEngine>,
    registry: InstrumentRegistry,
    artifacts: Option<ArtifactWriter>,
    status_tx: Option<Sender<RunStatus>>,
    status_log: Vec<RunStatus>,
}

fn engine_failure(stage: &str, err: EngineError) -> ReplayError {
    ReplayError::EngineExecution(format!("{}: {}", stage, err))
}

impl RunOrchestrator {
    pub fn new(cache: Arc<CatalogCacheManager>, engine: Box<dyn SimulationEngine>) -> Self {
        Self {
            cache,
            engine,
            registry: InstrumentRegistry::new(),
            artifacts: None,
            status_tx: None,
            status_log: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    pub fn with_status_channel(mut self, tx: Sender<RunStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Status messages of the most recent `execute` call.
    pub fn status_log(&self) -> &[RunStatus] {
        &self.status_log
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    fn emit(&mut self, status: RunStatus) {
        debug!(?status, "Run status");
        if let Some(tx) = &self.status_tx {
            // A dropped receiver only stops progress reporting.
            let _ = tx.send(status.clone());
        }
        self.status_log.push(status);
    }

    /// Execute one run. No retry on failure.
    pub fn execute(&mut self, spec: &RunSpec) -> ReplayResult<RunResult> {
        self.status_log.clear();
        match self.execute_inner(spec) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(
                    instrument_id = %spec.instrument().instrument_id,
                    kind = e.kind(),
                    error = %e,
                    "Run failed"
                );
                metrics::increment_counter!("replay_runs_failed_total");
                self.emit(RunStatus::Failed {
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn execute_inner(&mut self, spec: &RunSpec) -> ReplayResult<RunResult> {
        let created_at_ns = wall_clock_ns();
        let started = Instant::now();
        let instrument_id = spec.instrument().instrument_id.clone();

        let exec_algo: Option<Box<dyn ExecAlgorithm>> = spec
            .exec_algo()
            .map(|algo| make_exec_algorithm(&algo.name, &algo.params))
            .transpose()?;

        self.emit(RunStatus::Started {
            instrument_id: instrument_id.clone(),
        });

        self.registry
            .ensure_registered(self.engine.as_mut(), spec.instrument())
            .map_err(|e| engine_failure("register_instrument", e))?;

        let coverage = self
            .cache
            .ensure_coverage(&instrument_id, spec.data_kind(), spec.window())?;
        self.emit(RunStatus::CoverageChecked {
            cached: !coverage.was_converted(),
        });

        let key = PartitionKey::new(instrument_id.clone(), spec.data_kind());
        let events = self
            .cache
            .catalog()
            .query(&CatalogQuery::new(key.clone(), spec.window()))?;
        let event_count = events.len();
        let ticks = match &self.artifacts {
            Some(writer) if writer.options().export_ticks => Some(events.clone()),
            _ => None,
        };
        self.engine
            .load_data(events)
            .map_err(|e| engine_failure("load_data", e))?;
        self.emit(RunStatus::DataLoaded {
            events: event_count,
        });

        self.emit(RunStatus::EngineRunning);
        self.engine
            .run(spec, exec_algo)
            .map_err(|e| engine_failure("run", e))?;
        let records = self
            .engine
            .extract_results()
            .map_err(|e| engine_failure("extract_results", e))?;
        self.emit(RunStatus::EngineCompleted {
            orders: records.orders.len(),
            fills: records.fills.len(),
        });

        let timeline = Timeline::build(&records.orders, &records.fills);
        let run_metrics = MetricsCalculator::new(spec.venue().starting_balance).compute(
            &records.orders,
            &records.fills,
            &records.positions,
        );
        let run_id = RunId::generate(spec)?;

        let stats = self.cache.catalog().partition_stats(&key)?;
        let data = DataQuality {
            events_replayed: event_count as u64,
            source_rows: stats.as_ref().map(|s| s.source_rows).unwrap_or(0),
            dropped_rows: stats.as_ref().map(|s| s.dropped_rows).unwrap_or(0),
        };
        let summary = RunSummary::new(
            run_id.clone(),
            spec,
            data,
            run_metrics.clone(),
            created_at_ns,
            started.elapsed().as_millis() as u64,
        )?;
        self.emit(RunStatus::ResultsBuilt {
            run_id: run_id.to_string(),
        });

        let conversion = match coverage {
            CoverageOutcome::Converted(report) => Some(report),
            CoverageOutcome::Cached => None,
        };
        // The persisted log already ends in Completed; the message itself is
        // only sent once the artifacts are on disk.
        let completed = RunStatus::Completed {
            run_id: run_id.to_string(),
        };
        let mut status_log = self.status_log.clone();
        status_log.push(completed.clone());
        let result = RunResult {
            run_id,
            spec: spec.clone(),
            records,
            timeline,
            metrics: run_metrics,
            summary,
            conversion,
            status_log,
        };

        if let Some(writer) = &self.artifacts {
            writer.write(&result, ticks.as_deref())?;
        }
        self.emit(completed);

        metrics::increment_counter!("replay_runs_completed_total");
        info!(
            run_id = %result.run_id,
            instrument_id = %instrument_id,
            events = event_count,
            orders = result.records.orders.len(),
            fills = result.records.fills.len(),
            net_pnl = result.metrics.pnl.net,
            "Run completed"
        );
        Ok(result)
    }
}
