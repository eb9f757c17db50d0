//! Result Artifacts
//!
//! Per-run output directory:
//!
//! ```text
//! <results_root>/<run_id>/
//!   summary.json   always
//!   bundle.json    spec, timeline, raw records, status log (optional)
//!   ticks.csv      replayed window as flat rows (optional)
//! ```
//!
//! A run directory appears only once all of its files are written.

use crate::replay::clock::{nanos_to_datetime, Nanos};
use crate::replay::engine::EngineOutput;
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::{DataKind, NormalizedEvent};
use crate::replay::metrics::RunMetrics;
use crate::replay::normalize::ConversionReport;
use crate::replay::orchestrator::{RunResult, RunStatus};
use crate::replay::run_id::RunId;
use crate::replay::run_spec::RunSpec;
use crate::replay::timeline::Timeline;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SUMMARY_FILE: &str = "summary.json";
pub const BUNDLE_FILE: &str = "bundle.json";
pub const TICKS_FILE: &str = "ticks.csv";

const STAGING_SUFFIX: &str = ".staging";

/// Fields that vary between otherwise identical runs.
const NONDETERMINISTIC_FIELDS: &[&str] = &["run_id", "created_at", "elapsed_ms"];

/// Source-data accounting for the replayed partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub events_replayed: u64,
    pub source_rows: u64,
    pub dropped_rows: u64,
}

/// Compact per-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    /// Wall clock, RFC3339.
    pub created_at: String,
    /// Wall clock.
    pub elapsed_ms: u64,
    pub instrument_id: String,
    pub venue: String,
    pub data_kind: DataKind,
    pub window_start: String,
    pub window_end: String,
    pub strategy: String,
    pub strategy_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_algo: Option<String>,
    pub config_hash: String,
    pub data: DataQuality,
    pub metrics: RunMetrics,
}

impl RunSummary {
    pub fn new(
        run_id: RunId,
        spec: &RunSpec,
        data: DataQuality,
        metrics: RunMetrics,
        created_at_ns: Nanos,
        elapsed_ms: u64,
    ) -> ReplayResult<Self> {
        Ok(Self {
            run_id,
            created_at: nanos_to_datetime(created_at_ns).to_rfc3339(),
            elapsed_ms,
            instrument_id: spec.instrument().instrument_id.clone(),
            venue: spec.venue().name.clone(),
            data_kind: spec.data_kind(),
            window_start: nanos_to_datetime(spec.window().start_ns).to_rfc3339(),
            window_end: nanos_to_datetime(spec.window().end_ns).to_rfc3339(),
            strategy: spec.strategy().name.clone(),
            strategy_mode: spec.strategy().mode.clone(),
            exec_algo: spec.exec_algo().map(|a| a.name.clone()),
            config_hash: spec.config_hash()?,
            data,
            metrics,
        })
    }

    /// JSON form without run id and wall-clock fields, for comparing runs.
    pub fn comparable(&self) -> ReplayResult<serde_json::Value> {
        let mut value =
            serde_json::to_value(self).map_err(|e| ReplayError::serialization(SUMMARY_FILE, e))?;
        if let Some(map) = value.as_object_mut() {
            for field in NONDETERMINISTIC_FIELDS {
                map.remove(*field);
            }
        }
        Ok(value)
    }
}

/// Everything produced by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedBundle {
    pub summary: RunSummary,
    pub spec: RunSpec,
    pub timeline: Timeline,
    pub records: EngineOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionReport>,
    pub status_log: Vec<RunStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactOptions {
    #[serde(default = "default_write_bundle")]
    pub write_bundle: bool,
    #[serde(default)]
    pub export_ticks: bool,
}

fn default_write_bundle() -> bool {
    true
}

impl Default for ArtifactOptions {
    fn default() -> Self {
        Self {
            write_bundle: true,
            export_ticks: false,
        }
    }
}

/// Flat tick row for CSV export.
#[derive(Debug, Serialize)]
struct TickRow<'a> {
    sequence_id: u64,
    event_time_ns: Nanos,
    init_time_ns: Nanos,
    price: f64,
    size: f64,
    side: &'static str,
    trade_id: Option<&'a str>,
}

/// Writes and reads run artifacts under a results root.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
    options: ArtifactOptions,
}

impl ArtifactWriter {
    pub fn new<P: AsRef<Path>>(root: P, options: ArtifactOptions) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &ArtifactOptions {
        &self.options
    }

    /// Directory for a run id. Rejects ids that are not well-formed.
    pub fn run_dir(&self, run_id: &str) -> ReplayResult<PathBuf> {
        if RunId::parse(run_id).is_none() {
            return Err(ReplayError::config(format!("malformed run id '{}'", run_id)));
        }
        Ok(self.root.join(run_id))
    }

    /// Persist a run. `ticks` is exported only when enabled in the options.
    ///
    /// Files go into a hidden staging directory that is renamed to the run
    /// directory once everything is written, so a failed write never leaves
    /// a listable run behind.
    pub fn write(&self, result: &RunResult, ticks: Option<&[NormalizedEvent]>) -> ReplayResult<PathBuf> {
        let dir = self.run_dir(result.run_id.as_str())?;
        let staging = self.root.join(format!(".{}{}", result.run_id, STAGING_SUFFIX));
        let io_err = |path: &Path, e: std::io::Error| {
            ReplayError::serialization(path.display().to_string(), e)
        };

        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| io_err(&staging, e))?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| io_err(&staging, e))?;

        let written = self
            .write_files(&staging, result, ticks)
            .and_then(|_| {
                if dir.is_dir() {
                    std::fs::remove_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
                }
                std::fs::rename(&staging, &dir).map_err(|e| io_err(&dir, e))
            });
        if let Err(e) = written {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(dir = %staging.display(), error = %cleanup, "Failed to remove staging dir");
            }
            return Err(e);
        }

        info!(run_id = %result.run_id, dir = %dir.display(), "Wrote run artifacts");
        Ok(dir)
    }

    fn write_files(
        &self,
        dir: &Path,
        result: &RunResult,
        ticks: Option<&[NormalizedEvent]>,
    ) -> ReplayResult<()> {
        write_json(&dir.join(SUMMARY_FILE), &result.summary)?;

        if self.options.write_bundle {
            let bundle = ExtendedBundle {
                summary: result.summary.clone(),
                spec: result.spec.clone(),
                timeline: result.timeline.clone(),
                records: result.records.clone(),
                conversion: result.conversion.clone(),
                status_log: result.status_log.clone(),
            };
            write_json(&dir.join(BUNDLE_FILE), &bundle)?;
        }

        if self.options.export_ticks {
            if let Some(ticks) = ticks {
                write_ticks(&dir.join(TICKS_FILE), ticks)?;
            }
        }
        Ok(())
    }

    pub fn load_summary(&self, run_id: &str) -> ReplayResult<RunSummary> {
        read_json(&self.run_dir(run_id)?.join(SUMMARY_FILE))
    }

    pub fn load_bundle(&self, run_id: &str) -> ReplayResult<ExtendedBundle> {
        read_json(&self.run_dir(run_id)?.join(BUNDLE_FILE))
    }

    /// Run ids with a summary on disk, sorted.
    pub fn list_runs(&self) -> ReplayResult<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if RunId::parse(&name).is_some() && entry.path().join(SUMMARY_FILE).is_file() {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> ReplayResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Wrote artifact");
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> ReplayResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
    atomic_write(path, &bytes)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> ReplayResult<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| ReplayError::serialization(path.display().to_string(), e))
}

fn write_ticks(path: &Path, ticks: &[NormalizedEvent]) -> ReplayResult<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for tick in ticks {
        writer
            .serialize(TickRow {
                sequence_id: tick.sequence_id,
                event_time_ns: tick.event_time_ns,
                init_time_ns: tick.init_time_ns,
                price: tick.price,
                size: tick.size,
                side: tick.side.as_str(),
                trade_id: tick.trade_id.as_deref(),
            })
            .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
    atomic_write(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::run_spec::{AccountType, RunSpecBuilder};
    use crate::replay::events::Side;
    use tempfile::TempDir;

    fn spec() -> RunSpec {
        RunSpecBuilder::new()
            .instrument("ETHUSDT.BINANCE")
            .precision(2, 4)
            .account(AccountType::Cash, "USDT", 5_000.0)
            .window(1_706_140_800_000_000_000, 1_706_140_860_000_000_000)
            .strategy("noop", "backtest")
            .build()
            .unwrap()
    }

    fn result(run_id: &str) -> RunResult {
        let spec = spec();
        let summary = RunSummary::new(
            RunId(run_id.to_string()),
            &spec,
            DataQuality::default(),
            RunMetrics::default(),
            1_706_200_000_000_000_000,
            12,
        )
        .unwrap();
        RunResult {
            run_id: RunId(run_id.to_string()),
            spec,
            records: EngineOutput::default(),
            timeline: Timeline::default(),
            metrics: RunMetrics::default(),
            conversion: None,
            status_log: vec![RunStatus::Completed {
                run_id: run_id.to_string(),
            }],
            summary,
        }
    }

    fn tick(seq: u64) -> NormalizedEvent {
        NormalizedEvent {
            event_time_ns: 1_706_140_800_000_000_000 + seq as i64,
            init_time_ns: 1_706_140_800_000_000_000 + seq as i64,
            price: 2_000.5,
            size: 0.25,
            side: Side::Sell,
            sequence_id: seq,
            trade_id: (seq == 0).then(|| "t0".to_string()),
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(
            dir.path(),
            ArtifactOptions {
                write_bundle: true,
                export_ticks: true,
            },
        );
        let id = "bina-ethusdt-20240125-000000-0123abcd-00f001";
        let run_dir = writer.write(&result(id), Some(&[tick(0), tick(1)])).unwrap();

        assert!(run_dir.join(SUMMARY_FILE).is_file());
        assert!(run_dir.join(BUNDLE_FILE).is_file());
        assert!(!run_dir.join("summary.tmp").exists());

        let summary = writer.load_summary(id).unwrap();
        assert_eq!(summary.run_id.as_str(), id);
        assert_eq!(summary.window_start, "2024-01-25T00:00:00+00:00");
        let bundle = writer.load_bundle(id).unwrap();
        assert_eq!(bundle.status_log.len(), 1);
        assert_eq!(bundle.summary, summary);

        let csv_text = std::fs::read_to_string(run_dir.join(TICKS_FILE)).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(
            lines.next(),
            Some("sequence_id,event_time_ns,init_time_ns,price,size,side,trade_id")
        );
        assert!(lines.next().unwrap().ends_with(",SELL,t0"));
        assert!(lines.next().unwrap().ends_with(",SELL,"));

        assert_eq!(writer.list_runs().unwrap(), vec![id.to_string()]);
    }

    #[test]
    fn test_summary_only_when_bundle_disabled() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(
            dir.path(),
            ArtifactOptions {
                write_bundle: false,
                export_ticks: false,
            },
        );
        let id = "bina-ethusdt-20240125-000000-0123abcd-00f002";
        let run_dir = writer.write(&result(id), Some(&[tick(0)])).unwrap();
        assert!(run_dir.join(SUMMARY_FILE).is_file());
        assert!(!run_dir.join(BUNDLE_FILE).exists());
        assert!(!run_dir.join(TICKS_FILE).exists());
        assert_eq!(writer.load_bundle(id).unwrap_err().kind(), "SerializationError");
    }

    #[test]
    fn test_comparable_strips_nondeterministic_fields() {
        let a = result("bina-ethusdt-20240125-000000-0123abcd-000001").summary;
        let mut b = result("bina-ethusdt-20240125-000000-0123abcd-000002").summary;
        b.created_at = "2030-01-01T00:00:00+00:00".into();
        b.elapsed_ms = 999;
        assert_ne!(a, b);
        assert_eq!(a.comparable().unwrap(), b.comparable().unwrap());
        assert!(a.comparable().unwrap().get("run_id").is_none());
    }

    #[test]
    fn test_failed_write_leaves_no_run_dir() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path(), ArtifactOptions::default());
        let id = "bina-ethusdt-20240125-000000-0123abcd-00f003";
        // A plain file where the run directory should go blocks the final rename.
        std::fs::write(dir.path().join(id), b"occupied").unwrap();

        let err = writer.write(&result(id), None).unwrap_err();
        assert_eq!(err.kind(), "SerializationError");
        assert!(writer.list_runs().unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec![id.to_string()]);
    }

    #[test]
    fn test_rewrite_replaces_run_dir() {
        let dir = TempDir::new().unwrap();
        let id = "bina-ethusdt-20240125-000000-0123abcd-00f004";
        let full = ArtifactWriter::new(
            dir.path(),
            ArtifactOptions {
                write_bundle: true,
                export_ticks: true,
            },
        );
        full.write(&result(id), Some(&[tick(0)])).unwrap();

        let slim = ArtifactWriter::new(
            dir.path(),
            ArtifactOptions {
                write_bundle: false,
                export_ticks: false,
            },
        );
        let run_dir = slim.write(&result(id), None).unwrap();
        assert!(run_dir.join(SUMMARY_FILE).is_file());
        assert!(!run_dir.join(BUNDLE_FILE).exists());
        assert!(!run_dir.join(TICKS_FILE).exists());
        assert_eq!(slim.list_runs().unwrap(), vec![id.to_string()]);
    }

    #[test]
    fn test_malformed_run_id_rejected() {
        let writer = ArtifactWriter::new("/tmp/unused", ArtifactOptions::default());
        let err = writer.load_summary("../../etc").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }
}
