//! Pipeline configuration
//!
//! `PipelineConfig` says where raw ticks, the catalog and run artifacts live.
//! `RunConfigFile` describes a single run and turns into a validated
//! [`RunSpec`]. Both are TOML.
//!
//! ```toml
//! catalog_path = "data/catalog.db"
//! results_root = "data/results"
//! drop_tolerance = 0.01
//!
//! [raw]
//! kind = "local"
//! root = "data/raw"
//!
//! [artifacts]
//! write_bundle = true
//! export_ticks = false
//! ```

use crate::replay::artifact::{ArtifactOptions, ArtifactWriter};
use crate::replay::cache::CatalogCacheManager;
use crate::replay::catalog::SqliteCatalog;
use crate::replay::clock::parse_timestamp;
use crate::replay::engine::SimulationEngine;
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::DataKind;
use crate::replay::normalize::{NormalizerConfig, SchemaNormalizer, DEFAULT_DROP_TOLERANCE};
use crate::replay::orchestrator::RunOrchestrator;
use crate::replay::partition::PartitionDiscoverer;
use crate::replay::run_spec::{AccountType, ParamMap, RunSpec, RunSpecBuilder};
use crate::replay::storage::{RawStorage, StorageLocation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CONFIG_PATH_ENV: &str = "REPLAY_CONFIG_PATH";
pub const RAW_ROOT_ENV: &str = "REPLAY_RAW_ROOT";
pub const CATALOG_PATH_ENV: &str = "REPLAY_CATALOG_PATH";
pub const RESULTS_ROOT_ENV: &str = "REPLAY_RESULTS_ROOT";

const DEFAULT_CONFIG_PATH: &str = "replay_config.toml";

// =============================================================================
// PIPELINE CONFIG
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// SQLite catalog file, or `:memory:`
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Run artifact directory
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,

    /// Maximum dropped/total row fraction per raw file
    #[serde(default = "default_drop_tolerance")]
    pub drop_tolerance: f64,

    /// Raw tick tree
    #[serde(default)]
    pub raw: StorageLocation,

    #[serde(default)]
    pub artifacts: ArtifactOptions,
}

fn default_catalog_path() -> String {
    "data/catalog.db".to_string()
}

fn default_results_root() -> PathBuf {
    PathBuf::from("data/results")
}

fn default_drop_tolerance() -> f64 {
    DEFAULT_DROP_TOLERANCE
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw: StorageLocation::default(),
            catalog_path: default_catalog_path(),
            results_root: default_results_root(),
            drop_tolerance: DEFAULT_DROP_TOLERANCE,
            artifacts: ArtifactOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `REPLAY_CONFIG_PATH` (or the default path), then apply
    /// environment overrides. Falls back to defaults when the file is absent.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            if Path::new(&path).exists() {
                warn!(path = %path, error = %e, "Invalid pipeline config, using defaults");
            } else {
                debug!("Using default pipeline config ({}): {}", path, e);
            }
            Self::default()
        });
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `REPLAY_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(RAW_ROOT_ENV) {
            self.raw = StorageLocation::Local {
                root: PathBuf::from(root),
            };
        }
        if let Some(path) = lookup(CATALOG_PATH_ENV) {
            self.catalog_path = path;
        }
        if let Some(root) = lookup(RESULTS_ROOT_ENV) {
            self.results_root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> ReplayResult<()> {
        if !(0.0..=1.0).contains(&self.drop_tolerance) {
            return Err(ReplayError::config(format!(
                "drop_tolerance must be within [0, 1], got {}",
                self.drop_tolerance
            )));
        }
        if self.catalog_path.trim().is_empty() {
            return Err(ReplayError::config("catalog_path must not be empty"));
        }
        Ok(())
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> ReplayResult<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ReplayError::serialization(path.display().to_string(), e))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Opened pipeline components, built once from a [`PipelineConfig`].
pub struct PipelineContext {
    config: PipelineConfig,
    storage: Arc<dyn RawStorage>,
    cache: Arc<CatalogCacheManager>,
    artifacts: ArtifactWriter,
}

impl PipelineContext {
    pub fn from_config(config: PipelineConfig) -> ReplayResult<Self> {
        config.validate()?;
        let storage = config.raw.open()?;
        let catalog = SqliteCatalog::open(&config.catalog_path)?;
        let normalizer = SchemaNormalizer::new(NormalizerConfig {
            drop_tolerance: config.drop_tolerance,
            ..NormalizerConfig::default()
        });
        let cache = CatalogCacheManager::new(
            Arc::new(catalog),
            PartitionDiscoverer::new(storage.clone()),
            normalizer,
        );
        let artifacts = ArtifactWriter::new(&config.results_root, config.artifacts.clone());

        info!(
            raw = %storage.describe(),
            catalog = %config.catalog_path,
            results = %config.results_root.display(),
            "Pipeline context ready"
        );
        Ok(Self {
            config,
            storage,
            cache: Arc::new(cache),
            artifacts,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn RawStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<CatalogCacheManager> {
        &self.cache
    }

    pub fn artifacts(&self) -> &ArtifactWriter {
        &self.artifacts
    }

    /// Orchestrator over this context's catalog, writing artifacts to the
    /// results root.
    pub fn orchestrator(&self, engine: Box<dyn SimulationEngine>) -> RunOrchestrator {
        RunOrchestrator::new(self.cache.clone(), engine).with_artifacts(self.artifacts.clone())
    }
}

// =============================================================================
// RUN CONFIG FILE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySection {
    pub name: String,
    #[serde(default = "default_strategy_mode")]
    pub mode: String,
    #[serde(default)]
    pub params: ParamMap,
}

fn default_strategy_mode() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecAlgoSection {
    pub name: String,
    #[serde(default)]
    pub params: ParamMap,
}

/// One run, as written by a user.
///
/// ```toml
/// instrument_id = "BTCUSDT-PERP.BINANCE"
/// price_precision = 2
/// size_precision = 3
/// account_type = "margin"
/// base_currency = "USDT"
/// starting_balance = 10000.0
/// start = "2024-01-25T00:00:00Z"
/// end = "2024-01-25T01:00:00Z"
///
/// [strategy]
/// name = "one_per_event"
///
/// [exec_algo]
/// name = "twap"
/// params = { interval_secs = 10 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigFile {
    pub instrument_id: String,
    pub price_precision: u8,
    pub size_precision: u8,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default = "default_account_type")]
    pub account_type: String,
    pub base_currency: String,
    pub starting_balance: f64,
    #[serde(default)]
    pub maker_fee: f64,
    #[serde(default)]
    pub taker_fee: f64,
    /// RFC3339
    pub start: String,
    /// RFC3339, exclusive
    pub end: String,
    #[serde(default = "default_data_kind")]
    pub data_kind: String,
    pub strategy: StrategySection,
    #[serde(default)]
    pub exec_algo: Option<ExecAlgoSection>,
}

fn default_account_type() -> String {
    "cash".to_string()
}

fn default_data_kind() -> String {
    "trades".to_string()
}

impl RunConfigFile {
    pub fn load(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::config(format!("cannot read run config {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn into_builder(self) -> ReplayResult<RunSpecBuilder> {
        let account_type = AccountType::parse(&self.account_type).ok_or_else(|| {
            ReplayError::config(format!("unknown account_type '{}'", self.account_type))
        })?;
        let data_kind = DataKind::from_storage_name(&self.data_kind)
            .ok_or_else(|| ReplayError::config(format!("unknown data_kind '{}'", self.data_kind)))?;
        let start = parse_timestamp(&self.start)
            .ok_or_else(|| ReplayError::config(format!("invalid start '{}'", self.start)))?;
        let end = parse_timestamp(&self.end)
            .ok_or_else(|| ReplayError::config(format!("invalid end '{}'", self.end)))?;

        let mut builder = RunSpecBuilder::new()
            .instrument(self.instrument_id)
            .precision(self.price_precision, self.size_precision)
            .account(account_type, self.base_currency, self.starting_balance)
            .fees(self.maker_fee, self.taker_fee)
            .window(start, end)
            .data_kind(data_kind)
            .strategy(self.strategy.name, self.strategy.mode);
        if let Some(venue) = self.venue {
            builder = builder.venue_name(venue);
        }
        for (key, value) in self.strategy.params {
            builder = builder.strategy_param(key, value);
        }
        if let Some(algo) = self.exec_algo {
            builder = builder.exec_algo(algo.name, algo.params);
        }
        Ok(builder)
    }

    pub fn to_run_spec(&self) -> ReplayResult<RunSpec> {
        self.clone().into_builder()?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const RUN_TOML: &str = r#"
instrument_id = "BTCUSDT-PERP.BINANCE"
price_precision = 2
size_precision = 3
account_type = "margin"
base_currency = "USDT"
starting_balance = 10000.0
taker_fee = 0.0004
start = "2024-01-25T00:00:00Z"
end = "2024-01-25T01:00:00Z"

[strategy]
name = "one_per_event"
params = { size = 0.01 }

[exec_algo]
name = "twap"
params = { interval_secs = 10 }
"#;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.catalog_path, "data/catalog.db");
        assert_eq!(config.drop_tolerance, DEFAULT_DROP_TOLERANCE);
        assert!(config.artifacts.write_bundle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay_config.toml");
        let mut config = PipelineConfig::default();
        config.drop_tolerance = 0.05;
        config.raw = StorageLocation::Object {
            bucket: "ticks".into(),
            prefix: "raw".into(),
            mirror_from: None,
        };
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.drop_tolerance, 0.05);
        assert_eq!(loaded.raw, config.raw);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: PipelineConfig = toml::from_str("catalog_path = \":memory:\"").unwrap();
        assert_eq!(config.catalog_path, ":memory:");
        assert_eq!(config.results_root, PathBuf::from("data/results"));
        assert_eq!(config.raw, StorageLocation::default());
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "drop_tolerance = 1.5").unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap_err().kind(), "ConfigError");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (RAW_ROOT_ENV, "/mnt/ticks"),
            (CATALOG_PATH_ENV, ":memory:"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(
            config.raw,
            StorageLocation::Local {
                root: PathBuf::from("/mnt/ticks")
            }
        );
        assert_eq!(config.catalog_path, ":memory:");
        assert_eq!(config.results_root, PathBuf::from("data/results"));
    }

    #[test]
    fn test_context_from_config() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            raw: StorageLocation::Local {
                root: dir.path().join("raw"),
            },
            catalog_path: dir.path().join("catalog.db").display().to_string(),
            results_root: dir.path().join("results"),
            ..PipelineConfig::default()
        };
        let ctx = PipelineContext::from_config(config).unwrap();
        assert!(ctx.storage().describe().starts_with("file://"));
        assert!(ctx.cache().catalog().list_partitions().unwrap().is_empty());
        assert!(dir.path().join("catalog.db").exists());
        assert!(ctx.artifacts().list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_run_config_to_spec() {
        let file: RunConfigFile = toml::from_str(RUN_TOML).unwrap();
        let spec = file.to_run_spec().unwrap();

        assert_eq!(spec.instrument().symbol, "BTCUSDT-PERP");
        assert_eq!(spec.venue().name, "BINANCE");
        assert_eq!(spec.venue().account_type, AccountType::Margin);
        assert_eq!(spec.data_kind(), DataKind::Trades);
        assert_eq!(spec.window().duration_ns(), 3_600_000_000_000);
        assert_eq!(spec.strategy().mode, "default");
        assert_eq!(spec.strategy().params["size"], serde_json::json!(0.01));
        let algo = spec.exec_algo().unwrap();
        assert_eq!(algo.name, "twap");
        assert_eq!(algo.params["interval_secs"], serde_json::json!(10));
    }

    #[test]
    fn test_run_config_rejects_bad_fields() {
        let mut file: RunConfigFile = toml::from_str(RUN_TOML).unwrap();
        file.account_type = "portfolio".into();
        assert_eq!(file.to_run_spec().unwrap_err().kind(), "ConfigError");

        let mut file: RunConfigFile = toml::from_str(RUN_TOML).unwrap();
        file.end = "yesterday".into();
        assert_eq!(file.to_run_spec().unwrap_err().kind(), "ConfigError");

        let mut file: RunConfigFile = toml::from_str(RUN_TOML).unwrap();
        file.end = file.start.clone();
        assert_eq!(file.to_run_spec().unwrap_err().kind(), "ConfigError");
    }
}
