//! Tick Replay Pipeline
//!
//! Turns heterogeneous raw tick files into a cached normalized catalog, drives
//! an external simulation engine over a time window, and derives a timeline,
//! metrics and a run identifier from the engine's raw records.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────────┐   ┌──────────────────┐
//! │ RawStorage   │──▶│ PartitionDiscoverer │──▶│ SchemaNormalizer │
//! │ (local/obj)  │   │ (date partitions)   │   │ (layout → events)│
//! └──────────────┘   └─────────────────────┘   └────────┬─────────┘
//!                                                       │ on miss
//!                    ┌─────────────────────┐            ▼
//!                    │ CatalogCacheManager │──▶ SqliteCatalog
//!                    └──────────┬──────────┘
//!                               ▼
//! ┌──────────────┐   ┌─────────────────────┐   ┌──────────────────┐
//! │ ExecAlgorithm│──▶│   RunOrchestrator   │──▶│ SimulationEngine │
//! │ (twap/vwap/…)│   │  (status channel)   │   │ (injected)       │
//! └──────────────┘   └──────────┬──────────┘   └──────────────────┘
//!                               ▼
//!              Timeline + RunMetrics + RunId → ArtifactWriter
//! ```
//!
//! # Determinism
//!
//! - Normalized events are stably sorted by event time with dense sequence ids
//! - Catalog reads return sequence order
//! - Timeline ties resolve Order before Fill, then emission order
//! - Wall-clock time only appears in artifact metadata

pub mod artifact;
pub mod cache;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec_algo;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod partition;
pub mod run_id;
pub mod run_spec;
pub mod storage;
pub mod timeline;

pub use artifact::{ArtifactOptions, ArtifactWriter, DataQuality, ExtendedBundle, RunSummary};
pub use cache::{CatalogCacheManager, CoverageOutcome};
pub use catalog::{CatalogQuery, CatalogStore, PartitionKey, PartitionStats, SqliteCatalog};
pub use clock::{Nanos, TimeWindow, TimestampUnit, NANOS_PER_MILLI, NANOS_PER_SEC};
pub use config::{PipelineConfig, PipelineContext, RunConfigFile};
pub use engine::{EngineError, EngineOutput, InstrumentRegistry, SimulationEngine};
pub use error::{ReplayError, ReplayResult};
pub use events::{
    AccountSnapshot, DataKind, FillRecord, LiquiditySide, NormalizedEvent, OrderRecord,
    OrderStatus, OrderType, PositionSnapshot, Side, SnapshotStage,
};
pub use exec_algo::{
    available_exec_algorithms, make_exec_algorithm, ChildOrder, ExecAlgorithm, IcebergAlgorithm,
    IcebergState, SliceContext, TwapAlgorithm, VwapAlgorithm,
};
pub use metrics::{MetricsCalculator, PnlBreakdown, RejectedOrderAnalysis, RunMetrics};
pub use normalize::{
    ConversionReport, FileConversionStats, NormalizerConfig, RawSchema, SchemaNormalizer,
};
pub use orchestrator::{RunOrchestrator, RunResult, RunStatus};
pub use partition::{PartitionDiscoverer, PartitionFile};
pub use run_id::{RunId, RunIdParts};
pub use run_spec::{
    AccountType, ExecAlgoSpec, InstrumentSpec, ParamMap, RunSpec, RunSpecBuilder, StrategySpec,
    VenueConfig,
};
pub use storage::{LocalStorage, ObjectStorage, RawStorage, StorageLocation};
pub use timeline::{Timeline, TimelineEvent, TimelineKind, TimelinePage, TimelinePayload};
