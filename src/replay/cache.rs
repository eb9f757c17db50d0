//! Catalog cache manager.
//!
//! Lazily builds catalog partitions from raw files. A partition that has been
//! written, even with zero events, is treated as covering every window; there
//! is no interval tracking and no lock around check-then-convert, so two
//! concurrent first requests for the same key may both convert (the second
//! write replaces the first).

use crate::replay::catalog::{CatalogStore, PartitionKey};
use crate::replay::clock::TimeWindow;
use crate::replay::error::ReplayResult;
use crate::replay::events::DataKind;
use crate::replay::normalize::{ConversionReport, SchemaNormalizer};
use crate::replay::partition::PartitionDiscoverer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a coverage check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoverageOutcome {
    /// Partition already present; nothing converted.
    Cached,
    /// Raw files were normalized and written.
    Converted(ConversionReport),
}

impl CoverageOutcome {
    pub fn was_converted(&self) -> bool {
        matches!(self, Self::Converted(_))
    }

    pub fn report(&self) -> Option<&ConversionReport> {
        match self {
            Self::Converted(report) => Some(report),
            Self::Cached => None,
        }
    }
}

pub struct CatalogCacheManager {
    catalog: Arc<dyn CatalogStore>,
    discoverer: PartitionDiscoverer,
    normalizer: SchemaNormalizer,
    conversions: AtomicU64,
}

impl CatalogCacheManager {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        discoverer: PartitionDiscoverer,
        normalizer: SchemaNormalizer,
    ) -> Self {
        Self {
            catalog,
            discoverer,
            normalizer,
            conversions: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn discoverer(&self) -> &PartitionDiscoverer {
        &self.discoverer
    }

    /// Conversions performed by this manager since construction.
    pub fn conversion_count(&self) -> u64 {
        self.conversions.load(Ordering::Relaxed)
    }

    /// Make sure the catalog holds data for `(instrument, kind)`, converting
    /// the raw files that cover `window` if it does not.
    pub fn ensure_coverage(
        &self,
        instrument_id: &str,
        data_kind: DataKind,
        window: &TimeWindow,
    ) -> ReplayResult<CoverageOutcome> {
        let key = PartitionKey::new(instrument_id, data_kind);
        if self.catalog.has_data(&key)? {
            debug!(partition = %key, "Catalog hit");
            return Ok(CoverageOutcome::Cached);
        }

        let files = self
            .discoverer
            .discover_window(instrument_id, data_kind, window)?;
        let raw = self.discoverer.read_files(&files)?;
        let (events, report) = self.normalizer.normalize_files(&raw)?;
        self.catalog.write(&key, &events)?;
        self.catalog
            .record_conversion(&key, report.total_rows, report.dropped_rows)?;

        self.conversions.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("replay_catalog_conversions_total");
        info!(
            partition = %key,
            files = files.len(),
            events = events.len(),
            dropped_rows = report.dropped_rows,
            "Converted raw partition into catalog"
        );
        Ok(CoverageOutcome::Converted(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::catalog::SqliteCatalog;
    use crate::replay::clock::parse_timestamp;
    use crate::replay::error::ReplayError;
    use crate::replay::storage::ObjectStorage;

    fn manager_with(files: &[(&str, &str)]) -> CatalogCacheManager {
        let storage = ObjectStorage::new("ticks", "raw");
        for (key, body) in files {
            storage.put(key, body.as_bytes().to_vec());
        }
        CatalogCacheManager::new(
            Arc::new(SqliteCatalog::in_memory().unwrap()),
            PartitionDiscoverer::new(Arc::new(storage)),
            SchemaNormalizer::default(),
        )
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            parse_timestamp("2024-01-25T00:00:00Z").unwrap(),
            parse_timestamp("2024-01-26T00:00:00Z").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_second_call_is_cached() {
        let mgr = manager_with(&[(
            "trades/2024-01-25/A-X.csv",
            "timestamp,price,size,side\n1706140800000,1,1,buy\n1706140801000,1,1,sell\n",
        )]);

        let first = mgr.ensure_coverage("A.X", DataKind::Trades, &window()).unwrap();
        assert!(first.was_converted());
        assert_eq!(first.report().unwrap().events_emitted, 2);
        assert_eq!(mgr.conversion_count(), 1);
        let stats = mgr
            .catalog()
            .partition_stats(&PartitionKey::new("A.X", DataKind::Trades))
            .unwrap()
            .unwrap();
        assert_eq!(stats.source_rows, 2);

        let second = mgr.ensure_coverage("A.X", DataKind::Trades, &window()).unwrap();
        assert_eq!(second, CoverageOutcome::Cached);
        assert_eq!(mgr.conversion_count(), 1);
    }

    #[test]
    fn test_empty_conversion_is_not_repeated() {
        let mgr = manager_with(&[("trades/2024-01-25/A-X.csv", "timestamp,price,size,side\n")]);

        let first = mgr.ensure_coverage("A.X", DataKind::Trades, &window()).unwrap();
        assert_eq!(first.report().unwrap().events_emitted, 0);
        let second = mgr.ensure_coverage("A.X", DataKind::Trades, &window()).unwrap();
        assert_eq!(second, CoverageOutcome::Cached);
        assert_eq!(mgr.conversion_count(), 1);
    }

    #[test]
    fn test_missing_raw_data_propagates() {
        let mgr = manager_with(&[]);
        let err = mgr
            .ensure_coverage("A.X", DataKind::Trades, &window())
            .unwrap_err();
        assert!(matches!(err, ReplayError::DataAvailability { .. }));
        assert_eq!(mgr.conversion_count(), 0);
    }

    #[test]
    fn test_failed_conversion_writes_nothing() {
        let mgr = manager_with(&[(
            "trades/2024-01-25/A-X.csv",
            "timestamp,price,size,side\n1706140800000,1,1,sideways\n",
        )]);
        let err = mgr
            .ensure_coverage("A.X", DataKind::Trades, &window())
            .unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
        let key = PartitionKey::new("A.X", DataKind::Trades);
        assert!(!mgr.catalog().has_data(&key).unwrap());
    }
}
