//! Partition discovery over the date-partitioned raw tick tree.
//!
//! Layout: `<root>/<data_kind>/<YYYY-MM-DD>/<instrument_key>.csv`

use crate::replay::clock::{Nanos, TimeWindow};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::DataKind;
use crate::replay::storage::RawStorage;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const RAW_EXTENSION: &str = "csv";
const COMPRESSED_EXTENSION: &str = "csv.gz";

/// Filesystem-safe form of a canonical instrument id.
///
/// `BTC/USDT.BINANCE` → `BTC-USDT-BINANCE`
pub fn instrument_key(instrument_id: &str) -> String {
    instrument_id.trim().replace(['/', '.'], "-")
}

/// Storage key for one day of one instrument.
pub fn partition_key(data_kind: DataKind, date: NaiveDate, instrument_id: &str) -> String {
    format!(
        "{}/{}/{}.{}",
        data_kind.storage_name(),
        date.format("%Y-%m-%d"),
        instrument_key(instrument_id),
        RAW_EXTENSION
    )
}

/// A resolved raw file for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFile {
    pub date: NaiveDate,
    pub key: String,
}

/// Resolves (instrument, kind, window) to the raw files that cover it.
#[derive(Clone)]
pub struct PartitionDiscoverer {
    storage: Arc<dyn RawStorage>,
}

impl PartitionDiscoverer {
    pub fn new(storage: Arc<dyn RawStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn RawStorage> {
        &self.storage
    }

    /// Resolve files for `[start_ns, end_ns)`. Fails with a config error on an
    /// empty or inverted window.
    pub fn discover(
        &self,
        instrument_id: &str,
        data_kind: DataKind,
        start_ns: Nanos,
        end_ns: Nanos,
    ) -> ReplayResult<Vec<PartitionFile>> {
        let window = TimeWindow::new(start_ns, end_ns).ok_or_else(|| {
            ReplayError::config(format!(
                "invalid window: end ({}) must be after start ({})",
                end_ns, start_ns
            ))
        })?;
        self.discover_window(instrument_id, data_kind, &window)
    }

    /// Resolve files for a validated window, in ascending date order.
    pub fn discover_window(
        &self,
        instrument_id: &str,
        data_kind: DataKind,
        window: &TimeWindow,
    ) -> ReplayResult<Vec<PartitionFile>> {
        let first = window.first_day();
        let last = window.last_day();

        let mut files = Vec::new();
        for date in first.iter_days().take_while(|d| *d <= last) {
            let key = partition_key(data_kind, date, instrument_id);
            if self.storage.exists(&key)? {
                files.push(PartitionFile { date, key });
            } else if self.storage.exists(&format!("{}.gz", key))? {
                warn!(
                    instrument_id,
                    date = %date,
                    "Only a {} partition exists; compressed files are not decoded",
                    COMPRESSED_EXTENSION
                );
            }
        }

        debug!(
            instrument_id,
            data_kind = %data_kind,
            days = (last - first).num_days() + 1,
            found = files.len(),
            "Resolved raw partitions"
        );

        if files.is_empty() {
            return Err(ReplayError::DataAvailability {
                instrument_id: instrument_id.to_string(),
                data_kind,
                window: *window,
                detail: format!(
                    "no partition files under {} for days {}..={}",
                    self.storage.describe(),
                    first,
                    last
                ),
            });
        }
        Ok(files)
    }

    /// Read resolved files as `(key, bytes)` pairs in the given order.
    pub fn read_files(&self, files: &[PartitionFile]) -> ReplayResult<Vec<(String, Vec<u8>)>> {
        files
            .iter()
            .map(|f| Ok((f.key.clone(), self.storage.read(&f.key)?)))
            .collect()
    }

    /// Every `(date, instrument_key)` present for a data kind.
    pub fn list_available(&self, data_kind: DataKind) -> ReplayResult<Vec<(NaiveDate, String)>> {
        let suffix = format!(".{}", RAW_EXTENSION);
        let mut out = Vec::new();
        for key in self.storage.list(data_kind.storage_name())? {
            let parts: Vec<&str> = key.split('/').collect();
            if parts.len() != 3 {
                continue;
            }
            let Ok(date) = NaiveDate::parse_from_str(parts[1], "%Y-%m-%d") else {
                continue;
            };
            if let Some(name) = parts[2].strip_suffix(&suffix) {
                out.push((date, name.to_string()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::clock::parse_timestamp;
    use crate::replay::storage::ObjectStorage;

    fn discoverer_with(keys: &[&str]) -> PartitionDiscoverer {
        let storage = ObjectStorage::new("ticks", "");
        for key in keys {
            storage.put(key, b"timestamp,price,size,side\n".to_vec());
        }
        PartitionDiscoverer::new(Arc::new(storage))
    }

    #[test]
    fn test_instrument_key() {
        assert_eq!(instrument_key("BTCUSDT-PERP.BINANCE"), "BTCUSDT-PERP-BINANCE");
        assert_eq!(instrument_key("BTC/USDT.KRAKEN"), "BTC-USDT-KRAKEN");
        assert_eq!(
            partition_key(
                DataKind::Quotes,
                NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
                "ETH/USD.X"
            ),
            "quotes/2024-01-25/ETH-USD-X.csv"
        );
    }

    #[test]
    fn test_multi_day_window_in_order() {
        let d = discoverer_with(&[
            "trades/2024-01-27/BTCUSDT-BINANCE.csv",
            "trades/2024-01-25/BTCUSDT-BINANCE.csv",
            "trades/2024-01-26/BTCUSDT-BINANCE.csv",
            "trades/2024-01-26/ETHUSDT-BINANCE.csv",
        ]);
        let start = parse_timestamp("2024-01-25T12:00:00Z").unwrap();
        let end = parse_timestamp("2024-01-27T00:00:00Z").unwrap();
        let files = d
            .discover("BTCUSDT.BINANCE", DataKind::Trades, start, end)
            .unwrap();
        // Exclusive midnight end leaves the 27th out.
        let dates: Vec<String> = files.iter().map(|f| f.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-25", "2024-01-26"]);
    }

    #[test]
    fn test_gaps_are_skipped() {
        let d = discoverer_with(&["trades/2024-01-27/X-Y.csv"]);
        let start = parse_timestamp("2024-01-25T00:00:00Z").unwrap();
        let end = parse_timestamp("2024-01-28T00:00:00Z").unwrap();
        let files = d.discover("X.Y", DataKind::Trades, start, end).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "trades/2024-01-27/X-Y.csv");
    }

    #[test]
    fn test_no_files_is_data_availability_error() {
        let d = discoverer_with(&["quotes/2024-01-25/X-Y.csv"]);
        let start = parse_timestamp("2024-01-25T00:00:00Z").unwrap();
        let end = parse_timestamp("2024-01-25T01:00:00Z").unwrap();
        let err = d.discover("X.Y", DataKind::Trades, start, end).unwrap_err();
        match err {
            ReplayError::DataAvailability {
                instrument_id,
                data_kind,
                ..
            } => {
                assert_eq!(instrument_id, "X.Y");
                assert_eq!(data_kind, DataKind::Trades);
            }
            other => panic!("expected DataAvailabilityError, got {:?}", other),
        }
    }

    #[test]
    fn test_inverted_window_is_config_error() {
        let d = discoverer_with(&[]);
        let err = d.discover("X.Y", DataKind::Trades, 10, 10).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn test_list_available() {
        let d = discoverer_with(&[
            "trades/2024-01-25/A-X.csv",
            "trades/2024-01-26/B-X.csv",
            "trades/not-a-date/C-X.csv",
            "trades/2024-01-26/D-X.csv.gz",
        ]);
        let found = d.list_available(DataKind::Trades).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, "A-X");
    }
}
