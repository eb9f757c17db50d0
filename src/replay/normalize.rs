//! Data Normalization Layer
//!
//! Parsers for raw tick files and conversion to canonical events.
//!
//! Raw files come in one of a small closed set of layouts. The layout is
//! selected by matching the header row against known column signatures, then
//! every row is parsed by that layout's field mapping:
//!
//! ```text
//! header ──► RawSchema::detect ──► parse rows ──► infer ts unit ──► scale to ns
//!                                      │                                 │
//!                                      ▼                                 ▼
//!                               drop + count bad rows          stable sort by event time
//!                               (fail above tolerance)          re-sequence 0..n
//! ```

use crate::replay::clock::{Nanos, TimestampUnit};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::{NormalizedEvent, Side};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Default fraction of rows that may be dropped before a file fails.
pub const DEFAULT_DROP_TOLERANCE: f64 = 0.01;

// =============================================================================
// RAW SCHEMAS
// =============================================================================

/// Known raw tick layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawSchema {
    /// `timestamp,price,size,side[,trade_id]`
    TradeTape,
    /// `agg_trade_id,price,quantity,first_trade_id,last_trade_id,transact_time,is_buyer_maker`
    ExchangeAggTrades,
    /// `exchange,symbol,timestamp,local_timestamp,id,side,price,amount`
    VendorTrades,
    /// `timestamp,bid_price,bid_size,ask_price,ask_size`
    QuoteTape,
}

const TRADE_TAPE: &[&str] = &["timestamp", "price", "size", "side"];
const TRADE_TAPE_WITH_ID: &[&str] = &["timestamp", "price", "size", "side", "trade_id"];
const EXCHANGE_AGG_TRADES: &[&str] = &[
    "agg_trade_id",
    "price",
    "quantity",
    "first_trade_id",
    "last_trade_id",
    "transact_time",
    "is_buyer_maker",
];
const VENDOR_TRADES: &[&str] = &[
    "exchange",
    "symbol",
    "timestamp",
    "local_timestamp",
    "id",
    "side",
    "price",
    "amount",
];
const QUOTE_TAPE: &[&str] = &["timestamp", "bid_price", "bid_size", "ask_price", "ask_size"];

impl RawSchema {
    /// Column signatures, in detection order.
    fn signatures() -> &'static [(RawSchema, &'static [&'static str])] {
        &[
            (RawSchema::TradeTape, TRADE_TAPE),
            (RawSchema::TradeTape, TRADE_TAPE_WITH_ID),
            (RawSchema::ExchangeAggTrades, EXCHANGE_AGG_TRADES),
            (RawSchema::VendorTrades, VENDOR_TRADES),
            (RawSchema::QuoteTape, QUOTE_TAPE),
        ]
    }

    /// Match a header row against the known signatures.
    ///
    /// Matching is on the exact column set (case-insensitive, trimmed); column
    /// order does not matter.
    pub fn detect<S: AsRef<str>>(headers: &[S]) -> Option<RawSchema> {
        let mut seen: Vec<String> = headers
            .iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .collect();
        seen.sort();
        Self::signatures().iter().find_map(|(schema, cols)| {
            let mut expected: Vec<&str> = cols.to_vec();
            expected.sort_unstable();
            (expected.len() == seen.len() && expected.iter().zip(&seen).all(|(a, b)| *a == b))
                .then_some(*schema)
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TradeTape => "trade_tape",
            Self::ExchangeAggTrades => "exchange_agg_trades",
            Self::VendorTrades => "vendor_trades",
            Self::QuoteTape => "quote_tape",
        }
    }
}

/// Map a free-form side token through the fixed lookup table.
pub fn lookup_side(token: &str) -> Option<Side> {
    match token.trim().to_ascii_lowercase().as_str() {
        "buy" | "b" | "bid" | "long" | "1" => Some(Side::Buy),
        "sell" | "s" | "ask" | "offer" | "short" | "-1" => Some(Side::Sell),
        _ => None,
    }
}

/// Aggressor side from an `is_buyer_maker` flag: buyer resting means the
/// aggressor sold.
pub fn lookup_buyer_maker(token: &str) -> Option<Side> {
    match token.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(Side::Sell),
        "false" | "f" | "0" => Some(Side::Buy),
        _ => None,
    }
}

// =============================================================================
// RAW TICK RECORD (transient)
// =============================================================================

/// Timestamp cell before unit inference.
#[derive(Debug, Clone, Copy)]
enum RawTimestamp {
    Int(i64),
    Float(f64),
}

impl RawTimestamp {
    fn parse(cell: &str) -> Option<Self> {
        let cell = cell.trim();
        if let Ok(v) = cell.parse::<i64>() {
            return Some(Self::Int(v));
        }
        cell.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Self::Float)
    }

    fn magnitude(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Float(v) => *v as i64,
        }
    }

    fn to_nanos(&self, unit: TimestampUnit) -> Option<Nanos> {
        match self {
            Self::Int(v) => unit.to_nanos(*v),
            Self::Float(v) => unit.float_to_nanos(*v),
        }
    }
}

/// One parsed tick before scaling. Never persisted.
#[derive(Debug, Clone)]
struct RawTickRecord {
    timestamp: RawTimestamp,
    local_timestamp: Option<RawTimestamp>,
    price: f64,
    size: f64,
    side: Side,
    trade_id: Option<String>,
}

/// Why a row was dropped.
enum RowDrop {
    Unparsable,
    InvalidValue,
}

// =============================================================================
// REPORTS
// =============================================================================

/// Per-file conversion statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConversionStats {
    pub file: String,
    pub schema: Option<RawSchema>,
    pub timestamp_unit: Option<TimestampUnit>,
    pub total_rows: u64,
    pub dropped_rows: u64,
    pub unparsable_rows: u64,
    pub invalid_value_rows: u64,
    pub clamped_init_times: u64,
    pub events_emitted: u64,
}

impl FileConversionStats {
    pub fn drop_rate(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.dropped_rows as f64 / self.total_rows as f64
    }
}

/// Aggregate conversion report across all files of one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub files: Vec<FileConversionStats>,
    pub total_rows: u64,
    pub dropped_rows: u64,
    pub events_emitted: u64,
}

impl ConversionReport {
    fn push(&mut self, stats: FileConversionStats) {
        self.total_rows += stats.total_rows;
        self.dropped_rows += stats.dropped_rows;
        self.events_emitted += stats.events_emitted;
        self.files.push(stats);
    }

    pub fn drop_rate(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.dropped_rows as f64 / self.total_rows as f64
    }
}

// =============================================================================
// NORMALIZER
// =============================================================================

/// Configuration for the normalizer.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Maximum dropped/total row fraction before a file fails.
    pub drop_tolerance: f64,
    /// Field delimiter for raw files.
    pub delimiter: u8,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            drop_tolerance: DEFAULT_DROP_TOLERANCE,
            delimiter: b',',
        }
    }
}

/// Converts raw tick files into sorted canonical events.
#[derive(Debug, Clone, Default)]
pub struct SchemaNormalizer {
    config: NormalizerConfig,
}

impl SchemaNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Detect the layout of a raw file from its header row.
    pub fn detect_schema(&self, file: &str, bytes: &[u8]) -> ReplayResult<RawSchema> {
        let mut reader = self.reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| ReplayError::schema(file, format!("unreadable header row: {}", e)))?;
        let cols: Vec<&str> = headers.iter().collect();
        RawSchema::detect(&cols).ok_or_else(|| {
            ReplayError::schema(
                file,
                format!("unrecognized column layout [{}]", cols.join(",")),
            )
        })
    }

    /// Normalize a single file. Output is sorted by event time and sequenced
    /// from zero.
    pub fn normalize_file(
        &self,
        file: &str,
        bytes: &[u8],
    ) -> ReplayResult<(Vec<NormalizedEvent>, FileConversionStats)> {
        let (mut events, stats) = self.parse_file(file, bytes)?;
        sort_and_sequence(&mut events);
        Ok((events, stats))
    }

    /// Normalize several files of one partition, given in chronological file
    /// order. Files are parsed in parallel; the merged output is stably sorted
    /// by event time so cross-file ties keep file order.
    pub fn normalize_files(
        &self,
        files: &[(String, Vec<u8>)],
    ) -> ReplayResult<(Vec<NormalizedEvent>, ConversionReport)> {
        let parsed: Vec<ReplayResult<(Vec<NormalizedEvent>, FileConversionStats)>> = files
            .par_iter()
            .map(|(name, bytes)| self.parse_file(name, bytes))
            .collect();

        let mut events = Vec::new();
        let mut report = ConversionReport::default();
        for result in parsed {
            let (file_events, stats) = result?;
            events.extend(file_events);
            report.push(stats);
        }

        sort_and_sequence(&mut events);

        if report.dropped_rows > 0 {
            metrics::counter!("replay_rows_dropped_total", report.dropped_rows);
        }
        info!(
            files = report.files.len(),
            total_rows = report.total_rows,
            dropped_rows = report.dropped_rows,
            events = events.len(),
            "Normalized raw tick files"
        );
        Ok((events, report))
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .delimiter(self.config.delimiter)
            .from_reader(bytes)
    }

    /// Parse rows into unsorted events and enforce the drop tolerance.
    fn parse_file(
        &self,
        file: &str,
        bytes: &[u8],
    ) -> ReplayResult<(Vec<NormalizedEvent>, FileConversionStats)> {
        let schema = self.detect_schema(file, bytes)?;
        let mut reader = self.reader(bytes);
        let columns = column_index(reader.headers()?);

        let mut stats = FileConversionStats {
            file: file.to_string(),
            schema: Some(schema),
            ..Default::default()
        };
        let mut ticks: Vec<RawTickRecord> = Vec::new();

        for (row_idx, record) in reader.records().enumerate() {
            // Row numbers are 1-based and count the header line.
            let row_no = row_idx + 2;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    debug!(file, row = row_no, error = %e, "Unreadable row");
                    stats.total_rows += 1;
                    stats.dropped_rows += 1;
                    stats.unparsable_rows += 1;
                    continue;
                }
            };
            stats.total_rows += 1;

            match parse_row(schema, &columns, &record) {
                Ok(rows) => ticks.extend(rows),
                Err(RowError::Drop(RowDrop::Unparsable)) => {
                    stats.dropped_rows += 1;
                    stats.unparsable_rows += 1;
                }
                Err(RowError::Drop(RowDrop::InvalidValue)) => {
                    stats.dropped_rows += 1;
                    stats.invalid_value_rows += 1;
                }
                Err(RowError::UnknownSide { column, token }) => {
                    return Err(ReplayError::schema(
                        file,
                        format!(
                            "row {}: unrecognized side token '{}' in column '{}'",
                            row_no, token, column
                        ),
                    ));
                }
            }
        }

        self.check_tolerance(file, &stats)?;

        let unit = match ticks.first() {
            Some(first) => TimestampUnit::infer(first.timestamp.magnitude()),
            None => {
                debug!(file, "No data rows");
                return Ok((Vec::new(), stats));
            }
        };
        stats.timestamp_unit = Some(unit);

        let mut events = Vec::with_capacity(ticks.len());
        for tick in ticks {
            let Some(event_time_ns) = tick.timestamp.to_nanos(unit) else {
                stats.dropped_rows += 1;
                stats.unparsable_rows += 1;
                continue;
            };
            let local = tick.local_timestamp.and_then(|t| t.to_nanos(unit));
            let init_time_ns = match local {
                Some(t) if t >= event_time_ns => t,
                Some(_) => {
                    stats.clamped_init_times += 1;
                    event_time_ns
                }
                None => event_time_ns,
            };
            events.push(NormalizedEvent {
                event_time_ns,
                init_time_ns,
                price: tick.price,
                size: tick.size,
                side: tick.side,
                sequence_id: 0,
                trade_id: tick.trade_id,
            });
        }
        stats.events_emitted = events.len() as u64;
        // Rows that overflow during scaling count against the same budget.
        self.check_tolerance(file, &stats)?;

        debug!(
            file,
            schema = schema.name(),
            unit = %unit,
            rows = stats.total_rows,
            dropped = stats.dropped_rows,
            "Parsed raw file"
        );
        Ok((events, stats))
    }

    fn check_tolerance(&self, file: &str, stats: &FileConversionStats) -> ReplayResult<()> {
        if stats.drop_rate() <= self.config.drop_tolerance {
            return Ok(());
        }
        warn!(
            file,
            dropped = stats.dropped_rows,
            total = stats.total_rows,
            tolerance = self.config.drop_tolerance,
            "Dropped rows exceed tolerance"
        );
        Err(ReplayError::Conversion {
            file: file.to_string(),
            dropped_rows: stats.dropped_rows,
            total_rows: stats.total_rows,
            tolerance: self.config.drop_tolerance,
        })
    }
}

/// Stable sort by event time, then assign dense sequence ids.
fn sort_and_sequence(events: &mut [NormalizedEvent]) {
    events.sort_by_key(|e| e.event_time_ns);
    for (i, event) in events.iter_mut().enumerate() {
        event.sequence_id = i as u64;
    }
}

// --- Row parsing ---

enum RowError {
    Drop(RowDrop),
    UnknownSide { column: &'static str, token: String },
}

fn column_index(headers: &csv::StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_ascii_lowercase(), i))
        .collect()
}

fn cell<'r>(
    record: &'r csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Result<&'r str, RowError> {
    columns
        .get(name)
        .and_then(|&i| record.get(i))
        .ok_or(RowError::Drop(RowDrop::Unparsable))
}

fn number(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Result<f64, RowError> {
    let value: f64 = cell(record, columns, name)?
        .parse()
        .map_err(|_| RowError::Drop(RowDrop::Unparsable))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(RowError::Drop(RowDrop::InvalidValue));
    }
    Ok(value)
}

fn timestamp(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Result<RawTimestamp, RowError> {
    RawTimestamp::parse(cell(record, columns, name)?).ok_or(RowError::Drop(RowDrop::Unparsable))
}

fn side(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &'static str,
    lookup: fn(&str) -> Option<Side>,
) -> Result<Side, RowError> {
    let token = cell(record, columns, name)?;
    lookup(token).ok_or_else(|| RowError::UnknownSide {
        column: name,
        token: token.to_string(),
    })
}

fn optional_text(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Option<String> {
    columns
        .get(name)
        .and_then(|&i| record.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_row(
    schema: RawSchema,
    columns: &HashMap<String, usize>,
    record: &csv::StringRecord,
) -> Result<Vec<RawTickRecord>, RowError> {
    match schema {
        RawSchema::TradeTape => Ok(vec![RawTickRecord {
            timestamp: timestamp(record, columns, "timestamp")?,
            local_timestamp: None,
            price: number(record, columns, "price")?,
            size: number(record, columns, "size")?,
            side: side(record, columns, "side", lookup_side)?,
            trade_id: optional_text(record, columns, "trade_id"),
        }]),
        RawSchema::ExchangeAggTrades => Ok(vec![RawTickRecord {
            timestamp: timestamp(record, columns, "transact_time")?,
            local_timestamp: None,
            price: number(record, columns, "price")?,
            size: number(record, columns, "quantity")?,
            side: side(record, columns, "is_buyer_maker", lookup_buyer_maker)?,
            trade_id: optional_text(record, columns, "agg_trade_id"),
        }]),
        RawSchema::VendorTrades => Ok(vec![RawTickRecord {
            timestamp: timestamp(record, columns, "timestamp")?,
            local_timestamp: Some(timestamp(record, columns, "local_timestamp")?),
            price: number(record, columns, "price")?,
            size: number(record, columns, "amount")?,
            side: side(record, columns, "side", lookup_side)?,
            trade_id: optional_text(record, columns, "id"),
        }]),
        RawSchema::QuoteTape => {
            let ts = timestamp(record, columns, "timestamp")?;
            let bid = RawTickRecord {
                timestamp: ts,
                local_timestamp: None,
                price: number(record, columns, "bid_price")?,
                size: number(record, columns, "bid_size")?,
                side: Side::Buy,
                trade_id: None,
            };
            let ask = RawTickRecord {
                timestamp: ts,
                local_timestamp: None,
                price: number(record, columns, "ask_price")?,
                size: number(record, columns, "ask_size")?,
                side: Side::Sell,
                trade_id: None,
            };
            Ok(vec![bid, ask])
        }
    }
}
