//! Catalog Store
//!
//! Normalized events persisted per partition, keyed by
//! `(instrument_id, data_kind)`, queryable by half-open time window.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE catalog_events (
//!     instrument_id TEXT NOT NULL,
//!     data_kind TEXT NOT NULL,
//!     sequence_id INTEGER NOT NULL,
//!     event_time_ns INTEGER NOT NULL,
//!     init_time_ns INTEGER NOT NULL,
//!     price REAL NOT NULL,
//!     size REAL NOT NULL,
//!     side TEXT NOT NULL,
//!     trade_id TEXT,
//!     PRIMARY KEY (instrument_id, data_kind, sequence_id)
//! ) WITHOUT ROWID;
//! ```

use crate::replay::clock::{wall_clock_ns, Nanos, TimeWindow};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::events::{DataKind, NormalizedEvent, Side};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: u32 = 1;

/// Path value that selects an in-memory catalog.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Identifies one catalog partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub instrument_id: String,
    pub data_kind: DataKind,
}

impl PartitionKey {
    pub fn new(instrument_id: impl Into<String>, data_kind: DataKind) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            data_kind,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument_id, self.data_kind)
    }
}

/// Time-bounded read of one partition: `[start_ns, end_ns)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub key: PartitionKey,
    pub start_ns: Nanos,
    pub end_ns: Nanos,
}

impl CatalogQuery {
    pub fn new(key: PartitionKey, window: &TimeWindow) -> Self {
        Self {
            key,
            start_ns: window.start_ns,
            end_ns: window.end_ns,
        }
    }
}

/// Summary of what a partition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub key: PartitionKey,
    pub event_count: u64,
    pub first_event_ns: Option<Nanos>,
    pub last_event_ns: Option<Nanos>,
    /// Raw rows read when the partition was converted.
    pub source_rows: u64,
    /// Raw rows dropped during conversion.
    pub dropped_rows: u64,
    pub written_at_ns: Nanos,
}

/// Persistent store of normalized events.
pub trait CatalogStore: Send + Sync {
    /// Whether the partition has been written, even if it holds no events.
    fn has_data(&self, key: &PartitionKey) -> ReplayResult<bool>;

    /// Replace the partition's contents. Returns events written.
    fn write(&self, key: &PartitionKey, events: &[NormalizedEvent]) -> ReplayResult<usize>;

    /// Events with `start_ns <= event_time_ns < end_ns`, in replay order.
    fn query(&self, query: &CatalogQuery) -> ReplayResult<Vec<NormalizedEvent>>;

    /// Attach raw row accounting from the conversion that produced the partition.
    fn record_conversion(
        &self,
        key: &PartitionKey,
        source_rows: u64,
        dropped_rows: u64,
    ) -> ReplayResult<()>;

    fn partition_stats(&self, key: &PartitionKey) -> ReplayResult<Option<PartitionStats>>;

    fn list_partitions(&self) -> ReplayResult<Vec<PartitionStats>>;
}

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open (or create) a catalog at `path`. `:memory:` yields an in-memory
    /// catalog.
    pub fn open<P: AsRef<Path>>(path: P) -> ReplayResult<Self> {
        let path = path.as_ref();
        if path.as_os_str() == IN_MEMORY_PATH {
            return Self::in_memory();
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.initialize_schema()?;
        info!(path = %path.display(), "Opened catalog");
        Ok(catalog)
    }

    /// Create an in-memory catalog (for testing).
    pub fn in_memory() -> ReplayResult<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.initialize_schema()?;
        Ok(catalog)
    }

    fn initialize_schema(&self) -> ReplayResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS catalog_events (
                        instrument_id TEXT NOT NULL,
                        data_kind TEXT NOT NULL,
                        sequence_id INTEGER NOT NULL,
                        event_time_ns INTEGER NOT NULL,
                        init_time_ns INTEGER NOT NULL,
                        price REAL NOT NULL,
                        size REAL NOT NULL,
                        side TEXT NOT NULL,
                        trade_id TEXT,
                        PRIMARY KEY (instrument_id, data_kind, sequence_id)
                    ) WITHOUT ROWID;

                    CREATE INDEX IF NOT EXISTS idx_catalog_events_time
                        ON catalog_events(instrument_id, data_kind, event_time_ns);

                    CREATE TABLE IF NOT EXISTS catalog_partitions (
                        instrument_id TEXT NOT NULL,
                        data_kind TEXT NOT NULL,
                        event_count INTEGER NOT NULL,
                        first_event_ns INTEGER,
                        last_event_ns INTEGER,
                        source_rows INTEGER NOT NULL DEFAULT 0,
                        dropped_rows INTEGER NOT NULL DEFAULT 0,
                        written_at_ns INTEGER NOT NULL,
                        PRIMARY KEY (instrument_id, data_kind)
                    );
                "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created catalog schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Catalog schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Catalog schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }
}

fn side_from_db(value: &str) -> ReplayResult<Side> {
    match value {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ReplayError::Storage(format!(
            "catalog row has unknown side '{}'",
            other
        ))),
    }
}

fn kind_from_db(value: &str) -> ReplayResult<DataKind> {
    DataKind::from_storage_name(value).ok_or_else(|| {
        ReplayError::Storage(format!("catalog row has unknown data kind '{}'", value))
    })
}

impl CatalogStore for SqliteCatalog {
    fn has_data(&self, key: &PartitionKey) -> ReplayResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM catalog_partitions WHERE instrument_id = ?1 AND data_kind = ?2",
                params![key.instrument_id, key.data_kind.storage_name()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn write(&self, key: &PartitionKey, events: &[NormalizedEvent]) -> ReplayResult<usize> {
        let kind = key.data_kind.storage_name();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM catalog_events WHERE instrument_id = ?1 AND data_kind = ?2",
            params![key.instrument_id, kind],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO catalog_events (
                    instrument_id, data_kind, sequence_id, event_time_ns, init_time_ns,
                    price, size, side, trade_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for event in events {
                stmt.execute(params![
                    key.instrument_id,
                    kind,
                    event.sequence_id as i64,
                    event.event_time_ns,
                    event.init_time_ns,
                    event.price,
                    event.size,
                    event.side.as_str(),
                    event.trade_id,
                ])?;
            }
        }

        tx.execute(
            r#"
            INSERT OR REPLACE INTO catalog_partitions (
                instrument_id, data_kind, event_count, first_event_ns, last_event_ns, written_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                key.instrument_id,
                kind,
                events.len() as i64,
                events.iter().map(|e| e.event_time_ns).min(),
                events.iter().map(|e| e.event_time_ns).max(),
                wall_clock_ns(),
            ],
        )?;
        tx.commit()?;

        info!(partition = %key, events = events.len(), "Wrote catalog partition");
        Ok(events.len())
    }

    fn query(&self, query: &CatalogQuery) -> ReplayResult<Vec<NormalizedEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT sequence_id, event_time_ns, init_time_ns, price, size, side, trade_id
            FROM catalog_events
            WHERE instrument_id = ?1 AND data_kind = ?2
              AND event_time_ns >= ?3 AND event_time_ns < ?4
            ORDER BY sequence_id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![
                    query.key.instrument_id,
                    query.key.data_kind.storage_name(),
                    query.start_ns,
                    query.end_ns
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let events = rows
            .into_iter()
            .map(|(seq, event_time_ns, init_time_ns, price, size, side, trade_id)| {
                Ok(NormalizedEvent {
                    event_time_ns,
                    init_time_ns,
                    price,
                    size,
                    side: side_from_db(&side)?,
                    sequence_id: seq as u64,
                    trade_id,
                })
            })
            .collect::<ReplayResult<Vec<_>>>()?;

        debug!(
            partition = %query.key,
            start_ns = query.start_ns,
            end_ns = query.end_ns,
            events = events.len(),
            "Catalog query"
        );
        Ok(events)
    }

    fn record_conversion(
        &self,
        key: &PartitionKey,
        source_rows: u64,
        dropped_rows: u64,
    ) -> ReplayResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE catalog_partitions SET source_rows = ?3, dropped_rows = ?4
            WHERE instrument_id = ?1 AND data_kind = ?2
            "#,
            params![
                key.instrument_id,
                key.data_kind.storage_name(),
                source_rows as i64,
                dropped_rows as i64
            ],
        )?;
        if updated == 0 {
            return Err(ReplayError::Storage(format!(
                "cannot record conversion for unknown partition {}",
                key
            )));
        }
        Ok(())
    }

    fn partition_stats(&self, key: &PartitionKey) -> ReplayResult<Option<PartitionStats>> {
        let conn = self.conn.lock();
        let stats = conn
            .query_row(
                r#"
                SELECT event_count, first_event_ns, last_event_ns, source_rows, dropped_rows,
                       written_at_ns
                FROM catalog_partitions
                WHERE instrument_id = ?1 AND data_kind = ?2
                "#,
                params![key.instrument_id, key.data_kind.storage_name()],
                |row| {
                    Ok(PartitionStats {
                        key: key.clone(),
                        event_count: row.get::<_, i64>(0)? as u64,
                        first_event_ns: row.get(1)?,
                        last_event_ns: row.get(2)?,
                        source_rows: row.get::<_, i64>(3)? as u64,
                        dropped_rows: row.get::<_, i64>(4)? as u64,
                        written_at_ns: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    fn list_partitions(&self) -> ReplayResult<Vec<PartitionStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT instrument_id, data_kind, event_count, first_event_ns, last_event_ns,
                   source_rows, dropped_rows, written_at_ns
            FROM catalog_partitions
            ORDER BY instrument_id ASC, data_kind ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(instrument_id, kind, count, first, last, source, dropped, written)| {
                Ok(PartitionStats {
                    key: PartitionKey::new(instrument_id, kind_from_db(&kind)?),
                    event_count: count as u64,
                    first_event_ns: first,
                    last_event_ns: last,
                    source_rows: source as u64,
                    dropped_rows: dropped as u64,
                    written_at_ns: written,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_events(times: &[Nanos]) -> Vec<NormalizedEvent> {
        times
            .iter()
            .enumerate()
            .map(|(i, &t)| NormalizedEvent {
                event_time_ns: t,
                init_time_ns: t,
                price: 100.0 + i as f64,
                size: 1.0,
                side: if i % 2 == 0 { Side::Buy } else { Side::Sell },
                sequence_id: i as u64,
                trade_id: (i == 0).then(|| "first".to_string()),
            })
            .collect()
    }

    #[test]
    fn test_write_then_query_window() {
        let catalog = SqliteCatalog::in_memory().unwrap();
        let key = PartitionKey::new("BTCUSDT.BINANCE", DataKind::Trades);
        assert!(!catalog.has_data(&key).unwrap());

        let events = make_events(&[10, 20, 30, 40]);
        assert_eq!(catalog.write(&key, &events).unwrap(), 4);
        assert!(catalog.has_data(&key).unwrap());

        let window = TimeWindow::new(20, 40).unwrap();
        let got = catalog.query(&CatalogQuery::new(key.clone(), &window)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].event_time_ns, 20);
        assert_eq!(got[1].event_time_ns, 30);
        assert_eq!(got[1].side, Side::Buy);

        let all = catalog
            .query(&CatalogQuery::new(key, &TimeWindow::new(0, 100).unwrap()))
            .unwrap();
        assert_eq!(all, events);
    }

    #[test]
    fn test_rewrite_replaces_partition() {
        let catalog = SqliteCatalog::in_memory().unwrap();
        let key = PartitionKey::new("ETH.X", DataKind::Quotes);
        catalog.write(&key, &make_events(&[1, 2, 3])).unwrap();
        catalog.write(&key, &make_events(&[5, 6])).unwrap();

        catalog.record_conversion(&key, 3, 1).unwrap();
        let stats = catalog.partition_stats(&key).unwrap().unwrap();
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.source_rows, 3);
        assert_eq!(stats.dropped_rows, 1);
        assert_eq!(stats.first_event_ns, Some(5));
        assert_eq!(stats.last_event_ns, Some(6));
    }

    #[test]
    fn test_partitions_are_isolated() {
        let catalog = SqliteCatalog::in_memory().unwrap();
        let trades = PartitionKey::new("A.X", DataKind::Trades);
        let quotes = PartitionKey::new("A.X", DataKind::Quotes);
        catalog.write(&trades, &make_events(&[1])).unwrap();

        assert!(!catalog.has_data(&quotes).unwrap());
        assert!(catalog.partition_stats(&quotes).unwrap().is_none());
        assert!(catalog.record_conversion(&quotes, 1, 0).is_err());
        let listed = catalog.list_partitions().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, trades);
    }

    #[test]
    fn test_empty_write_still_marks_partition() {
        let catalog = SqliteCatalog::in_memory().unwrap();
        let key = PartitionKey::new("A.X", DataKind::Trades);
        assert_eq!(catalog.write(&key, &[]).unwrap(), 0);
        assert!(catalog.has_data(&key).unwrap());

        let stats = catalog.partition_stats(&key).unwrap().unwrap();
        assert_eq!(stats.event_count, 0);
        assert_eq!(stats.first_event_ns, None);
    }

    #[test]
    fn test_file_catalog_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog").join("replay.db");
        let key = PartitionKey::new("A.X", DataKind::Trades);
        {
            let catalog = SqliteCatalog::open(&path).unwrap();
            catalog.write(&key, &make_events(&[1, 2])).unwrap();
        }
        let reopened = SqliteCatalog::open(&path).unwrap();
        assert!(reopened.has_data(&key).unwrap());
    }
}
