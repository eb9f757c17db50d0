//! Replay pipeline error taxonomy.

use crate::replay::clock::TimeWindow;
use crate::replay::events::DataKind;

/// Errors surfaced by the replay pipeline.
///
/// `Config`, `DataAvailability` and `Schema` are fatal and always carry the
/// file / column / window that triggered them.
#[derive(Debug)]
pub enum ReplayError {
    /// Missing or invalid run specification. Raised before any I/O.
    Config(String),
    /// No source file covers the requested instrument/window.
    DataAvailability {
        instrument_id: String,
        data_kind: DataKind,
        window: TimeWindow,
        detail: String,
    },
    /// Unrecognized column layout or side token.
    Schema { file: String, detail: String },
    /// Row-parse failures exceeded the configured tolerance.
    Conversion {
        file: String,
        dropped_rows: u64,
        total_rows: u64,
        tolerance: f64,
    },
    /// Opaque failure surfaced by the external engine.
    EngineExecution(String),
    /// Result artifact write/read failure.
    Serialization { path: String, detail: String },
    /// Underlying storage (filesystem, SQLite, object store) failure.
    Storage(String),
}

impl ReplayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema(file: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Schema {
            file: file.into(),
            detail: detail.into(),
        }
    }

    pub fn serialization(path: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Serialization {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    /// Short machine-readable category name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::DataAvailability { .. } => "DataAvailabilityError",
            Self::Schema { .. } => "SchemaError",
            Self::Conversion { .. } => "ConversionError",
            Self::EngineExecution(_) => "EngineExecutionError",
            Self::Serialization { .. } => "SerializationError",
            Self::Storage(_) => "StorageError",
        }
    }
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Config error: {}", msg),
            Self::DataAvailability {
                instrument_id,
                data_kind,
                window,
                detail,
            } => write!(
                f,
                "No {} data for {} in window {}: {}",
                data_kind, instrument_id, window, detail
            ),
            Self::Schema { file, detail } => write!(f, "Schema error in {}: {}", file, detail),
            Self::Conversion {
                file,
                dropped_rows,
                total_rows,
                tolerance,
            } => write!(
                f,
                "Conversion of {} dropped {}/{} rows, exceeding tolerance of {:.2}%",
                file,
                dropped_rows,
                total_rows,
                tolerance * 100.0
            ),
            Self::EngineExecution(msg) => write!(f, "Engine execution failed: {}", msg),
            Self::Serialization { path, detail } => {
                write!(f, "Serialization error at {}: {}", path, detail)
            }
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<rusqlite::Error> for ReplayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(format!("SQLite: {}", e))
    }
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(format!("I/O: {}", e))
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            path: String::new(),
            detail: e.to_string(),
        }
    }
}

impl From<csv::Error> for ReplayError {
    fn from(e: csv::Error) -> Self {
        Self::Storage(format!("CSV: {}", e))
    }
}

impl From<toml::de::Error> for ReplayError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(format!("TOML: {}", e))
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let window = TimeWindow::new(0, 60_000_000_000).unwrap();
        let err = ReplayError::DataAvailability {
            instrument_id: "BTCUSDT.BINANCE".into(),
            data_kind: DataKind::Trades,
            window,
            detail: "no partition files".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("BTCUSDT.BINANCE"));
        assert!(msg.contains("trades"));
        assert_eq!(err.kind(), "DataAvailabilityError");

        let err = ReplayError::Conversion {
            file: "trades/2024-01-25/BTCUSDT-BINANCE.csv".into(),
            dropped_rows: 3,
            total_rows: 100,
            tolerance: 0.01,
        };
        assert!(err.to_string().contains("3/100"));
        assert!(err.to_string().contains("1.00%"));
    }
}
