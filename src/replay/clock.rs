//! Replay Time
//!
//! Nanosecond timestamps, epoch-unit inference for raw tick files, and the
//! half-open `[start, end)` window used by every time-bounded query.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
/// i64 gives us ~292 years of range, sufficient for any replay.
pub type Nanos = i64;

/// Conversion constants
pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SEC;

// Magnitude boundaries for present-day epoch values.
// seconds ~1.7e9, millis ~1.7e12, micros ~1.7e15, nanos ~1.7e18
const SECONDS_CEILING: i64 = 100_000_000_000;
const MILLIS_CEILING: i64 = 100_000_000_000_000;
const MICROS_CEILING: i64 = 100_000_000_000_000_000;

/// Epoch unit of a raw timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimestampUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl TimestampUnit {
    /// Infer the unit from the magnitude of a single epoch value.
    pub fn infer(raw: i64) -> Self {
        let magnitude = raw.unsigned_abs();
        if magnitude < SECONDS_CEILING as u64 {
            Self::Seconds
        } else if magnitude < MILLIS_CEILING as u64 {
            Self::Millis
        } else if magnitude < MICROS_CEILING as u64 {
            Self::Micros
        } else {
            Self::Nanos
        }
    }

    /// Multiplier that scales a value in this unit to nanoseconds.
    #[inline]
    pub fn nanos_multiplier(&self) -> i64 {
        match self {
            Self::Seconds => NANOS_PER_SEC,
            Self::Millis => NANOS_PER_MILLI,
            Self::Micros => NANOS_PER_MICRO,
            Self::Nanos => 1,
        }
    }

    /// Scale a raw value to nanoseconds. `None` on overflow.
    #[inline]
    pub fn to_nanos(&self, raw: i64) -> Option<Nanos> {
        raw.checked_mul(self.nanos_multiplier())
    }

    /// Scale a fractional raw value (e.g. `1706140800.125` seconds) to nanoseconds.
    pub fn float_to_nanos(&self, raw: f64) -> Option<Nanos> {
        if !raw.is_finite() {
            return None;
        }
        let scaled = raw * self.nanos_multiplier() as f64;
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(scaled.round() as i64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Millis => "ms",
            Self::Micros => "us",
            Self::Nanos => "ns",
        }
    }
}

impl fmt::Display for TimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time window `[start_ns, end_ns)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ns: Nanos,
    pub end_ns: Nanos,
}

impl TimeWindow {
    /// Create a window. Returns `None` unless `end_ns > start_ns`.
    pub fn new(start_ns: Nanos, end_ns: Nanos) -> Option<Self> {
        if end_ns > start_ns {
            Some(Self { start_ns, end_ns })
        } else {
            None
        }
    }

    pub fn from_datetimes(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Option<Self> {
        Self::new(datetime_to_nanos(start), datetime_to_nanos(end))
    }

    #[inline]
    pub fn contains(&self, t: Nanos) -> bool {
        t >= self.start_ns && t < self.end_ns
    }

    #[inline]
    pub fn duration_ns(&self) -> Nanos {
        self.end_ns - self.start_ns
    }

    /// First UTC calendar day touched by the window.
    pub fn first_day(&self) -> NaiveDate {
        nanos_to_datetime(self.start_ns).date_naive()
    }

    /// Last UTC calendar day touched by the window (end is exclusive).
    pub fn last_day(&self) -> NaiveDate {
        nanos_to_datetime(self.end_ns - 1).date_naive()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            nanos_to_datetime(self.start_ns).to_rfc3339(),
            nanos_to_datetime(self.end_ns).to_rfc3339()
        )
    }
}

/// Helper to convert chrono DateTime to Nanos.
#[inline]
pub fn datetime_to_nanos(dt: &DateTime<Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Helper to convert Nanos to chrono DateTime.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> DateTime<Utc> {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    Utc.timestamp_opt(secs, nsecs)
        .single()
        .unwrap_or_default()
}

/// Helper to parse ISO8601/RFC3339 string to Nanos.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&Utc)))
}

/// Compact `YYYYMMDD` / `HHMMSS` pair for labels.
pub fn compact_date_time(nanos: Nanos) -> (String, String) {
    let dt = nanos_to_datetime(nanos);
    (dt.format("%Y%m%d").to_string(), dt.format("%H%M%S").to_string())
}

/// Wall-clock now in nanoseconds. Only for artifact metadata, never for replay.
pub fn wall_clock_ns() -> Nanos {
    datetime_to_nanos(&Utc::now())
}
