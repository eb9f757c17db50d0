//! Run Identifier
//!
//! ```text
//! bina-btcusdtp-20240125-000000-3f9a1c2e-a4c017
//! │    │        │        │      │        └─ disambiguator (random per-process base + run sequence)
//! │    │        │        │      └─ first 8 hex of SHA-256(canonical RunSpec JSON)
//! │    │        │        └─ window start time (UTC)
//! │    │        └─ window start date (UTC)
//! │    └─ instrument tag (<= 8 lowercase alphanumerics of the symbol)
//! └─ venue tag (<= 4 lowercase alphanumerics)
//! ```
//!
//! The first five components depend only on the RunSpec.

use crate::replay::clock::compact_date_time;
use crate::replay::error::ReplayResult;
use crate::replay::run_spec::RunSpec;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

const VENUE_TAG_LEN: usize = 4;
const INSTRUMENT_TAG_LEN: usize = 8;
const HASH_LEN: usize = 8;
const DISAMBIGUATOR_LEN: usize = 6;
const DISAMBIGUATOR_MASK: u32 = (1 << (4 * DISAMBIGUATOR_LEN as u32)) - 1;

static RUN_SEQUENCE: AtomicU32 = AtomicU32::new(0);
static PROCESS_BASE: OnceLock<u32> = OnceLock::new();

/// Unique identifier for a replay run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

/// Components of a parsed run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdParts {
    pub venue: String,
    pub instrument: String,
    pub date: String,
    pub time: String,
    pub config_hash: String,
    pub disambiguator: String,
}

impl RunIdParts {
    /// Everything except the disambiguator.
    pub fn stable_prefix(&self) -> String {
        [
            self.venue.as_str(),
            self.instrument.as_str(),
            self.date.as_str(),
            self.time.as_str(),
            self.config_hash.as_str(),
        ]
        .join("-")
    }
}

fn short_tag(raw: &str, max_len: usize) -> String {
    let tag: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(max_len)
        .collect();
    if tag.is_empty() {
        "x".to_string()
    } else {
        tag
    }
}

/// All 24 bits come from a random base drawn once per process, offset by the
/// run sequence. Ids from one process never repeat until the sequence wraps.
fn disambiguator(base: u32, seq: u32) -> String {
    format!("{:06x}", base.wrapping_add(seq) & DISAMBIGUATOR_MASK)
}

fn next_disambiguator() -> String {
    let base = *PROCESS_BASE.get_or_init(|| rand::random::<u32>() ^ std::process::id());
    disambiguator(base, RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

fn is_lower_alnum(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

impl RunId {
    /// Label a run. Two calls with the same spec share every component but
    /// the disambiguator.
    pub fn generate(spec: &RunSpec) -> ReplayResult<Self> {
        let (date, time) = compact_date_time(spec.window().start_ns);
        let hash = spec.config_hash()?;
        Ok(Self(format!(
            "{}-{}-{}-{}-{}-{}",
            short_tag(&spec.venue().name, VENUE_TAG_LEN),
            short_tag(&spec.instrument().symbol, INSTRUMENT_TAG_LEN),
            date,
            time,
            &hash[..HASH_LEN],
            next_disambiguator()
        )))
    }

    /// Split an id into its components. `None` if it is not well-formed.
    pub fn parse(s: &str) -> Option<RunIdParts> {
        let parts: Vec<&str> = s.split('-').collect();
        let [venue, instrument, date, time, hash, disambiguator] = parts.as_slice() else {
            return None;
        };
        let ok = !venue.is_empty()
            && venue.len() <= VENUE_TAG_LEN
            && is_lower_alnum(venue)
            && !instrument.is_empty()
            && instrument.len() <= INSTRUMENT_TAG_LEN
            && is_lower_alnum(instrument)
            && date.len() == 8
            && date.chars().all(|c| c.is_ascii_digit())
            && time.len() == 6
            && time.chars().all(|c| c.is_ascii_digit())
            && hash.len() == HASH_LEN
            && is_lower_hex(hash)
            && disambiguator.len() == DISAMBIGUATOR_LEN
            && is_lower_hex(disambiguator);
        ok.then(|| RunIdParts {
            venue: venue.to_string(),
            instrument: instrument.to_string(),
            date: date.to_string(),
            time: time.to_string(),
            config_hash: hash.to_string(),
            disambiguator: disambiguator.to_string(),
        })
    }

    pub fn parts(&self) -> Option<RunIdParts> {
        Self::parse(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
