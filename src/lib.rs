//! TickReplay Backend Library
//!
//! Raw tick ingestion, catalog caching and post-run analytics for replay
//! backtests. Exposed for the `replay_catalog` binary and integration tests.

pub mod replay;
