// =============================================================================
// Aurora Series — candle series core
// =============================================================================
//
// Turns REST snapshots, live candles and raw price ticks into strictly
// time-ordered, gap-aware OHLCV series with technical indicators on top.
// Transport, rendering and the REST client itself live outside this crate.
// =============================================================================

pub mod engine;
pub mod error;
pub mod indicators;
pub mod market_data;
pub mod runtime_config;
pub mod snapshot;
pub mod throttle;
pub mod types;

pub use engine::{CandleOutcome, MarketEngine, SeriesUpdate, TickDisposition};
pub use error::SeriesError;
pub use runtime_config::{CacheConfig, EngineConfig};
pub use types::{Candle, SeriesKey, Snapshot, Tick, TimeframeInfo};
