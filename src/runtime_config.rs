// =============================================================================
// Runtime Configuration — Engine and cache settings
// =============================================================================
//
// Every tunable of the series engine lives here. All fields carry a serde
// default so an empty `{}` (or a file written by an older build) still loads.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::IndicatorSpec;
use crate::market_data::FillPolicy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_series_capacity() -> usize {
    500
}

fn default_amend_window_ms() -> u64 {
    100
}

fn default_render_window_ms() -> u64 {
    16
}

fn default_max_delay_periods() -> i64 {
    2
}

fn default_indicators() -> Vec<IndicatorSpec> {
    IndicatorSpec::default_set()
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_price_ttl_secs() -> u64 {
    5
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_sweep_secs() -> u64 {
    60
}

// =============================================================================
// CacheConfig
// =============================================================================

/// Settings for the snapshot cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default lifetime of a cached snapshot or catalog entry.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Lifetime of a cached last-price entry.
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,

    /// Maximum number of entries before the oldest insertion is evicted.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// How often the background sweep removes expired entries.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            price_ttl_secs: default_price_ttl_secs(),
            capacity: default_cache_capacity(),
            sweep_secs: default_sweep_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn price_ttl(&self) -> Duration {
        Duration::from_secs(self.price_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the series engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Series ---------------------------------------------------------------
    /// Candles retained per (symbol, timeframe); older ones are evicted.
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    /// Late-candle tolerance in whole intervals after a slot closes.
    #[serde(default = "default_max_delay_periods")]
    pub max_delay_periods: i64,

    /// Gap handling. Unset means forward fill capped at `series_capacity`.
    #[serde(default)]
    pub fill_policy: Option<FillPolicy>,

    // --- Throttling -------------------------------------------------------------
    /// Coalescing window for in-period price amendments.
    #[serde(default = "default_amend_window_ms")]
    pub amend_window_ms: u64,

    /// Coalescing window for renderer notifications.
    #[serde(default = "default_render_window_ms")]
    pub render_window_ms: u64,

    // --- Indicators -------------------------------------------------------------
    #[serde(default = "default_indicators")]
    pub indicators: Vec<IndicatorSpec>,

    // --- Snapshot cache ---------------------------------------------------------
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            series_capacity: default_series_capacity(),
            max_delay_periods: default_max_delay_periods(),
            fill_policy: None,
            amend_window_ms: default_amend_window_ms(),
            render_window_ms: default_render_window_ms(),
            indicators: default_indicators(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing or malformed file is an error so the caller can fall back to
    /// defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            series_capacity = config.series_capacity,
            indicators = config.indicators.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    /// Effective gap policy.
    pub fn fill_policy(&self) -> FillPolicy {
        self.fill_policy.unwrap_or(FillPolicy::ForwardFill {
            max_run: self.series_capacity.max(1),
        })
    }

    pub fn amend_window(&self) -> Duration {
        Duration::from_millis(self.amend_window_ms)
    }

    pub fn render_window(&self) -> Duration {
        Duration::from_millis(self.render_window_ms)
    }

    /// Delay tolerance in seconds for a series with `interval`.
    pub fn max_delay(&self, interval: i64) -> i64 {
        self.max_delay_periods.max(0) * interval
    }
}

// =============================================================================
// Tests
// =============================================================================
