// =============================================================================
// Aurora Series — Replay Entry Point
// =============================================================================
//
// Reads newline-delimited JSON feed events from stdin, routes them through the
// market engine and prints one JSON report per series on stdout:
//
//   {"type":"snapshot","symbol":"BTCUSDT","timeframe":"M1","candles":[...]}
//   {"type":"candle","symbol":"BTCUSDT","timeframe":"M1","candle":{...}}
//   {"type":"tick","symbol":"BTCUSDT","ts_ms":1700000000000,"price":42000.5}
//
// Logs go to stderr. Malformed lines are logged and skipped.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_series::indicators::IndicatorMap;
use aurora_series::market_data::{time_grid, FeedStats, TimingStats};
use aurora_series::{Candle, EngineConfig, MarketEngine, SeriesKey, Snapshot, Tick};

/// One line of the replay feed.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedEvent {
    Snapshot(Snapshot),
    Candle {
        symbol: String,
        timeframe: String,
        candle: Candle,
        /// Seconds; defaults to the end of the candle's period.
        #[serde(default)]
        received_at: Option<i64>,
    },
    Tick(Tick),
}

#[derive(Debug, Serialize)]
struct SeriesReport<'a> {
    key: String,
    version: u64,
    opened_at: Option<String>,
    candles: &'a [Candle],
    indicators: &'a IndicatorMap,
    timing: TimingStats,
    feed: FeedStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::var("AURORA_SERIES_CONFIG") {
        Ok(path) => EngineConfig::load(&path).unwrap_or_else(|e| {
            let reason = format!("{e:#}");
            warn!(error = %reason, "failed to load config, using defaults");
            EngineConfig::default()
        }),
        Err(_) => {
            info!("AURORA_SERIES_CONFIG not set, using defaults");
            EngineConfig::default()
        }
    };

    // ── 2. Engine & notification drain ───────────────────────────────────
    let (engine, mut updates) = MarketEngine::new(config);

    let notified = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&notified);
    let drain = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(key = %update.key, version = update.version, change = ?update.change, "series update");
        }
    });

    // ── 3. Replay stdin ──────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0_u64;
    let mut skipped = 0_u64;

    while let Some(line) = lines.next_line().await.context("failed to read feed from stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: FeedEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                skipped += 1;
                warn!(line = line_no, error = %e, "malformed feed line skipped");
                continue;
            }
        };
        if let Err(e) = route(&engine, event) {
            skipped += 1;
            let reason = format!("{e:#}");
            warn!(line = line_no, error = %reason, "feed event rejected");
        }
    }

    // ── 4. Drain & report ────────────────────────────────────────────────
    engine.flush_all();

    for key in engine.keys() {
        let (Some(candles), Some(timing), Some(feed)) = (
            engine.snapshot(&key),
            engine.timing_stats(&key),
            engine.feed_stats(&key),
        ) else {
            continue;
        };
        let indicators = engine.indicators(&key)?;
        let report = SeriesReport {
            key: key.to_string(),
            version: engine.version(&key).unwrap_or_default(),
            opened_at: candles
                .first()
                .and_then(|c| c.opened_at())
                .map(|t| t.to_rfc3339()),
            candles: &candles,
            indicators: &indicators,
            timing,
            feed,
        };
        let json = serde_json::to_string(&report)
            .with_context(|| format!("failed to serialise report for {key}"))?;
        println!("{json}");
    }

    engine.close();
    drop(engine);
    if let Err(e) = drain.await {
        warn!(error = %e, "notification drain task failed");
    }

    info!(
        lines = line_no,
        skipped,
        notifications = notified.load(Ordering::Relaxed),
        "replay complete"
    );
    Ok(())
}

fn route(engine: &MarketEngine, event: FeedEvent) -> anyhow::Result<()> {
    match event {
        FeedEvent::Snapshot(snapshot) => {
            let key = snapshot.key();
            engine
                .apply_snapshot(snapshot)
                .with_context(|| format!("snapshot for {key}"))?;
        }
        FeedEvent::Candle {
            symbol,
            timeframe,
            candle,
            received_at,
        } => {
            let received_at = received_at.unwrap_or_else(|| {
                time_grid::next_period(candle.period_start, time_grid::interval_seconds(&timeframe))
            });
            let key = SeriesKey::new(symbol, timeframe);
            engine
                .on_candle(&key, candle, received_at)
                .with_context(|| format!("candle for {key}"))?;
        }
        FeedEvent::Tick(tick) => {
            engine.on_tick(&tick);
        }
    }
    Ok(())
}
