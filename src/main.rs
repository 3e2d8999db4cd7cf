// =============================================================================
// Candle Engine — Main Entry Point
// =============================================================================
//
// Loads the live candle caches for every configured symbol, keeps them fed
// from the tick stream, and serves live and backtest queries over HTTP/WS.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backtest;
mod market_data;
mod runtime_config;
mod store;
mod types;
mod upstream;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::candle_cache;
use crate::market_data::{TickFeed, WsTickFeed};
use crate::runtime_config::EngineConfig;
use crate::store::{CandleRepository, MemoryRepository, SqliteRepository};
use crate::upstream::{GapFill, NoGapFill, RestGapFill};

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Engine starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env();

    let symbols: Vec<String> = config.symbols.iter().map(|s| s.symbol.clone()).collect();
    info!(symbols = ?symbols, bind = %config.bind_addr, "Configuration loaded");

    // ── 2. Persistent store ──────────────────────────────────────────────
    let repo: Arc<dyn CandleRepository> = match config.db_path.as_deref() {
        Some(path) => Arc::new(SqliteRepository::open(path).await?),
        None => {
            warn!("No db_path configured, persisted data lives in memory only");
            Arc::new(MemoryRepository::new())
        }
    };

    // ── 3. Upstream gap-fill ─────────────────────────────────────────────
    let (upstream, backtest_upstream): (Arc<dyn GapFill>, Arc<dyn GapFill>) =
        if config.upstream_url.trim().is_empty() {
            warn!("No upstream_url configured, gap-fill disabled");
            (Arc::new(NoGapFill), Arc::new(NoGapFill))
        } else {
            (
                Arc::new(RestGapFill::new(&config.upstream_url, config.upstream_timeout_secs)?),
                Arc::new(RestGapFill::new(
                    &config.upstream_url,
                    config.backtest_upstream_timeout_secs,
                )?),
            )
        };

    let feed: Arc<dyn TickFeed> = Arc::new(WsTickFeed::new(
        config.stream_url.clone(),
        config.reconnect_delay_secs,
    ));
    let limits = config.limits.clone();
    let bind_addr = config.bind_addr.clone();

    // ── 4. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config,
        Arc::clone(&repo),
        Arc::clone(&upstream),
        backtest_upstream,
    ));

    // ── 5. Live candle caches ────────────────────────────────────────────
    for (symbol, cache) in &state.caches {
        let cache = Arc::clone(cache);
        let repo = Arc::clone(&repo);
        let upstream = Arc::clone(&upstream);
        let feed = Arc::clone(&feed);
        let limits = limits.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            candle_cache::run(cache, repo, upstream, feed, limits).await;
            warn!(symbol = %sym, "Live candle cache stopped");
        });
    }
    info!(count = state.caches.len(), "Live candle caches launched");

    // ── 6. API server ────────────────────────────────────────────────────
    let app = api::rest::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    state.finish_backtest();
    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Candle Engine shut down complete.");
    Ok(())
}
