// =============================================================================
// Central Application State — Candle Engine
// =============================================================================
//
// Ties together the live candle caches (one per configured symbol), the
// single optional backtest timeline, and the shared collaborators they use.
// Handlers and background tasks hold `Arc<AppState>`.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared state.  No guard is ever held
//     across an `.await`; long-running work happens on owned values that are
//     swapped in afterwards.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::backtest::{BacktestRequest, BacktestTimeline, TimelineStatus};
use crate::market_data::{Candle, CandleCache, SymbolContext};
use crate::runtime_config::EngineConfig;
use crate::store::CandleRepository;
use crate::upstream::GapFill;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Optional machine-readable code (e.g. an HTTP status).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub symbol: String,
    pub ready: bool,
    pub minute_candles: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub caches: Vec<CacheHealth>,
    pub backtest: Option<TimelineStatus>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every control-surface mutation.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: RwLock<EngineConfig>,

    // ── Collaborators ───────────────────────────────────────────────────
    pub repo: Arc<dyn CandleRepository>,
    pub upstream: Arc<dyn GapFill>,
    /// Same service with the longer backtest timeout.
    pub backtest_upstream: Arc<dyn GapFill>,

    // ── Live caches ─────────────────────────────────────────────────────
    pub caches: HashMap<String, Arc<RwLock<CandleCache>>>,

    // ── Backtest ────────────────────────────────────────────────────────
    pub backtest: RwLock<Option<Arc<BacktestTimeline>>>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the state with an empty (not yet fetched) cache per symbol.
    pub fn new(
        config: EngineConfig,
        repo: Arc<dyn CandleRepository>,
        upstream: Arc<dyn GapFill>,
        backtest_upstream: Arc<dyn GapFill>,
    ) -> Self {
        let caches = config
            .symbols
            .iter()
            .map(|ctx| {
                (
                    ctx.symbol.clone(),
                    Arc::new(RwLock::new(CandleCache::new(ctx.clone(), &config.limits))),
                )
            })
            .collect();

        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            repo,
            upstream,
            backtest_upstream,
            caches,
            backtest: RwLock::new(None),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Version
    // -------------------------------------------------------------------------

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Error log
    // -------------------------------------------------------------------------

    pub fn push_error(&self, message: impl Into<String>) {
        self.push_error_with_code(message, None);
    }

    pub fn push_error_with_code(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        if errors.len() > MAX_RECENT_ERRORS {
            let excess = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(..excess);
        }
    }

    // -------------------------------------------------------------------------
    // Live queries
    // -------------------------------------------------------------------------

    /// Configured context for `symbol`; unknown symbols get the first
    /// configured offset and every base interval.
    pub fn context_for(&self, symbol: &str) -> SymbolContext {
        let config = self.config.read();
        if let Some(ctx) = config.symbols.iter().find(|c| c.symbol == symbol) {
            return ctx.clone();
        }
        let offset = config.symbols.first().map_or(0, |c| c.utc_offset_secs);
        SymbolContext::new(symbol, offset)
    }

    /// Live candles for `symbol` at `spec`. `None` if the symbol has no cache.
    pub fn live_candles(&self, symbol: &str, spec: &str) -> Option<Vec<Candle>> {
        self.caches.get(symbol).map(|cache| cache.read().get_data(spec))
    }

    // -------------------------------------------------------------------------
    // Backtest
    // -------------------------------------------------------------------------

    /// Discard any prior timeline and build a new one.
    pub async fn create_backtest(
        &self,
        request: &BacktestRequest,
    ) -> Result<Arc<BacktestTimeline>> {
        let previous = self.backtest.write().take();
        if let Some(old) = previous {
            old.finish();
            info!(id = %old.id(), "previous backtest discarded");
        }

        let (limits, replay) = {
            let config = self.config.read();
            (config.limits.clone(), config.replay.clone())
        };

        let timeline = BacktestTimeline::create(
            request,
            |symbol| self.context_for(symbol),
            &limits,
            replay,
            Arc::clone(&self.repo),
            Arc::clone(&self.backtest_upstream),
        )
        .await
        .inspect_err(|e| {
            warn!(error = %e, "backtest creation failed");
            self.push_error(format!("backtest creation failed: {e}"));
        })?;

        // A concurrent create may have raced in while this one loaded.
        let displaced = self.backtest.write().replace(Arc::clone(&timeline));
        if let Some(old) = displaced {
            old.finish();
        }
        self.increment_version();
        Ok(timeline)
    }

    pub fn backtest(&self) -> Option<Arc<BacktestTimeline>> {
        self.backtest.read().clone()
    }

    /// Finish and drop the current timeline. Returns false if none existed.
    pub fn finish_backtest(&self) -> bool {
        let current = self.backtest.write().take();
        match current {
            Some(timeline) => {
                timeline.finish();
                self.increment_version();
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn build_snapshot(&self) -> HealthSnapshot {
        let mut caches: Vec<CacheHealth> = self
            .caches
            .iter()
            .map(|(symbol, cache)| {
                let cache = cache.read();
                CacheHealth {
                    symbol: symbol.clone(),
                    ready: cache.is_ready(),
                    minute_candles: cache
                        .store(crate::types::IntervalKind::Minute)
                        .map_or(0, |s| s.len()),
                }
            })
            .collect();
        caches.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        HealthSnapshot {
            status: "ok",
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            caches,
            backtest: self.backtest().map(|t| t.status()),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{ReplayState, TimeFrame};
    use crate::store::MemoryRepository;
    use crate::types::IntervalKind;
    use crate::upstream::NoGapFill;

    fn state() -> AppState {
        let mut config = EngineConfig::default();
        config.symbols = vec![SymbolContext::new("a005930", 9 * 3600)];
        AppState::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(NoGapFill),
            Arc::new(NoGapFill),
        )
    }

    fn request() -> BacktestRequest {
        BacktestRequest {
            targets: vec!["a005930".into()],
            start_time: 0,
            end_time: 60_000,
            time_frame: TimeFrame::Candle(IntervalKind::Minute),
        }
    }

    #[test]
    fn error_log_is_bounded() {
        let state = state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error(format!("e{i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e5");
    }

    #[test]
    fn unknown_symbols_get_default_context() {
        let state = state();
        assert_eq!(state.context_for("a005930").utc_offset_secs, 9 * 3600);
        let other = state.context_for("a000660");
        assert_eq!(other.utc_offset_secs, 9 * 3600);
        assert_eq!(other.intervals.len(), IntervalKind::ALL.len());
        assert!(state.live_candles("a000660", "1m").is_none());
        assert_eq!(state.live_candles("a005930", "1m"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn creating_a_backtest_finishes_the_previous_one() {
        let state = state();
        let first = state.create_backtest(&request()).await.unwrap();
        let second = state.create_backtest(&request()).await.unwrap();
        assert_eq!(first.state(), ReplayState::Finished);
        assert_eq!(second.state(), ReplayState::Stopped);
        assert_eq!(state.backtest().unwrap().id(), second.id());

        assert!(state.finish_backtest());
        assert!(state.backtest().is_none());
        assert!(!state.finish_backtest());
    }

    #[tokio::test]
    async fn failed_creation_is_logged() {
        let state = state();
        let mut bad = request();
        bad.targets.clear();
        assert!(state.create_backtest(&bad).await.is_err());
        assert_eq!(state.recent_errors.read().len(), 1);
        assert!(state.build_snapshot().backtest.is_none());
    }
}
