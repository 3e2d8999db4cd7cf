// =============================================================================
// Engine Configuration — serde-defaulted settings with atomic save
// =============================================================================
//
// Every tunable lives here: tracked symbols, collaborator endpoints, the
// per-interval retention table and replay pacing.  All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.  Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::SymbolContext;
use crate::types::IntervalKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

/// Korea Standard Time, the offset of the default venue.
const KST_OFFSET_SECS: i32 = 9 * 3600;

fn default_symbols() -> Vec<SymbolContext> {
    vec![
        SymbolContext::new("a005930", KST_OFFSET_SECS),
        SymbolContext::new("a000660", KST_OFFSET_SECS),
    ]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_stream_url() -> String {
    "ws://127.0.0.1:8081/stream".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_backtest_upstream_timeout_secs() -> u64 {
    600
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_window_ms() -> i64 {
    10 * 60_000
}

fn default_speed() -> f64 {
    2.0
}

fn default_pause_poll_ms() -> u64 {
    1000
}

// =============================================================================
// LimitTable
// =============================================================================

/// Retention ceiling and store lookback for one interval kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalLimit {
    /// Maximum number of unit candles kept in memory.
    pub count: usize,
    /// How many days back the store is searched on fetch.
    pub days: u32,
}

/// Per-interval retention limits injected into every unit store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitTable {
    #[serde(default = "LimitTable::default_minute")]
    pub minute: IntervalLimit,
    #[serde(default = "LimitTable::default_hour")]
    pub hour: IntervalLimit,
    #[serde(default = "LimitTable::default_day")]
    pub day: IntervalLimit,
    #[serde(default = "LimitTable::default_week")]
    pub week: IntervalLimit,
    #[serde(default = "LimitTable::default_month")]
    pub month: IntervalLimit,
}

impl LimitTable {
    fn default_minute() -> IntervalLimit {
        // 30 days of minutes, one week of lookback.
        IntervalLimit { count: 43_200, days: 7 }
    }

    fn default_hour() -> IntervalLimit {
        IntervalLimit { count: 365 * 24, days: 365 }
    }

    fn default_day() -> IntervalLimit {
        IntervalLimit { count: 3650, days: 3650 }
    }

    fn default_week() -> IntervalLimit {
        IntervalLimit { count: 520, days: 3650 }
    }

    fn default_month() -> IntervalLimit {
        IntervalLimit { count: 240, days: 7300 }
    }

    pub fn get(&self, kind: IntervalKind) -> IntervalLimit {
        match kind {
            IntervalKind::Minute => self.minute,
            IntervalKind::Hour => self.hour,
            IntervalKind::Day => self.day,
            IntervalKind::Week => self.week,
            IntervalKind::Month => self.month,
        }
    }

    #[cfg(test)]
    pub fn limit_count(&self, kind: IntervalKind) -> usize {
        self.get(kind).count
    }

    pub fn limit_days(&self, kind: IntervalKind) -> u32 {
        self.get(kind).days
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        Self {
            minute: Self::default_minute(),
            hour: Self::default_hour(),
            day: Self::default_day(),
            week: Self::default_week(),
            month: Self::default_month(),
        }
    }
}

// =============================================================================
// ReplayConfig
// =============================================================================

/// Pacing parameters of the backtest replay loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Simulated span fetched per replay batch.
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Replay speed multiplier applied when a backtest is created.
    #[serde(default = "default_speed")]
    pub default_speed: f64,

    /// Upper bound on how long a paused replay sleeps before re-checking.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            default_speed: default_speed(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

impl ReplayConfig {
    /// Replace out-of-range values with their defaults.
    pub fn sanitized(mut self) -> Self {
        if self.window_ms <= 0 {
            warn!(window_ms = self.window_ms, "replay window must be positive, using default");
            self.window_ms = default_window_ms();
        }
        if !self.default_speed.is_finite() || self.default_speed <= 0.0 {
            warn!(
                default_speed = self.default_speed,
                "replay speed must be positive, using default"
            );
            self.default_speed = default_speed();
        }
        if self.pause_poll_ms == 0 {
            warn!("pause poll interval must be positive, using default");
            self.pause_poll_ms = default_pause_poll_ms();
        }
        self
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration of the candle engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instruments with a live candle cache.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolContext>,

    /// Address of the HTTP/WebSocket query surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the historical candle (gap-fill) service.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Backtest gap-fill queries can cover long ranges and get more time.
    #[serde(default = "default_backtest_upstream_timeout_secs")]
    pub backtest_upstream_timeout_secs: u64,

    /// Base URL of the live tick WebSocket feed; `/{symbol}` is appended.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// SQLite database file. `None` keeps everything in memory.
    #[serde(default)]
    pub db_path: Option<String>,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default)]
    pub limits: LimitTable,

    #[serde(default)]
    pub replay: ReplayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            bind_addr: default_bind_addr(),
            upstream_url: default_upstream_url(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            backtest_upstream_timeout_secs: default_backtest_upstream_timeout_secs(),
            stream_url: default_stream_url(),
            db_path: None,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            limits: LimitTable::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        config.replay = config.replay.sanitized();

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `ENGINE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(syms) = std::env::var("ENGINE_SYMBOLS") {
            let offset = self
                .symbols
                .first()
                .map(|s| s.utc_offset_secs)
                .unwrap_or(KST_OFFSET_SECS);
            let parsed: Vec<SymbolContext> = syms
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .map(|s| SymbolContext::new(s, offset))
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(addr) = std::env::var("ENGINE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("ENGINE_UPSTREAM_URL") {
            self.upstream_url = url;
        }
        if let Ok(url) = std::env::var("ENGINE_STREAM_URL") {
            self.stream_url = url;
        }
        if let Ok(path) = std::env::var("ENGINE_DB_PATH") {
            self.db_path = Some(path);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_shrink_with_granularity() {
        let t = LimitTable::default();
        assert_eq!(t.limit_count(IntervalKind::Minute), 43_200);
        assert_eq!(t.limit_count(IntervalKind::Hour), 8760);
        assert_eq!(t.limit_count(IntervalKind::Month), 240);
        assert!(t.limit_count(IntervalKind::Minute) > t.limit_count(IntervalKind::Hour));
        assert!(t.limit_count(IntervalKind::Week) > t.limit_count(IntervalKind::Month));
        assert_eq!(t.limit_days(IntervalKind::Minute), 7);
        assert_eq!(t.limit_days(IntervalKind::Month), 7300);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 2);
        assert_eq!(cfg.symbols[0].utc_offset_secs, KST_OFFSET_SECS);
        assert_eq!(cfg.replay.window_ms, 600_000);
        assert!((cfg.replay.default_speed - 2.0).abs() < f64::EPSILON);
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": [{ "symbol": "btcusdt", "intervals": ["m", "d"] }],
            "limits": { "minute": { "count": 100, "days": 1 } },
            "replay": { "window_ms": 60000 }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols[0].symbol, "btcusdt");
        assert_eq!(
            cfg.symbols[0].intervals,
            vec![IntervalKind::Minute, IntervalKind::Day]
        );
        assert_eq!(cfg.limits.limit_count(IntervalKind::Minute), 100);
        assert_eq!(cfg.limits.limit_count(IntervalKind::Day), 3650);
        assert_eq!(cfg.replay.window_ms, 60_000);
        assert_eq!(cfg.replay.pause_poll_ms, 1000);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("engine-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.bind_addr = "127.0.0.1:9999".into();
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:9999");
        assert_eq!(loaded.limits, cfg.limits);
        assert_eq!(loaded.symbols, cfg.symbols);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn invalid_replay_values_fall_back_to_defaults() {
        let cfg = ReplayConfig {
            window_ms: 0,
            default_speed: 0.0,
            pause_poll_ms: 0,
        }
        .sanitized();
        assert_eq!(cfg, ReplayConfig::default());

        let nan = ReplayConfig {
            default_speed: f64::NAN,
            window_ms: -5,
            ..ReplayConfig::default()
        }
        .sanitized();
        assert_eq!(nan.default_speed, 2.0);
        assert_eq!(nan.window_ms, 600_000);

        let custom = ReplayConfig {
            window_ms: 1000,
            default_speed: 0.5,
            pause_poll_ms: 10,
        };
        assert_eq!(custom.clone().sanitized(), custom);
    }

    #[test]
    fn load_sanitizes_replay_section() {
        let dir = std::env::temp_dir().join(format!("engine-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");
        std::fs::write(&path, r#"{ "replay": { "default_speed": -1.0, "window_ms": 0 } }"#)
            .unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.replay, ReplayConfig::default());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_error() {
        assert!(EngineConfig::load("/nonexistent/engine_config.json").is_err());
    }
}
