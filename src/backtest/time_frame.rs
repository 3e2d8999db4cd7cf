// =============================================================================
// Backtest time frame and the native candle series it drives
// =============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::market_data::{Candle, UnitCandleStore};
use crate::market_data::grouping;
use crate::types::{IntervalKind, MINUTE_MS};

/// `r` replays ticks into a minute series; any base kind steps through a
/// pre-loaded candle series of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFrame {
    Realtime,
    Candle(IntervalKind),
}

impl TimeFrame {
    /// Accepts `r`, a bare kind (`m`) or a unit spec (`1m`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "r" {
            return Some(Self::Realtime);
        }
        let body = s.strip_prefix('1').unwrap_or(s);
        let mut chars = body.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => IntervalKind::from_char(c).map(Self::Candle),
            _ => None,
        }
    }

    /// Base kind of the native series.
    pub fn kind(self) -> IntervalKind {
        match self {
            Self::Realtime => IntervalKind::Minute,
            Self::Candle(kind) => kind,
        }
    }

    /// Cursor advance of one `next` step.
    pub fn step_ms(self) -> i64 {
        match self {
            Self::Realtime => MINUTE_MS,
            Self::Candle(kind) => kind.unit_ms(),
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realtime => write!(f, "r"),
            Self::Candle(kind) => write!(f, "{kind}"),
        }
    }
}

impl Serialize for TimeFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown time frame: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Native series
// ---------------------------------------------------------------------------

pub enum NativeSeries {
    /// Minute candles built from replayed ticks.
    Realtime(UnitCandleStore),
    /// Loaded candles; `data[..next_index]` has been materialised.
    Candles { data: Vec<Candle>, next_index: usize },
}

impl NativeSeries {
    /// Materialise every loaded candle with `start_time <= ms` and return the
    /// newly materialised ones. No-op for the realtime series.
    pub fn next(&mut self, ms: i64) -> Vec<Candle> {
        match self {
            Self::Realtime(_) => Vec::new(),
            Self::Candles { data, next_index } => {
                let from = *next_index;
                while *next_index < data.len() && data[*next_index].start_time <= ms {
                    *next_index += 1;
                }
                data[from..*next_index].to_vec()
            }
        }
    }

    /// Materialised candles with `start_time > t`.
    pub fn get_data_until_now(&self, t: i64) -> Vec<Candle> {
        match self {
            Self::Realtime(store) => store.since(t.saturating_add(1)),
            Self::Candles { data, next_index } => data[..*next_index]
                .iter()
                .filter(|c| c.start_time > t)
                .cloned()
                .collect(),
        }
    }

    /// Materialised series grouped by `multiple`.
    pub fn grouped(&self, kind: IntervalKind, multiple: u32) -> Vec<Candle> {
        match self {
            Self::Realtime(store) => store.get_candle(multiple),
            Self::Candles { data, next_index } => {
                grouping::get_candle(&data[..*next_index], kind, multiple)
            }
        }
    }

    #[cfg(test)]
    pub fn materialised_len(&self) -> usize {
        match self {
            Self::Realtime(store) => store.len(),
            Self::Candles { next_index, .. } => *next_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Tick;
    use crate::types::SessionType;
    use rust_decimal::Decimal;

    fn minute(i: i64) -> Candle {
        let tick = Tick {
            symbol: "a".into(),
            event_time: i * MINUTE_MS,
            price: Decimal::from(10),
            quantity: Decimal::ONE,
            is_sell: false,
            session: SessionType::Normal,
        };
        Candle::from_tick(&tick, i * MINUTE_MS, (i + 1) * MINUTE_MS - 1)
    }

    #[test]
    fn parses_frames() {
        assert_eq!(TimeFrame::parse("r"), Some(TimeFrame::Realtime));
        assert_eq!(TimeFrame::parse("d"), Some(TimeFrame::Candle(IntervalKind::Day)));
        assert_eq!(TimeFrame::parse("1M"), Some(TimeFrame::Candle(IntervalKind::Month)));
        assert_eq!(TimeFrame::parse("5m"), None);
        assert_eq!(TimeFrame::parse("x"), None);
        assert_eq!(TimeFrame::Realtime.step_ms(), MINUTE_MS);
        let json = serde_json::to_string(&TimeFrame::Candle(IntervalKind::Hour)).unwrap();
        assert_eq!(json, "\"h\"");
        assert!(serde_json::from_str::<TimeFrame>("\"q\"").is_err());
    }

    #[test]
    fn next_materialises_by_start_time() {
        let mut series = NativeSeries::Candles {
            data: (0..5).map(minute).collect(),
            next_index: 0,
        };
        assert_eq!(series.next(MINUTE_MS).len(), 2);
        assert!(series.next(MINUTE_MS).is_empty());
        assert_eq!(series.next(10 * MINUTE_MS).len(), 3);
        assert_eq!(series.materialised_len(), 5);
        assert_eq!(series.get_data_until_now(2 * MINUTE_MS).len(), 2);
        assert_eq!(series.grouped(IntervalKind::Minute, 5).len(), 1);
    }
}
