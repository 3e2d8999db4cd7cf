// =============================================================================
// Persistent Store — append-only candle and replay-event collections
// =============================================================================
//
// One candle collection per (symbol, interval kind), named `{symbol}_1{kind}`,
// plus one tick and one orderbook collection per symbol for replay.  Queries
// are inclusive range filters.  The store enforces no uniqueness: readers
// dedupe against the last `end_time` they already hold.
// =============================================================================

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::market_data::{Candle, OrderbookEvent, Tick};
use crate::types::IntervalKind;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Inclusive filters on a candle's `start_time` / `end_time`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandleRange {
    pub start_from: Option<i64>,
    pub start_to: Option<i64>,
    pub end_from: Option<i64>,
    pub end_to: Option<i64>,
}

impl CandleRange {
    /// Candles starting at or after `from`.
    #[cfg(test)]
    pub fn starting_from(from: i64) -> Self {
        Self {
            start_from: Some(from),
            ..Self::default()
        }
    }

    /// Candles ending within `[from, to]`.
    pub fn ending_within(from: i64, to: i64) -> Self {
        Self {
            end_from: Some(from),
            end_to: Some(to),
            ..Self::default()
        }
    }

    pub fn matches(&self, candle: &Candle) -> bool {
        self.start_from.map_or(true, |v| candle.start_time >= v)
            && self.start_to.map_or(true, |v| candle.start_time <= v)
            && self.end_from.map_or(true, |v| candle.end_time >= v)
            && self.end_to.map_or(true, |v| candle.end_time <= v)
    }
}

/// Collection name of a unit candle series.
pub fn candle_collection(symbol: &str, kind: IntervalKind) -> String {
    format!("{}_1{}", symbol.to_lowercase(), kind)
}

/// Read/append access to persisted market data.
#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Unit candles of one series matching `range`, in insertion order.
    async fn load_candles(
        &self,
        symbol: &str,
        kind: IntervalKind,
        range: CandleRange,
    ) -> Result<Vec<Candle>>;

    async fn append_candle(&self, symbol: &str, kind: IntervalKind, candle: &Candle) -> Result<()>;

    /// Recorded trades with `from <= event_time <= to`.
    async fn price_events(&self, symbol: &str, from: i64, to: i64) -> Result<Vec<Tick>>;

    /// Recorded orderbook snapshots with `from <= event_time <= to`.
    async fn orderbook_events(&self, symbol: &str, from: i64, to: i64)
        -> Result<Vec<OrderbookEvent>>;

    async fn append_tick(&self, tick: &Tick) -> Result<()>;

    async fn append_orderbook(&self, event: &OrderbookEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionType;
    use rust_decimal::Decimal;

    fn candle(start: i64, end: i64) -> Candle {
        Candle {
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            start_time: start,
            end_time: end,
            base_volume: Decimal::ZERO,
            quote_volume: Decimal::ZERO,
            session: SessionType::Normal,
            adjusted: false,
        }
    }

    #[test]
    fn range_filters_are_inclusive() {
        let r = CandleRange::ending_within(100, 200);
        assert!(r.matches(&candle(50, 100)));
        assert!(r.matches(&candle(150, 200)));
        assert!(!r.matches(&candle(150, 201)));
        assert!(CandleRange::starting_from(10).matches(&candle(10, 20)));
        assert!(!CandleRange::starting_from(11).matches(&candle(10, 20)));
        assert!(CandleRange::default().matches(&candle(-5, 5)));
    }

    #[test]
    fn collection_names() {
        assert_eq!(candle_collection("A005930", IntervalKind::Minute), "a005930_1m");
        assert_eq!(candle_collection("a005930", IntervalKind::Month), "a005930_1M");
    }
}
