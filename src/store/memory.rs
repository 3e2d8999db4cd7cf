// =============================================================================
// In-memory repository
// =============================================================================
//
// Keeps the same document shapes as the database-backed store so that the
// codecs are exercised.  Used when no database path is configured and by the
// test suites, which can also flip it "unavailable" to simulate outages.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::market_data::{Candle, CandleDocument, OrderbookEvent, Tick, TickDocument};
use crate::store::{candle_collection, CandleRange, CandleRepository};
use crate::types::IntervalKind;

#[derive(Default)]
pub struct MemoryRepository {
    candles: RwLock<HashMap<String, Vec<CandleDocument>>>,
    ticks: RwLock<HashMap<String, Vec<TickDocument>>>,
    orderbooks: RwLock<HashMap<String, Vec<Value>>>,
    unavailable: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of persisted documents in a candle series.
    pub fn candle_count(&self, symbol: &str, kind: IntervalKind) -> usize {
        self.candles
            .read()
            .get(&candle_collection(symbol, kind))
            .map_or(0, Vec::len)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory repository unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl CandleRepository for MemoryRepository {
    async fn load_candles(
        &self,
        symbol: &str,
        kind: IntervalKind,
        range: CandleRange,
    ) -> Result<Vec<Candle>> {
        self.check()?;
        let map = self.candles.read();
        let Some(docs) = map.get(&candle_collection(symbol, kind)) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in docs {
            match Candle::from_document(doc) {
                Ok(candle) if range.matches(&candle) => out.push(candle),
                Ok(_) => {}
                Err(e) => warn!(symbol, interval = %kind, error = %e, "skipping malformed candle"),
            }
        }
        Ok(out)
    }

    async fn append_candle(&self, symbol: &str, kind: IntervalKind, candle: &Candle) -> Result<()> {
        self.check()?;
        self.candles
            .write()
            .entry(candle_collection(symbol, kind))
            .or_default()
            .push(candle.to_document());
        Ok(())
    }

    async fn price_events(&self, symbol: &str, from: i64, to: i64) -> Result<Vec<Tick>> {
        self.check()?;
        let map = self.ticks.read();
        let Some(docs) = map.get(&symbol.to_lowercase()) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|d| d.time >= from && d.time <= to)
            .filter_map(|d| {
                Tick::from_document(symbol, d)
                    .inspect_err(|e| warn!(symbol, error = %e, "skipping malformed tick"))
                    .ok()
            })
            .collect())
    }

    async fn orderbook_events(
        &self,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<OrderbookEvent>> {
        self.check()?;
        let map = self.orderbooks.read();
        let Some(docs) = map.get(&symbol.to_lowercase()) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in docs {
            match OrderbookEvent::from_document(symbol, doc) {
                Ok(event) if event.event_time >= from && event.event_time <= to => out.push(event),
                Ok(_) => {}
                Err(e) => warn!(symbol, error = %e, "skipping malformed orderbook event"),
            }
        }
        Ok(out)
    }

    async fn append_tick(&self, tick: &Tick) -> Result<()> {
        self.check()?;
        self.ticks
            .write()
            .entry(tick.symbol.to_lowercase())
            .or_default()
            .push(tick.to_document());
        Ok(())
    }

    async fn append_orderbook(&self, event: &OrderbookEvent) -> Result<()> {
        self.check()?;
        self.orderbooks
            .write()
            .entry(event.symbol.to_lowercase())
            .or_default()
            .push(event.to_wire());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionType;
    use rust_decimal::Decimal;

    fn tick(t: i64) -> Tick {
        Tick {
            symbol: "a005930".into(),
            event_time: t,
            price: Decimal::from(100),
            quantity: Decimal::ONE,
            is_sell: false,
            session: SessionType::Normal,
        }
    }

    #[tokio::test]
    async fn candles_are_returned_in_insertion_order_with_duplicates() {
        let repo = MemoryRepository::new();
        let c = Candle::from_tick(&tick(0), 0, 59_999);
        repo.append_candle("a005930", IntervalKind::Minute, &c).await.unwrap();
        repo.append_candle("a005930", IntervalKind::Minute, &c).await.unwrap();
        let loaded = repo
            .load_candles("a005930", IntervalKind::Minute, CandleRange::default())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(repo.candle_count("a005930", IntervalKind::Minute), 2);
        assert_eq!(repo.candle_count("a005930", IntervalKind::Hour), 0);
    }

    #[tokio::test]
    async fn corrupt_documents_are_skipped() {
        let repo = MemoryRepository::new();
        let good = Candle::from_tick(&tick(0), 0, 59_999);
        repo.append_candle("a005930", IntervalKind::Minute, &good).await.unwrap();
        let mut bad = Candle::from_tick(&tick(60_000), 60_000, 119_999).to_document();
        bad.arr[0] = "x".into();
        repo.candles
            .write()
            .entry(candle_collection("a005930", IntervalKind::Minute))
            .or_default()
            .push(bad);

        let loaded = repo
            .load_candles("a005930", IntervalKind::Minute, CandleRange::default())
            .await
            .unwrap();
        assert_eq!(loaded, vec![good]);
    }

    #[tokio::test]
    async fn tick_range_is_inclusive() {
        let repo = MemoryRepository::new();
        for t in [10, 20, 30] {
            repo.append_tick(&tick(t)).await.unwrap();
        }
        let got = repo.price_events("A005930", 10, 20).await.unwrap();
        assert_eq!(got.iter().map(|t| t.event_time).collect::<Vec<_>>(), vec![10, 20]);
    }

    #[tokio::test]
    async fn unavailable_repository_errors() {
        let repo = MemoryRepository::new();
        repo.set_unavailable(true);
        assert!(repo.price_events("x", 0, 1).await.is_err());
        repo.set_unavailable(false);
        assert!(repo.price_events("x", 0, 1).await.unwrap().is_empty());
    }
}
