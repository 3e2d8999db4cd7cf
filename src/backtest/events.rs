// =============================================================================
// Replay events and published stream messages
// =============================================================================

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::market_data::{Candle, OrderbookEvent, Tick};
use crate::store::CandleRepository;

/// One persisted event replayed by the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Price(Tick),
    Orderbook(OrderbookEvent),
}

impl ReplayEvent {
    pub fn time(&self) -> i64 {
        match self {
            Self::Price(t) => t.event_time,
            Self::Orderbook(o) => o.event_time,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Price(t) => &t.symbol,
            Self::Orderbook(o) => &o.symbol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    PriceStream,
    OrderbookStream,
    CandleStream,
}

/// Message pushed to backtest stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub kind: StreamKind,
    pub symbol: String,
    pub payload: Value,
}

impl StreamMessage {
    pub fn from_event(event: &ReplayEvent) -> Self {
        match event {
            ReplayEvent::Price(t) => Self {
                kind: StreamKind::PriceStream,
                symbol: t.symbol.clone(),
                payload: t.to_wire(),
            },
            ReplayEvent::Orderbook(o) => Self {
                kind: StreamKind::OrderbookStream,
                symbol: o.symbol.clone(),
                payload: o.to_wire(),
            },
        }
    }

    pub fn candle(symbol: &str, candle: &Candle) -> Self {
        Self {
            kind: StreamKind::CandleStream,
            symbol: symbol.to_string(),
            payload: candle.to_wire(),
        }
    }
}

/// Load every target's price and orderbook events with `from <= t <= to`,
/// merged by event time. Ties keep arrival order: targets in the given
/// order, prices before orderbooks. A failing read contributes nothing.
pub async fn fetch_window(
    repo: &dyn CandleRepository,
    targets: &[String],
    from: i64,
    to: i64,
) -> Vec<ReplayEvent> {
    let per_target = join_all(targets.iter().map(|symbol| async move {
        let (prices, books) = tokio::join!(
            repo.price_events(symbol, from, to),
            repo.orderbook_events(symbol, from, to)
        );

        let mut events = Vec::new();
        match prices {
            Ok(ticks) => events.extend(ticks.into_iter().map(ReplayEvent::Price)),
            Err(e) => warn!(symbol = %symbol, from, to, error = %e, "price event load failed"),
        }
        match books {
            Ok(obs) => events.extend(obs.into_iter().map(ReplayEvent::Orderbook)),
            Err(e) => warn!(symbol = %symbol, from, to, error = %e, "orderbook event load failed"),
        }
        events
    }))
    .await;

    merge_events(per_target)
}

/// Stable merge of several event lists by event time.
pub fn merge_events(lists: Vec<Vec<ReplayEvent>>) -> Vec<ReplayEvent> {
    let mut all: Vec<ReplayEvent> = lists.into_iter().flatten().collect();
    all.sort_by_key(ReplayEvent::time);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;
    use crate::types::SessionType;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn tick(symbol: &str, t: i64) -> Tick {
        Tick {
            symbol: symbol.into(),
            event_time: t,
            price: Decimal::from(10),
            quantity: Decimal::ONE,
            is_sell: false,
            session: SessionType::Normal,
        }
    }

    fn book(symbol: &str, t: i64) -> OrderbookEvent {
        OrderbookEvent {
            symbol: symbol.into(),
            bid_all: json!(1),
            ask_all: json!(1),
            bids: json!([]),
            asks: json!([]),
            event_time: t,
            time_type: SessionType::Normal,
        }
    }

    #[test]
    fn merge_is_stable_on_ties() {
        let a = vec![ReplayEvent::Price(tick("a", 5)), ReplayEvent::Price(tick("a", 9))];
        let b = vec![ReplayEvent::Orderbook(book("b", 5)), ReplayEvent::Price(tick("b", 7))];
        let merged = merge_events(vec![a, b]);
        let order: Vec<(i64, &str)> = merged.iter().map(|e| (e.time(), e.symbol())).collect();
        assert_eq!(order, vec![(5, "a"), (5, "b"), (7, "b"), (9, "a")]);
        assert!(matches!(merged[1], ReplayEvent::Orderbook(_)));
    }

    #[tokio::test]
    async fn window_fetch_merges_targets() {
        let repo = MemoryRepository::new();
        repo.append_tick(&tick("a005930", 30)).await.unwrap();
        repo.append_tick(&tick("a000660", 10)).await.unwrap();
        repo.append_orderbook(&book("a005930", 20)).await.unwrap();
        repo.append_tick(&tick("a005930", 99)).await.unwrap();

        let targets = vec!["a005930".to_string(), "a000660".to_string()];
        let events = fetch_window(&repo, &targets, 0, 50).await;
        let times: Vec<i64> = events.iter().map(ReplayEvent::time).collect();
        assert_eq!(times, vec![10, 20, 30]);

        repo.set_unavailable(true);
        assert!(fetch_window(&repo, &targets, 0, 50).await.is_empty());
    }

    #[test]
    fn messages_serialize_with_camel_case_kind() {
        let msg = StreamMessage::from_event(&ReplayEvent::Price(tick("a", 1)));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["kind"], "priceStream");
        assert_eq!(v["payload"][1], 1);
        let c = Candle::from_tick(&tick("a", 0), 0, 59_999);
        let v = serde_json::to_value(StreamMessage::candle("a", &c)).unwrap();
        assert_eq!(v["kind"], "candleStream");
    }
}
