// =============================================================================
// Candle, tick and orderbook event types plus their wire/document codecs
// =============================================================================

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::SessionType;

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One OHLCV candle. `start_time..=end_time` is inclusive, epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub start_time: i64,
    pub end_time: i64,
    pub base_volume: Decimal,
    pub quote_volume: Decimal,
    pub session: SessionType,
    pub adjusted: bool,
}

/// Version tag of the positional candle tuple exchanged with the upstream and
/// the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// `[open, high, low, close, startMs, endMs, baseVol, quoteVol, sessionType, adjusted]`
    #[default]
    V1,
}

impl WireFormat {
    pub fn field_count(self) -> usize {
        match self {
            Self::V1 => 10,
        }
    }
}

impl Candle {
    /// Single-trade candle spanning `[start, end]`.
    pub fn from_tick(tick: &Tick, start_time: i64, end_time: i64) -> Self {
        Self {
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            start_time,
            end_time,
            base_volume: tick.quantity,
            quote_volume: tick.price * tick.quantity,
            session: tick.session,
            adjusted: false,
        }
    }

    /// Re-anchor a finer candle's OHLCV onto a coarser unit bucket.
    pub fn rebased(other: &Candle, start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
            adjusted: false,
            ..other.clone()
        }
    }

    /// Fold one trade into this candle.
    pub fn absorb_tick(&mut self, tick: &Tick) {
        self.close = tick.price;
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.base_volume += tick.quantity;
        self.quote_volume += tick.price * tick.quantity;
    }

    /// Fold a finer, already-aggregated candle into this candle.
    pub fn absorb_candle(&mut self, other: &Candle) {
        self.close = other.close;
        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.base_volume += other.base_volume;
        self.quote_volume += other.quote_volume;
    }

    /// Merge two consecutive candles into one spanning both.
    pub fn merge(&self, next: &Candle) -> Candle {
        Candle {
            open: self.open,
            high: self.high.max(next.high),
            low: self.low.min(next.low),
            close: next.close,
            start_time: self.start_time,
            end_time: next.end_time,
            base_volume: self.base_volume + next.base_volume,
            quote_volume: self.quote_volume + next.quote_volume,
            session: self.session,
            adjusted: self.adjusted,
        }
    }

    // -- wire tuple ----------------------------------------------------------

    pub fn to_wire(&self) -> Value {
        self.encode(WireFormat::V1)
    }

    pub fn from_wire(value: &Value) -> Result<Self> {
        Self::decode(value, WireFormat::V1)
    }

    pub fn encode(&self, format: WireFormat) -> Value {
        match format {
            WireFormat::V1 => json!([
                self.open.to_string(),
                self.high.to_string(),
                self.low.to_string(),
                self.close.to_string(),
                self.start_time,
                self.end_time,
                self.base_volume.to_string(),
                self.quote_volume.to_string(),
                self.session.code(),
                if self.adjusted { "1" } else { "0" },
            ]),
        }
    }

    pub fn decode(value: &Value, format: WireFormat) -> Result<Self> {
        let arr = value.as_array().context("candle tuple is not an array")?;
        if arr.len() != format.field_count() {
            bail!(
                "candle tuple has {} fields, expected {}",
                arr.len(),
                format.field_count()
            );
        }
        let candle = Self {
            open: parse_decimal(&arr[0], "open")?,
            high: parse_decimal(&arr[1], "high")?,
            low: parse_decimal(&arr[2], "low")?,
            close: parse_decimal(&arr[3], "close")?,
            start_time: parse_ms(&arr[4], "startTime")?,
            end_time: parse_ms(&arr[5], "endTime")?,
            base_volume: parse_decimal(&arr[6], "baseVolume")?,
            quote_volume: parse_decimal(&arr[7], "quoteVolume")?,
            session: SessionType::from_code(arr[8].as_str().context("sessionType not a string")?),
            adjusted: parse_flag(&arr[9]),
        };
        if candle.start_time > candle.end_time {
            bail!(
                "candle startTime {} after endTime {}",
                candle.start_time,
                candle.end_time
            );
        }
        Ok(candle)
    }

    // -- persisted document -------------------------------------------------

    pub fn to_document(&self) -> CandleDocument {
        CandleDocument {
            start_time: self.start_time,
            end_time: self.end_time,
            time_type: self.session,
            arr: [
                self.open.to_string(),
                self.high.to_string(),
                self.low.to_string(),
                self.close.to_string(),
                self.base_volume.to_string(),
                self.quote_volume.to_string(),
                if self.adjusted { "1" } else { "0" }.to_string(),
            ],
        }
    }

    pub fn from_document(doc: &CandleDocument) -> Result<Self> {
        let d = |i: usize, name: &str| -> Result<Decimal> {
            Decimal::from_str(&doc.arr[i])
                .with_context(|| format!("failed to parse {name}: {}", doc.arr[i]))
        };
        Ok(Self {
            open: d(0, "open")?,
            high: d(1, "high")?,
            low: d(2, "low")?,
            close: d(3, "close")?,
            start_time: doc.start_time,
            end_time: doc.end_time,
            base_volume: d(4, "baseVolume")?,
            quote_volume: d(5, "quoteVolume")?,
            session: doc.time_type,
            adjusted: doc.arr[6] == "1",
        })
    }
}

/// Persisted candle shape: `{startTime, endTime, timeType, arr:[o,h,l,c,bv,qv,adj]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleDocument {
    pub start_time: i64,
    pub end_time: i64,
    pub time_type: SessionType,
    pub arr: [String; 7],
}

/// Encode a candle slice as wire tuples.
pub fn to_wire_list(candles: &[Candle]) -> Vec<Value> {
    candles.iter().map(Candle::to_wire).collect()
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One trade print from the live feed or the replay store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub symbol: String,
    pub event_time: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub is_sell: bool,
    pub session: SessionType,
}

impl Tick {
    /// Parse the live payload `[symbol, eventTimeMs, price, qty, side, sessionType]`.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let arr = value.as_array().context("tick payload is not an array")?;
        if arr.len() != 6 {
            bail!("tick payload has {} fields, expected 6", arr.len());
        }
        Ok(Self {
            symbol: arr[0].as_str().context("tick symbol not a string")?.to_string(),
            event_time: parse_ms(&arr[1], "eventTime")?,
            price: parse_decimal(&arr[2], "price")?,
            quantity: parse_decimal(&arr[3], "qty")?,
            is_sell: arr[4].as_str() == Some("s"),
            session: SessionType::from_code(arr[5].as_str().unwrap_or("n")),
        })
    }

    pub fn to_wire(&self) -> Value {
        json!([
            self.symbol,
            self.event_time,
            self.price.to_string(),
            self.quantity.to_string(),
            if self.is_sell { "s" } else { "b" },
            self.session.code(),
        ])
    }

    pub fn to_document(&self) -> TickDocument {
        TickDocument {
            time: self.event_time,
            time_type: self.session,
            price: self.price.to_string(),
            qty: self.quantity.to_string(),
            position: if self.is_sell { "s" } else { "b" }.to_string(),
        }
    }

    pub fn from_document(symbol: &str, doc: &TickDocument) -> Result<Self> {
        Ok(Self {
            symbol: symbol.to_string(),
            event_time: doc.time,
            price: Decimal::from_str(&doc.price)
                .with_context(|| format!("failed to parse tick price: {}", doc.price))?,
            quantity: Decimal::from_str(&doc.qty)
                .with_context(|| format!("failed to parse tick qty: {}", doc.qty))?,
            is_sell: doc.position == "s",
            session: doc.time_type,
        })
    }
}

/// Persisted tick shape: `{time, timeType, price, qty, position}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickDocument {
    pub time: i64,
    pub time_type: SessionType,
    pub price: String,
    pub qty: String,
    pub position: String,
}

// ---------------------------------------------------------------------------
// Orderbook event
// ---------------------------------------------------------------------------

/// Recorded orderbook snapshot. Level arrays are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookEvent {
    #[serde(skip)]
    pub symbol: String,
    pub bid_all: Value,
    pub ask_all: Value,
    pub bids: Value,
    pub asks: Value,
    #[serde(rename = "time")]
    pub event_time: i64,
    pub time_type: SessionType,
}

impl OrderbookEvent {
    pub fn from_document(symbol: &str, doc: &Value) -> Result<Self> {
        let mut event: Self = serde_json::from_value(doc.clone())
            .context("failed to parse orderbook document")?;
        event.symbol = symbol.to_string();
        Ok(event)
    }

    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Numbers arrive either as JSON strings or JSON numbers.
fn parse_decimal(val: &Value, name: &str) -> Result<Decimal> {
    match val {
        Value::String(s) => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .with_context(|| format!("failed to parse {name} as decimal: {s}")),
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s)
                .or_else(|_| Decimal::from_scientific(&s))
                .with_context(|| format!("field {name} is not a valid decimal: {s}"))
        }
        _ => bail!("field {name} has unexpected JSON type"),
    }
}

fn parse_ms(val: &Value, name: &str) -> Result<i64> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not an integer")),
        Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as integer: {s}")),
        _ => bail!("field {name} has unexpected JSON type"),
    }
}

fn parse_flag(val: &Value) -> bool {
    match val {
        Value::String(s) => s == "1",
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sample() -> Candle {
        Candle {
            open: dec("100.5"),
            high: dec("102"),
            low: dec("99.25"),
            close: dec("101"),
            start_time: 1_686_612_600_000,
            end_time: 1_686_612_659_999,
            base_volume: dec("12.5"),
            quote_volume: dec("1262.5"),
            session: SessionType::PreBid,
            adjusted: true,
        }
    }

    #[test]
    fn wire_roundtrip_preserves_candle() {
        let c = sample();
        let wire = c.to_wire();
        assert_eq!(wire.as_array().unwrap().len(), 10);
        assert_eq!(wire[8], "pb");
        assert_eq!(wire[9], "1");
        assert_eq!(Candle::from_wire(&wire).unwrap(), c);
    }

    #[test]
    fn document_roundtrip_preserves_candle() {
        let c = sample();
        let doc = c.to_document();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["startTime"], 1_686_612_600_000_i64);
        assert_eq!(json["timeType"], "pb");
        let back: CandleDocument = serde_json::from_value(json).unwrap();
        assert_eq!(Candle::from_document(&back).unwrap(), c);
    }

    #[test]
    fn decode_rejects_short_tuple_and_inverted_range() {
        let short = json!(["1", "1", "1", "1", 0, 10]);
        assert!(Candle::from_wire(&short).is_err());

        let inverted = json!(["1", "1", "1", "1", 10, 0, "0", "0", "n", "0"]);
        assert!(Candle::from_wire(&inverted).is_err());
    }

    #[test]
    fn decode_accepts_numeric_fields() {
        let v = json!([10, 12.5, 9, 11, 0, 59_999, 3, 33, "n", 0]);
        let c = Candle::from_wire(&v).unwrap();
        assert_eq!(c.high, dec("12.5"));
        assert!(!c.adjusted);
        assert_eq!(c.session, SessionType::Normal);
    }

    #[test]
    fn tick_payload_parses() {
        let v = json!(["a005930", 1_686_612_600_123_i64, "71000", "15", "s", "n"]);
        let t = Tick::from_wire(&v).unwrap();
        assert_eq!(t.symbol, "a005930");
        assert_eq!(t.price, dec("71000"));
        assert!(t.is_sell);
        assert_eq!(Tick::from_wire(&t.to_wire()).unwrap(), t);
        assert!(Tick::from_wire(&json!(["x", 1])).is_err());
    }

    #[test]
    fn tick_document_roundtrip() {
        let t = Tick {
            symbol: "a000660".into(),
            event_time: 42,
            price: dec("123.45"),
            quantity: dec("2"),
            is_sell: false,
            session: SessionType::ExtendedTrading,
        };
        let doc = t.to_document();
        assert_eq!(Tick::from_document("a000660", &doc).unwrap(), t);
    }

    #[test]
    fn absorb_and_merge() {
        let mut c = sample();
        let other = Candle {
            open: dec("101"),
            high: dec("105"),
            low: dec("100"),
            close: dec("104"),
            start_time: c.end_time + 1,
            end_time: c.end_time + 60_000,
            base_volume: dec("1"),
            quote_volume: dec("104"),
            session: SessionType::PreBid,
            adjusted: false,
        };
        let merged = c.merge(&other);
        assert_eq!(merged.open, dec("100.5"));
        assert_eq!(merged.high, dec("105"));
        assert_eq!(merged.low, dec("99.25"));
        assert_eq!(merged.close, dec("104"));
        assert_eq!(merged.end_time, other.end_time);
        assert_eq!(merged.base_volume, dec("13.5"));

        c.absorb_candle(&other);
        assert_eq!(c.close, dec("104"));
        assert_eq!(c.quote_volume, dec("1366.5"));
    }

    #[test]
    fn orderbook_document_parses() {
        let doc = json!({
            "bidAll": 1200, "askAll": 900,
            "bids": [["100", "3"]], "asks": [["101", "4"]],
            "time": 77, "timeType": "n"
        });
        let ev = OrderbookEvent::from_document("a005930", &doc).unwrap();
        assert_eq!(ev.event_time, 77);
        assert_eq!(ev.symbol, "a005930");
        assert_eq!(ev.to_wire()["time"], 77);
    }
}
