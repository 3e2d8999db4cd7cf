pub mod calendar;
pub mod candle;
pub mod candle_cache;
pub mod grouping;
pub mod tick_stream;
pub mod unit_store;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use calendar::{SessionCalendar, SymbolContext};
pub use candle::{
    to_wire_list, Candle, CandleDocument, OrderbookEvent, Tick, TickDocument, WireFormat,
};
pub use candle_cache::CandleCache;
pub use tick_stream::{TickFeed, WsTickFeed};
pub use unit_store::{FetchMode, UnitCandleStore};
