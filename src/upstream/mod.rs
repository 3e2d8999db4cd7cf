// =============================================================================
// Upstream gap-fill — historical candle queries against the venue gateway
// =============================================================================
//
// Stores call this to fetch the delta between their last persisted record and
// the present.  An empty array is a valid "no data" answer.
// =============================================================================

pub mod client;

use anyhow::Result;
use async_trait::async_trait;

use crate::market_data::Candle;
use crate::types::IntervalSpec;

pub use client::RestGapFill;

/// Optional bounds of a gap-fill request (epoch ms, inclusive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapFillQuery {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub count: Option<u32>,
}

impl GapFillQuery {
    pub fn between(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            count: None,
        }
    }
}

#[async_trait]
pub trait GapFill: Send + Sync {
    async fn request(
        &self,
        symbol: &str,
        spec: IntervalSpec,
        query: GapFillQuery,
    ) -> Result<Vec<Candle>>;
}

/// Used when no upstream is configured: every request answers "no data".
pub struct NoGapFill;

#[async_trait]
impl GapFill for NoGapFill {
    async fn request(&self, _: &str, _: IntervalSpec, _: GapFillQuery) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Serves a fixed candle list filtered by start time, or fails on demand.
#[cfg(test)]
pub struct StaticGapFill {
    pub candles: Vec<Candle>,
    pub fail: bool,
    pub calls: parking_lot::Mutex<Vec<GapFillQuery>>,
}

#[cfg(test)]
impl StaticGapFill {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            fail: false,
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl GapFill for StaticGapFill {
    async fn request(&self, _: &str, _: IntervalSpec, query: GapFillQuery) -> Result<Vec<Candle>> {
        self.calls.lock().push(query);
        if self.fail {
            anyhow::bail!("upstream unreachable");
        }
        Ok(self
            .candles
            .iter()
            .filter(|c| query.start_time.map_or(true, |s| c.start_time >= s))
            .filter(|c| query.end_time.map_or(true, |e| c.start_time <= e))
            .cloned()
            .collect())
    }
}
