// =============================================================================
// Symbol Aggregator — one symbol's candle state inside a backtest
// =============================================================================
//
// Holds the native series of the timeline's frame plus lazily built derived
// stores for other base kinds.  Derived stores are seeded from persisted
// history up to the cursor, caught up from the materialised native series,
// and then receive every further push.
// =============================================================================

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::backtest::time_frame::{NativeSeries, TimeFrame};
use crate::market_data::{Candle, FetchMode, SymbolContext, Tick, UnitCandleStore};
use crate::runtime_config::LimitTable;
use crate::store::{CandleRange, CandleRepository};
use crate::types::{IntervalKind, IntervalSpec};
use crate::upstream::{GapFill, GapFillQuery};

pub struct SymbolAggregator {
    ctx: SymbolContext,
    frame: TimeFrame,
    limits: LimitTable,
    native: NativeSeries,
    derived: BTreeMap<IntervalKind, UnitCandleStore>,
}

impl SymbolAggregator {
    /// Load the native series for a replay of `[start_time, end_time]`.
    pub async fn load(
        ctx: SymbolContext,
        frame: TimeFrame,
        start_time: i64,
        end_time: i64,
        limits: LimitTable,
        repo: &dyn CandleRepository,
        upstream: &dyn GapFill,
    ) -> Self {
        let native = match frame {
            TimeFrame::Realtime => {
                let limit = limits.get(IntervalKind::Minute);
                let mut store = UnitCandleStore::new(&ctx, IntervalKind::Minute, limit);
                store
                    .fetch(repo, upstream, start_time - 1, FetchMode::Historical)
                    .await;
                NativeSeries::Realtime(store)
            }
            TimeFrame::Candle(kind) => {
                let data =
                    load_candle_series(&ctx, kind, start_time, end_time, &limits, repo, upstream)
                        .await;
                // History before the replay start is visible immediately.
                let next_index = data.partition_point(|c| c.start_time < start_time);
                NativeSeries::Candles { data, next_index }
            }
        };

        Self {
            ctx,
            frame,
            limits,
            native,
            derived: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.ctx.symbol
    }

    pub fn context(&self) -> &SymbolContext {
        &self.ctx
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    pub fn native(&self) -> &NativeSeries {
        &self.native
    }

    #[cfg(test)]
    pub fn has_derived(&self, kind: IntervalKind) -> bool {
        self.derived.contains_key(&kind)
    }

    /// Apply a replayed trade. Only the realtime frame builds candles from
    /// ticks; candle frames advance through `set_time`.
    pub fn on_tick(&mut self, tick: &Tick) {
        if let NativeSeries::Realtime(store) = &mut self.native {
            store.update_stream_data(tick);
            for derived in self.derived.values_mut() {
                derived.update_stream_data(tick);
            }
        }
    }

    /// Materialise native candles starting at or before `ms` and push them
    /// into coarser derived stores. Returns the newly materialised candles.
    pub fn set_time(&mut self, ms: i64) -> Vec<Candle> {
        let fresh = self.native.next(ms);
        let native_kind = self.frame.kind();
        for candle in &fresh {
            let coarser = self.derived.range_mut(native_kind..).filter(|(k, _)| **k > native_kind);
            for (_, store) in coarser {
                store.update_candle_data(candle);
            }
        }
        fresh
    }

    /// Latest native candle, if any has been built or materialised.
    pub fn last_native(&self) -> Option<Candle> {
        match &self.native {
            NativeSeries::Realtime(store) => store.last().cloned(),
            NativeSeries::Candles { data, next_index } => {
                next_index.checked_sub(1).map(|i| data[i].clone())
            }
        }
    }

    /// Candles of `spec` from the native series or an existing derived
    /// store. `None` means a derived store must be built first.
    pub fn query(&self, spec: IntervalSpec) -> Option<Vec<Candle>> {
        if spec.kind == self.frame.kind() {
            return Some(self.native.grouped(spec.kind, spec.multiple));
        }
        self.derived.get(&spec.kind).map(|s| s.get_candle(spec.multiple))
    }

    /// Install a derived store fetched up to `cursor`, catching it up from
    /// the materialised native series beyond its persisted tail.
    pub fn install_derived(&mut self, mut store: UnitCandleStore) {
        let kind = store.kind();
        if self.derived.contains_key(&kind) {
            return;
        }
        if kind > self.frame.kind() {
            let tail = store.last().map_or(i64::MIN, |c| c.end_time);
            let catch_up = self.native.get_data_until_now(tail);
            debug!(
                symbol = %self.ctx.symbol,
                interval = %kind,
                candles = catch_up.len(),
                "catching up derived store"
            );
            for candle in &catch_up {
                store.update_candle_data(candle);
            }
        }
        self.derived.insert(kind, store);
    }
}

/// Build an empty derived store for `kind` and fetch its history up to
/// `cursor`. Runs outside any lock.
pub async fn fetch_derived(
    ctx: &SymbolContext,
    kind: IntervalKind,
    limits: &LimitTable,
    cursor: i64,
    repo: &dyn CandleRepository,
    upstream: &dyn GapFill,
) -> UnitCandleStore {
    let mut store = UnitCandleStore::new(ctx, kind, limits.get(kind));
    store.fetch(repo, upstream, cursor, FetchMode::Historical).await;
    store
}

/// Persisted candles overlapping `[start − lookback, end]` plus a gap-fill
/// for any tail the store does not have yet.
async fn load_candle_series(
    ctx: &SymbolContext,
    kind: IntervalKind,
    start_time: i64,
    end_time: i64,
    limits: &LimitTable,
    repo: &dyn CandleRepository,
    upstream: &dyn GapFill,
) -> Vec<Candle> {
    let from = ctx.calendar().days_before(limits.limit_days(kind), start_time);
    let range = CandleRange {
        end_from: Some(from),
        start_to: Some(end_time),
        ..CandleRange::default()
    };

    let mut data: Vec<Candle> = Vec::new();
    match repo.load_candles(&ctx.symbol, kind, range).await {
        Ok(stored) => {
            for candle in stored {
                append_following(&mut data, candle);
            }
        }
        Err(e) => {
            warn!(symbol = %ctx.symbol, interval = %kind, error = %e, "backtest store load failed")
        }
    }

    let gap_start = data.last().map_or(from, |c| c.end_time + 1);
    if gap_start <= end_time {
        match upstream
            .request(
                &ctx.symbol,
                IntervalSpec::new(1, kind),
                GapFillQuery::between(gap_start, end_time),
            )
            .await
        {
            Ok(fresh) => {
                for candle in fresh {
                    append_following(&mut data, candle);
                }
            }
            Err(e) => {
                warn!(
                    symbol = %ctx.symbol,
                    interval = %kind,
                    error = %e,
                    "backtest gap-fill failed"
                )
            }
        }
    }
    data
}

fn append_following(data: &mut Vec<Candle>, candle: Candle) {
    if data.last().map_or(true, |last| candle.start_time > last.end_time) {
        data.push(candle);
    }
}
