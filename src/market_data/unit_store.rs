// =============================================================================
// Unit Candle Store — bounded base-granularity buffer for one (symbol, kind)
// =============================================================================
//
// The buffer is an ordered deque with strictly increasing `start_time`; the
// start times double as the search index (`partition_point`).  Updates only
// ever touch the tail.  After every append the front is truncated to the
// kind's `limit_count`.
//
// Mutating methods are synchronous.  When an append supersedes the previous
// tail candle, that candle is handed back to the caller for persistence so no
// lock is ever held across store I/O.
// =============================================================================

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::market_data::calendar::{SessionCalendar, SymbolContext};
use crate::market_data::candle::{Candle, Tick};
use crate::market_data::grouping;
use crate::runtime_config::IntervalLimit;
use crate::store::{CandleRange, CandleRepository};
use crate::types::{IntervalKind, IntervalSpec, SessionType};
use crate::upstream::{GapFill, GapFillQuery};

/// How `fetch` treats the gap-fill tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Keep the in-progress candle and persist completed ones.
    Live,
    /// Drop anything ending after the reference time; persist nothing.
    Historical,
}

/// A unit of input to the decision table.
#[derive(Clone, Copy)]
enum Incoming<'a> {
    Tick(&'a Tick),
    Candle(&'a Candle),
}

impl Incoming<'_> {
    fn time(&self) -> i64 {
        match self {
            Self::Tick(t) => t.event_time,
            Self::Candle(c) => c.start_time,
        }
    }

    fn session(&self) -> SessionType {
        match self {
            Self::Tick(t) => t.session,
            Self::Candle(c) => c.session,
        }
    }

    fn open(&self, start: i64, end: i64) -> Candle {
        match self {
            Self::Tick(t) => Candle::from_tick(t, start, end),
            Self::Candle(c) => Candle::rebased(c, start, end),
        }
    }

    fn fold_into(&self, candle: &mut Candle) {
        match self {
            Self::Tick(t) => candle.absorb_tick(t),
            Self::Candle(c) => candle.absorb_candle(c),
        }
    }
}

pub struct UnitCandleStore {
    symbol: String,
    kind: IntervalKind,
    calendar: SessionCalendar,
    limit: IntervalLimit,
    data: VecDeque<Candle>,
    /// `(end_time, start_time)` of the newest candle known to be persisted.
    last_persisted: Option<(i64, i64)>,
    ready: bool,
}

impl UnitCandleStore {
    pub fn new(ctx: &SymbolContext, kind: IntervalKind, limit: IntervalLimit) -> Self {
        Self {
            symbol: ctx.symbol.clone(),
            kind,
            calendar: ctx.calendar(),
            limit,
            data: VecDeque::new(),
            last_persisted: None,
            ready: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> IntervalKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Accept stream updates without a prior `fetch`.
    #[cfg(test)]
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.data.back()
    }

    pub fn candles(&self) -> impl Iterator<Item = &Candle> {
        self.data.iter()
    }

    /// Retained candles with `start_time >= from`.
    pub fn since(&self, from: i64) -> Vec<Candle> {
        let idx = self.data.partition_point(|c| c.start_time < from);
        self.data.range(idx..).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Population
    // -------------------------------------------------------------------------

    /// Load the lookback window from the store, then request the remaining
    /// gap up to `now` from upstream. Failures are logged; whatever was
    /// loaded is kept. Returns the last retained `end_time`.
    pub async fn fetch(
        &mut self,
        repo: &dyn CandleRepository,
        upstream: &dyn GapFill,
        now: i64,
        mode: FetchMode,
    ) -> Option<i64> {
        let from = self.calendar.days_before(self.limit.days, now);

        match repo
            .load_candles(&self.symbol, self.kind, CandleRange::ending_within(from, now))
            .await
        {
            Ok(stored) => {
                let loaded = stored.len();
                for candle in stored {
                    self.push_if_newer(candle);
                }
                debug!(
                    symbol = %self.symbol,
                    interval = %self.kind,
                    loaded,
                    retained = self.data.len(),
                    "store candles loaded"
                );
            }
            Err(e) => {
                error!(
                    symbol = %self.symbol,
                    interval = %self.kind,
                    error = %e,
                    "store load failed"
                );
            }
        }

        self.last_persisted = self.data.back().map(|c| (c.end_time, c.start_time));
        let gap_start = self.data.back().map_or(from, |c| c.end_time + 1);

        if gap_start <= now {
            match upstream
                .request(
                    &self.symbol,
                    IntervalSpec::new(1, self.kind),
                    GapFillQuery::between(gap_start, now),
                )
                .await
            {
                Ok(fresh) => {
                    for candle in fresh {
                        if mode == FetchMode::Historical && candle.end_time > now {
                            continue;
                        }
                        if self
                            .last_persisted
                            .map_or(false, |(_, start)| candle.start_time <= start)
                        {
                            continue;
                        }
                        if !self.push_if_newer(candle.clone()) {
                            continue;
                        }
                        if mode == FetchMode::Live && candle.end_time < now {
                            match repo.append_candle(&self.symbol, self.kind, &candle).await {
                                Ok(()) => {
                                    self.last_persisted = Some((candle.end_time, candle.start_time))
                                }
                                Err(e) => warn!(
                                    symbol = %self.symbol,
                                    interval = %self.kind,
                                    error = %e,
                                    "failed to persist gap-fill candle"
                                ),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        symbol = %self.symbol,
                        interval = %self.kind,
                        error = %e,
                        "gap-fill request failed"
                    );
                }
            }
        }

        self.evict();
        self.ready = true;
        info!(
            symbol = %self.symbol,
            interval = %self.kind,
            candles = self.data.len(),
            "unit store ready"
        );
        self.data.back().map(|c| c.end_time)
    }

    /// Append pre-built candles with the same dedupe rule as `fetch`.
    #[cfg(test)]
    pub fn seed(&mut self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.push_if_newer(candle);
        }
        self.evict();
    }

    /// Appends `candle` if it follows the current tail: it starts after the
    /// tail ends, or it is a session-flip successor sharing the tail's window.
    fn push_if_newer(&mut self, candle: Candle) -> bool {
        let follows = match self.data.back() {
            None => true,
            Some(last) => {
                candle.start_time > last.end_time
                    || (candle.start_time > last.start_time
                        && candle.end_time == last.end_time
                        && candle.session != last.session)
            }
        };
        if follows {
            self.data.push_back(candle);
        }
        follows
    }

    // -------------------------------------------------------------------------
    // Stream updates
    // -------------------------------------------------------------------------

    /// Apply one trade. Returns a superseded candle that still needs to be
    /// persisted, if any.
    pub fn update_stream_data(&mut self, tick: &Tick) -> Option<Candle> {
        self.apply(Incoming::Tick(tick))
    }

    /// Apply one finer, already aggregated candle.
    pub fn update_candle_data(&mut self, candle: &Candle) -> Option<Candle> {
        self.apply(Incoming::Candle(candle))
    }

    fn apply(&mut self, incoming: Incoming<'_>) -> Option<Candle> {
        if !self.ready {
            debug!(symbol = %self.symbol, interval = %self.kind, "store not ready, update ignored");
            return None;
        }
        if !self.kind.is_intraday() && incoming.session() != SessionType::Normal {
            return None;
        }

        let t = incoming.time();
        let (canonical_start, canonical_end) = self.calendar.unit_range(t, self.kind);

        let new_start = match self.data.back_mut() {
            None => canonical_start,
            Some(last) if t > last.end_time => canonical_start.max(last.start_time + 1),
            Some(last) if t >= last.start_time => {
                if incoming.session() == last.session {
                    incoming.fold_into(last);
                    return None;
                }
                canonical_start.max(last.start_time + 1)
            }
            Some(last) => {
                warn!(
                    symbol = %self.symbol,
                    interval = %self.kind,
                    time = t,
                    tail_start = last.start_time,
                    "out-of-order update dropped"
                );
                return None;
            }
        };

        let superseded = self.data.back().cloned();
        self.data.push_back(incoming.open(new_start, canonical_end));
        self.evict();

        let superseded = superseded?;
        let key = (superseded.end_time, superseded.start_time);
        if self.last_persisted.map_or(true, |p| key > p) {
            self.last_persisted = Some(key);
            Some(superseded)
        } else {
            None
        }
    }

    fn evict(&mut self) {
        let limit = self.limit.count.max(1);
        if self.data.len() > limit {
            let excess = self.data.len() - limit;
            self.data.drain(..excess);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Group the retained buffer into `multiple`-unit candles.
    pub fn get_candle(&self, multiple: u32) -> Vec<Candle> {
        let buffer: Vec<Candle> = self.data.iter().cloned().collect();
        grouping::get_candle(&buffer, self.kind, multiple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;
    use crate::types::MINUTE_MS;
    use crate::upstream::StaticGapFill;
    use rust_decimal::Decimal;

    fn ctx() -> SymbolContext {
        SymbolContext::new("a005930", 0)
    }

    fn limit(count: usize) -> IntervalLimit {
        IntervalLimit { count, days: 7 }
    }

    fn ready_store(kind: IntervalKind, count: usize) -> UnitCandleStore {
        let mut s = UnitCandleStore::new(&ctx(), kind, limit(count));
        s.mark_ready();
        s
    }

    fn tick(t: i64, price: i64, session: SessionType) -> Tick {
        Tick {
            symbol: "a005930".into(),
            event_time: t,
            price: Decimal::from(price),
            quantity: Decimal::ONE,
            is_sell: false,
            session,
        }
    }

    fn minute(i: i64) -> Candle {
        let t = i * MINUTE_MS;
        Candle::from_tick(&tick(t, 100, SessionType::Normal), t, t + MINUTE_MS - 1)
    }

    #[test]
    fn decision_table_walkthrough() {
        let mut s = ready_store(IntervalKind::Minute, 100);

        assert!(s.update_stream_data(&tick(100, 10, SessionType::Normal)).is_none());
        assert_eq!(s.len(), 1);
        let c = s.last().unwrap();
        assert_eq!((c.start_time, c.end_time), (0, MINUTE_MS - 1));
        assert_eq!(c.open, Decimal::from(10));
        assert_eq!(c.close, Decimal::from(10));

        assert!(s.update_stream_data(&tick(150, 12, SessionType::Normal)).is_none());
        let c = s.last().unwrap();
        assert_eq!(c.close, Decimal::from(12));
        assert_eq!(c.high, Decimal::from(12));
        assert_eq!(c.base_volume, Decimal::from(2));
        assert_eq!(s.len(), 1);

        let persisted = s.update_stream_data(&tick(MINUTE_MS, 9, SessionType::Normal));
        assert_eq!(persisted.map(|c| c.start_time), Some(0));
        assert_eq!(s.len(), 2);
        assert_eq!(s.last().unwrap().start_time, MINUTE_MS);

        let flip = MINUTE_MS + 30_000;
        let persisted = s.update_stream_data(&tick(flip, 11, SessionType::PreBid));
        assert_eq!(persisted.map(|c| c.start_time), Some(MINUTE_MS));
        assert_eq!(s.len(), 3);
        let c = s.last().unwrap();
        assert_eq!(c.session, SessionType::PreBid);
        assert_eq!(c.start_time, MINUTE_MS + 1);
        assert!(c.start_time <= flip);
        assert_eq!(c.end_time, 2 * MINUTE_MS - 1);
    }

    #[test]
    fn out_of_order_tick_is_dropped() {
        let mut s = ready_store(IntervalKind::Minute, 100);
        s.update_stream_data(&tick(5 * MINUTE_MS, 10, SessionType::Normal));
        let before = s.last().cloned();
        assert!(s.update_stream_data(&tick(MINUTE_MS, 99, SessionType::Normal)).is_none());
        assert_eq!(s.last().cloned(), before);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn non_normal_sessions_only_reach_intraday_stores() {
        let mut day = ready_store(IntervalKind::Day, 10);
        day.update_stream_data(&tick(1000, 10, SessionType::PreBid));
        assert!(day.is_empty());
        day.update_stream_data(&tick(1000, 10, SessionType::Normal));
        assert_eq!(day.len(), 1);

        let mut hour = ready_store(IntervalKind::Hour, 10);
        hour.update_stream_data(&tick(1000, 10, SessionType::ExtendedTrading));
        assert_eq!(hour.len(), 1);
    }

    #[test]
    fn ticks_before_ready_are_ignored() {
        let mut s = UnitCandleStore::new(&ctx(), IntervalKind::Minute, limit(10));
        s.update_stream_data(&tick(0, 10, SessionType::Normal));
        assert!(s.is_empty());
    }

    #[test]
    fn eviction_bound_and_monotonic_starts() {
        let mut s = ready_store(IntervalKind::Minute, 5);
        let sessions = [SessionType::Normal, SessionType::PreBid];
        for i in 0..40 {
            s.update_stream_data(&tick(i * 20_000, 10, sessions[(i / 3) as usize % 2]));
            assert!(s.len() <= 5);
        }
        let starts: Vec<i64> = s.candles().map(|c| c.start_time).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn candle_updates_fold_full_ohlcv() {
        let mut hour = ready_store(IntervalKind::Hour, 10);
        let mut m0 = minute(0);
        m0.high = Decimal::from(120);
        let mut m1 = minute(1);
        m1.low = Decimal::from(80);
        m1.close = Decimal::from(90);
        hour.update_candle_data(&m0);
        hour.update_candle_data(&m1);
        assert_eq!(hour.len(), 1);
        let c = hour.last().unwrap();
        assert_eq!(c.end_time, 3_600_000 - 1);
        assert_eq!(c.high, Decimal::from(120));
        assert_eq!(c.low, Decimal::from(80));
        assert_eq!(c.close, Decimal::from(90));
        assert_eq!(c.base_volume, Decimal::from(2));
    }

    #[test]
    fn superseded_candle_is_persisted_once() {
        let mut s = ready_store(IntervalKind::Minute, 10);
        s.seed([minute(0), minute(1)]);
        s.last_persisted = Some((2 * MINUTE_MS - 1, MINUTE_MS));
        // Tail already persisted: superseding it must not persist again.
        assert!(s.update_stream_data(&tick(2 * MINUTE_MS, 1, SessionType::Normal)).is_none());
        assert!(s.update_stream_data(&tick(3 * MINUTE_MS, 1, SessionType::Normal)).is_some());
    }

    #[test]
    fn get_candle_groups_buffer() {
        let mut s = ready_store(IntervalKind::Minute, 100);
        s.seed((0..10).map(minute));
        assert_eq!(s.get_candle(5).len(), 2);
        assert_eq!(s.get_candle(1).len(), 10);
        assert_eq!(s.since(8 * MINUTE_MS).len(), 2);
    }

    #[tokio::test]
    async fn fetch_merges_store_and_gap_fill() {
        let repo = MemoryRepository::new();
        for i in 0..3 {
            repo.append_candle("a005930", IntervalKind::Minute, &minute(i)).await.unwrap();
        }
        // Upstream overlaps the stored tail and includes an in-progress candle.
        let upstream = StaticGapFill::new((1..6).map(minute).collect());
        let now = 5 * MINUTE_MS + 10;

        let mut s = UnitCandleStore::new(&ctx(), IntervalKind::Minute, limit(100));
        let last = s.fetch(&repo, &upstream, now, FetchMode::Live).await;

        assert!(s.is_ready());
        assert_eq!(last, Some(6 * MINUTE_MS - 1));
        assert_eq!(s.len(), 6);
        let calls = upstream.calls.lock().clone();
        assert_eq!(calls[0].start_time, Some(3 * MINUTE_MS));
        // Minutes 3 and 4 are complete and get persisted, minute 5 is not.
        assert_eq!(repo.candle_count("a005930", IntervalKind::Minute), 5);
    }

    #[tokio::test]
    async fn fetch_survives_unavailable_collaborators() {
        let repo = MemoryRepository::new();
        repo.set_unavailable(true);
        let upstream = StaticGapFill::failing();
        let mut s = UnitCandleStore::new(&ctx(), IntervalKind::Minute, limit(100));
        assert_eq!(s.fetch(&repo, &upstream, MINUTE_MS, FetchMode::Live).await, None);
        assert!(s.is_ready());
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn historical_fetch_drops_unfinished_candles() {
        let repo = MemoryRepository::new();
        let upstream = StaticGapFill::new((0..4).map(minute).collect());
        let mut s = UnitCandleStore::new(&ctx(), IntervalKind::Minute, limit(100));
        let cursor = 2 * MINUTE_MS + 5;
        s.fetch(&repo, &upstream, cursor, FetchMode::Historical).await;
        assert_eq!(s.len(), 2);
        assert_eq!(repo.candle_count("a005930", IntervalKind::Minute), 0);
    }
}
