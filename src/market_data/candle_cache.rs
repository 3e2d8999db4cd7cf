// =============================================================================
// Candle Cache — one UnitCandleStore per base interval for a symbol
// =============================================================================
//
// Every live tick is fanned out to all stores; each applies its own session
// and boundary rules.  Interval queries parse `<multiple><kind>` and group the
// matching store.  A venue without a native hourly series gets `h` derived
// from the minute store.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::market_data::calendar::SymbolContext;
use crate::market_data::candle::{Candle, Tick};
use crate::market_data::tick_stream::TickFeed;
use crate::market_data::unit_store::{FetchMode, UnitCandleStore};
use crate::runtime_config::LimitTable;
use crate::store::CandleRepository;
use crate::types::{IntervalKind, IntervalSpec};
use crate::upstream::GapFill;

pub struct CandleCache {
    ctx: SymbolContext,
    stores: BTreeMap<IntervalKind, UnitCandleStore>,
}

impl CandleCache {
    pub fn new(ctx: SymbolContext, limits: &LimitTable) -> Self {
        let stores = ctx
            .intervals
            .iter()
            .map(|&kind| (kind, UnitCandleStore::new(&ctx, kind, limits.get(kind))))
            .collect();
        Self { ctx, stores }
    }

    pub fn symbol(&self) -> &str {
        &self.ctx.symbol
    }

    pub fn context(&self) -> &SymbolContext {
        &self.ctx
    }

    pub fn store(&self, kind: IntervalKind) -> Option<&UnitCandleStore> {
        self.stores.get(&kind)
    }

    pub fn is_ready(&self) -> bool {
        self.stores.values().all(UnitCandleStore::is_ready)
    }

    /// Populate every store in turn.
    pub async fn fetch_all(
        &mut self,
        repo: &dyn CandleRepository,
        upstream: &dyn GapFill,
        now: i64,
        mode: FetchMode,
    ) {
        for store in self.stores.values_mut() {
            store.fetch(repo, upstream, now, mode).await;
        }
    }

    /// Fan a tick out to every store. Returns superseded candles that still
    /// need persisting.
    pub fn update(&mut self, tick: &Tick) -> Vec<(IntervalKind, Candle)> {
        self.stores
            .iter_mut()
            .filter_map(|(&kind, store)| store.update_stream_data(tick).map(|c| (kind, c)))
            .collect()
    }

    /// Candles for a textual interval spec; unknown specs yield nothing.
    pub fn get_data(&self, spec: &str) -> Vec<Candle> {
        match IntervalSpec::parse(spec) {
            Some(spec) => self.get_spec(spec),
            None => {
                debug!(symbol = %self.ctx.symbol, spec, "unknown interval spec");
                Vec::new()
            }
        }
    }

    pub fn get_spec(&self, spec: IntervalSpec) -> Vec<Candle> {
        if let Some(store) = self.stores.get(&spec.kind) {
            return store.get_candle(spec.multiple);
        }
        if spec.kind == IntervalKind::Hour {
            if let Some(minutes) = self.stores.get(&IntervalKind::Minute) {
                return minutes.get_candle(spec.multiple.saturating_mul(60));
            }
        }
        Vec::new()
    }
}

/// Fetch all stores, then apply the live tick feed until it closes.
///
/// The fetch runs on a private cache that replaces the shared one when done,
/// so readers see either the previous state or a fully loaded one.  Ticks are
/// recorded for later replay; superseded candles are persisted after the
/// in-memory update.
pub async fn run(
    shared: Arc<RwLock<CandleCache>>,
    repo: Arc<dyn CandleRepository>,
    upstream: Arc<dyn GapFill>,
    feed: Arc<dyn TickFeed>,
    limits: LimitTable,
) {
    let ctx = shared.read().context().clone();
    let symbol = ctx.symbol.clone();

    let mut fresh = CandleCache::new(ctx, &limits);
    let now = chrono::Utc::now().timestamp_millis();
    fresh
        .fetch_all(repo.as_ref(), upstream.as_ref(), now, FetchMode::Live)
        .await;
    *shared.write() = fresh;
    info!(symbol = %symbol, "candle cache loaded");

    let mut ticks = match feed.subscribe(&symbol).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "tick subscription failed");
            return;
        }
    };

    while let Some(tick) = ticks.recv().await {
        let to_persist = shared.write().update(&tick);

        if let Err(e) = repo.append_tick(&tick).await {
            warn!(symbol = %symbol, error = %e, "failed to record tick");
        }
        for (kind, candle) in to_persist {
            if let Err(e) = repo.append_candle(&symbol, kind, &candle).await {
                warn!(symbol = %symbol, interval = %kind, error = %e, "failed to persist candle");
            }
        }
    }
    info!(symbol = %symbol, "tick feed closed");
}
