// =============================================================================
// Backtest Timeline — paced, pausable replay of persisted market events
// =============================================================================
//
// States: Stopped -> Playing <-> Paused, and Playing/Paused -> Finished.
// Control calls only request a transition on a watch channel; the replay loop
// applies it before the next emission or at the next batch boundary.
//
// The replay loop walks fixed windows of simulated time.  While one window is
// drained (with pacing sleeps) the next one is fetched concurrently, so at
// most one batch of lookahead is held in memory.  A Finished timeline never
// plays again; a new one must be created.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backtest::aggregator::{fetch_derived, SymbolAggregator};
use crate::backtest::events::{fetch_window, ReplayEvent, StreamMessage};
use crate::backtest::time_frame::TimeFrame;
use crate::market_data::{Candle, SymbolContext};
use crate::runtime_config::{LimitTable, ReplayConfig};
use crate::store::CandleRepository;
use crate::types::IntervalSpec;
use crate::upstream::GapFill;

/// Buffered stream messages per subscriber before it starts lagging.
const STREAM_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    Stopped,
    Playing,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRequest {
    pub targets: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub time_frame: TimeFrame,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStatus {
    pub id: Uuid,
    pub state: ReplayState,
    pub speed: f64,
    pub cursor: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub targets: Vec<String>,
    pub time_frame: TimeFrame,
}

/// Result of waiting on the control state before an emission.
enum Gate {
    Ready,
    Resumed,
    Halt,
}

pub struct BacktestTimeline {
    id: Uuid,
    targets: Vec<String>,
    start_time: i64,
    end_time: i64,
    frame: TimeFrame,
    replay: ReplayConfig,
    repo: Arc<dyn CandleRepository>,
    upstream: Arc<dyn GapFill>,
    aggregators: Mutex<BTreeMap<String, SymbolAggregator>>,
    /// Everything before this simulated time has been emitted.
    cursor: AtomicI64,
    speed: RwLock<f64>,
    state: watch::Sender<ReplayState>,
    task: Mutex<Option<JoinHandle<()>>>,
    stream: broadcast::Sender<StreamMessage>,
}

impl BacktestTimeline {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Build a timeline and load one aggregator per target.
    pub async fn create(
        request: &BacktestRequest,
        resolve: impl Fn(&str) -> SymbolContext,
        limits: &LimitTable,
        replay: ReplayConfig,
        repo: Arc<dyn CandleRepository>,
        upstream: Arc<dyn GapFill>,
    ) -> Result<Arc<Self>> {
        if request.targets.is_empty() {
            bail!("backtest needs at least one target");
        }
        if request.start_time > request.end_time {
            bail!(
                "backtest startTime {} is after endTime {}",
                request.start_time,
                request.end_time
            );
        }

        let contexts: Vec<SymbolContext> =
            request.targets.iter().map(|t| resolve(t.as_str())).collect();
        let loaded = join_all(contexts.into_iter().map(|ctx| {
            SymbolAggregator::load(
                ctx,
                request.time_frame,
                request.start_time,
                request.end_time,
                limits.clone(),
                repo.as_ref(),
                upstream.as_ref(),
            )
        }))
        .await;

        let aggregators: BTreeMap<String, SymbolAggregator> = loaded
            .into_iter()
            .map(|agg| (agg.symbol().to_string(), agg))
            .collect();

        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        let (state, _) = watch::channel(ReplayState::Stopped);
        let replay = replay.sanitized();
        let speed = replay.default_speed;

        let timeline = Arc::new(Self {
            id: Uuid::new_v4(),
            targets: request.targets.clone(),
            start_time: request.start_time,
            end_time: request.end_time,
            frame: request.time_frame,
            replay,
            repo,
            upstream,
            aggregators: Mutex::new(aggregators),
            cursor: AtomicI64::new(request.start_time),
            speed: RwLock::new(speed),
            state,
            task: Mutex::new(None),
            stream,
        });

        info!(
            id = %timeline.id,
            targets = ?timeline.targets,
            start = timeline.start_time,
            end = timeline.end_time,
            frame = %timeline.frame,
            "backtest created"
        );
        Ok(timeline)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ReplayState {
        *self.state.borrow()
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.stream.subscribe()
    }

    pub fn status(&self) -> TimelineStatus {
        TimelineStatus {
            id: self.id,
            state: self.state(),
            speed: *self.speed.read(),
            cursor: self.cursor(),
            start_time: self.start_time,
            end_time: self.end_time,
            targets: self.targets.clone(),
            time_frame: self.frame,
        }
    }

    /// Apply `next` to the current state atomically; returns the prior state.
    fn transition(&self, next: impl FnOnce(ReplayState) -> Option<ReplayState>) -> ReplayState {
        let mut before = ReplayState::Stopped;
        self.state.send_if_modified(|s| {
            before = *s;
            match next(*s) {
                Some(n) if n != *s => {
                    *s = n;
                    true
                }
                _ => false,
            }
        });
        before
    }

    // -------------------------------------------------------------------------
    // Controls
    // -------------------------------------------------------------------------

    /// Start the replay loop, or resume a paused one.
    pub fn play(self: &Arc<Self>) -> Result<ReplayState> {
        let before = self.transition(|s| match s {
            ReplayState::Stopped | ReplayState::Paused => Some(ReplayState::Playing),
            _ => None,
        });
        match before {
            ReplayState::Finished => bail!("backtest {} has finished; create a new one", self.id),
            ReplayState::Stopped => {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.run_replay().await });
                *self.task.lock() = Some(handle);
                info!(id = %self.id, cursor = self.cursor(), "backtest replay started");
            }
            ReplayState::Paused => info!(id = %self.id, "backtest resumed"),
            ReplayState::Playing => {}
        }
        Ok(self.state())
    }

    pub fn pause(&self) -> ReplayState {
        if self.transition(|s| (s == ReplayState::Playing).then_some(ReplayState::Paused))
            == ReplayState::Playing
        {
            info!(id = %self.id, "backtest pause requested");
        }
        self.state()
    }

    /// Abort the replay loop for good. Materialised data stays queryable.
    pub fn stop(&self) {
        self.transition(|_| Some(ReplayState::Finished));
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Stop and release all aggregator state.
    pub fn finish(&self) {
        self.stop();
        self.aggregators.lock().clear();
        info!(id = %self.id, "backtest finished");
    }

    /// Affects pacing waits computed after this call only.
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            bail!("speed must be a positive number, got {speed}");
        }
        *self.speed.write() = speed;
        debug!(id = %self.id, speed, "backtest speed changed");
        Ok(())
    }

    /// Advance without pacing up to `current_time`, one frame step at a time.
    /// Only allowed while no replay loop is active. Returns the number of
    /// published messages.
    pub async fn next(&self, current_time: i64) -> Result<usize> {
        match self.state() {
            ReplayState::Stopped => {}
            ReplayState::Finished => bail!("backtest {} has finished; create a new one", self.id),
            s => bail!("cannot step while the replay loop is {s:?}"),
        }

        let limit = current_time.min(self.end_time);
        let mut cursor = self.cursor();
        let mut published = 0;

        match self.frame {
            TimeFrame::Candle(_) => {
                let step = self.frame.step_ms();
                while cursor <= limit {
                    let messages: Vec<StreamMessage> = {
                        let mut aggs = self.aggregators.lock();
                        aggs.iter_mut()
                            .flat_map(|(symbol, agg)| {
                                agg.set_time(cursor)
                                    .into_iter()
                                    .map(|c| StreamMessage::candle(symbol, &c))
                                    .collect::<Vec<_>>()
                            })
                            .collect()
                    };
                    published += self.publish(messages);
                    cursor += step;
                }
                self.cursor.store(cursor, Ordering::SeqCst);
            }
            TimeFrame::Realtime => {
                if cursor <= limit {
                    // Same bounded windows as the replay loop.
                    let window = self.replay.window_ms.max(1);
                    while cursor <= limit {
                        let to = cursor.saturating_add(window - 1).min(limit);
                        let events =
                            fetch_window(self.repo.as_ref(), &self.targets, cursor, to).await;
                        for event in &events {
                            published += self.apply(event);
                        }
                        if to == limit {
                            break;
                        }
                        cursor = to + 1;
                    }
                    let latest: Vec<StreamMessage> = self
                        .aggregators
                        .lock()
                        .values()
                        .filter_map(|agg| {
                            agg.last_native()
                                .map(|c| StreamMessage::candle(agg.symbol(), &c))
                        })
                        .collect();
                    published += self.publish(latest);
                    self.cursor.store(limit + 1, Ordering::SeqCst);
                }
            }
        }

        debug!(id = %self.id, cursor = self.cursor(), published, "backtest stepped");
        Ok(published)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Candles of `symbol` at `spec` as of the cursor. A base kind other than
    /// the frame's is built on first use and kept up to date afterwards.
    pub async fn get_data(&self, symbol: &str, spec: &str) -> Vec<Candle> {
        let Some(spec) = IntervalSpec::parse(spec) else {
            return Vec::new();
        };

        let (ctx, limits) = {
            let aggs = self.aggregators.lock();
            let Some(agg) = aggs.get(symbol) else {
                return Vec::new();
            };
            if let Some(candles) = agg.query(spec) {
                return candles;
            }
            (agg.context().clone(), agg.limits().clone())
        };

        let until = self.cursor() - 1;
        let store = fetch_derived(
            &ctx,
            spec.kind,
            &limits,
            until,
            self.repo.as_ref(),
            self.upstream.as_ref(),
        )
        .await;

        let mut aggs = self.aggregators.lock();
        match aggs.get_mut(symbol) {
            Some(agg) => {
                agg.install_derived(store);
                agg.query(spec).unwrap_or_default()
            }
            None => Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Replay loop
    // -------------------------------------------------------------------------

    async fn run_replay(self: Arc<Self>) {
        let window = self.replay.window_ms.max(1);
        let mut from = self.cursor();
        let mut anchor: Option<(Instant, i64)> = None;
        let mut batch = self.fetch_batch(from).await;

        loop {
            let next_from = from + window;
            let prefetch = async {
                if next_from <= self.end_time {
                    Some(self.fetch_batch(next_from).await)
                } else {
                    None
                }
            };

            let (next, completed) = tokio::join!(prefetch, self.drain(batch, &mut anchor));
            if !completed {
                debug!(id = %self.id, "replay loop halted");
                return;
            }
            match next {
                Some(b) => {
                    batch = b;
                    from = next_from;
                }
                None => break,
            }
        }

        self.cursor.store(self.end_time + 1, Ordering::SeqCst);
        self.transition(|_| Some(ReplayState::Finished));
        info!(id = %self.id, "backtest replay complete");
    }

    async fn fetch_batch(&self, from: i64) -> Vec<ReplayEvent> {
        let to = (from + self.replay.window_ms - 1).min(self.end_time);
        fetch_window(self.repo.as_ref(), &self.targets, from, to).await
    }

    /// Emit one batch with pacing. Returns false if the loop must stop.
    async fn drain(&self, batch: Vec<ReplayEvent>, anchor: &mut Option<(Instant, i64)>) -> bool {
        for event in batch {
            match self.wait_until_playing().await {
                Gate::Halt => return false,
                Gate::Resumed => *anchor = None,
                Gate::Ready => {}
            }

            if let Some((wall, event_anchor)) = *anchor {
                let speed = *self.speed.read();
                let gap_ms = (event.time() - event_anchor).max(0) as f64 / speed;
                let target = Duration::from_secs_f64(gap_ms / 1000.0);
                let elapsed = wall.elapsed();
                if target > elapsed {
                    tokio::time::sleep(target - elapsed).await;
                }
                if let Gate::Halt = self.wait_until_playing().await {
                    return false;
                }
            }

            self.apply(&event);
            *anchor = Some((Instant::now(), event.time()));
        }
        true
    }

    /// Block while paused, waking on state changes or every poll interval.
    async fn wait_until_playing(&self) -> Gate {
        let mut rx = self.state.subscribe();
        let poll = Duration::from_millis(self.replay.pause_poll_ms.max(1));
        let mut paused = false;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ReplayState::Playing => {
                    return if paused { Gate::Resumed } else { Gate::Ready };
                }
                ReplayState::Paused => paused = true,
                ReplayState::Stopped | ReplayState::Finished => return Gate::Halt,
            }
            let _ = tokio::time::timeout(poll, rx.changed()).await;
        }
    }

    /// Feed one event to the aggregators and publish it. Returns the number
    /// of published messages.
    fn apply(&self, event: &ReplayEvent) -> usize {
        let mut messages = vec![StreamMessage::from_event(event)];
        {
            let mut aggs = self.aggregators.lock();
            if let ReplayEvent::Price(tick) = event {
                match aggs.get_mut(&tick.symbol) {
                    Some(agg) => agg.on_tick(tick),
                    None => warn!(symbol = %tick.symbol, "tick for unknown backtest target"),
                }
            }
            if let TimeFrame::Candle(_) = self.frame {
                for (symbol, agg) in aggs.iter_mut() {
                    for candle in agg.set_time(event.time()) {
                        messages.push(StreamMessage::candle(symbol, &candle));
                    }
                }
            }
        }
        self.cursor.store(event.time() + 1, Ordering::SeqCst);
        self.publish(messages)
    }

    fn publish(&self, messages: Vec<StreamMessage>) -> usize {
        let count = messages.len();
        for msg in messages {
            // No subscribers is not an error.
            let _ = self.stream.send(msg);
        }
        count
    }
}
