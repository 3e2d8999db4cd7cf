// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Live candle queries read the per-symbol
// caches; `/backtest/*` drives the single backtest timeline.  Candle payloads
// are CandleTuple arrays.
//
// CORS is configured permissively; the surface carries no authentication.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::backtest::{BacktestRequest, BacktestTimeline, TimelineStatus};
use crate::market_data::to_wire_list;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Live ────────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/candle", get(live_candle))
        // ── Backtest ────────────────────────────────────────────────
        .route("/api/v1/backtest", post(create_backtest))
        .route("/api/v1/backtest/play", post(backtest_play))
        .route("/api/v1/backtest/pause", post(backtest_pause))
        .route("/api/v1/backtest/finish", post(backtest_finish))
        .route("/api/v1/backtest/speed", post(backtest_speed))
        .route("/api/v1/backtest/next", post(backtest_next))
        .route("/api/v1/backtest/candle", get(backtest_candle))
        .route("/api/v1/backtest/status", get(backtest_status))
        // ── WebSocket (handled in the ws module but mounted here) ───
        .route("/api/v1/backtest/stream", get(crate::api::ws::stream_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Live candles
// =============================================================================

#[derive(Debug, Deserialize)]
struct CandleQuery {
    symbol: String,
    interval: String,
}

async fn live_candle(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match state.live_candles(&query.symbol, &query.interval) {
        Some(candles) => Ok(Json(to_wire_list(&candles))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no live cache for symbol {}", query.symbol),
        )),
    }
}

// =============================================================================
// Backtest control
// =============================================================================

fn current_backtest(state: &AppState) -> Result<Arc<BacktestTimeline>, ApiError> {
    state
        .backtest()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no backtest has been created"))
}

async fn create_backtest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BacktestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let timeline = state
        .create_backtest(&request)
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(timeline.status())))
}

async fn backtest_play(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TimelineStatus>, ApiError> {
    let timeline = current_backtest(&state)?;
    timeline.play().map_err(|e| {
        warn!(error = %e, "backtest play rejected");
        api_error(StatusCode::CONFLICT, e.to_string())
    })?;
    state.increment_version();
    Ok(Json(timeline.status()))
}

async fn backtest_pause(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TimelineStatus>, ApiError> {
    let timeline = current_backtest(&state)?;
    timeline.pause();
    state.increment_version();
    Ok(Json(timeline.status()))
}

async fn backtest_finish(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.finish_backtest() {
        return Err(api_error(StatusCode::NOT_FOUND, "no backtest has been created"));
    }
    info!("backtest finished via API");
    Ok(Json(json!({ "finished": true })))
}

#[derive(Debug, Deserialize)]
struct SpeedRequest {
    speed: f64,
}

async fn backtest_speed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SpeedRequest>,
) -> Result<Json<TimelineStatus>, ApiError> {
    let timeline = current_backtest(&state)?;
    timeline
        .set_speed(req.speed)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    state.increment_version();
    Ok(Json(timeline.status()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextRequest {
    current_time: i64,
}

#[derive(Serialize)]
struct NextResponse {
    published: usize,
    status: TimelineStatus,
}

async fn backtest_next(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NextRequest>,
) -> Result<Json<NextResponse>, ApiError> {
    let timeline = current_backtest(&state)?;
    let published = timeline
        .next(req.current_time)
        .await
        .map_err(|e| api_error(StatusCode::CONFLICT, e.to_string()))?;
    state.increment_version();
    Ok(Json(NextResponse {
        published,
        status: timeline.status(),
    }))
}

// =============================================================================
// Backtest queries
// =============================================================================

async fn backtest_candle(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let timeline = current_backtest(&state)?;
    let candles = timeline.get_data(&query.symbol, &query.interval).await;
    Ok(Json(to_wire_list(&candles)))
}

async fn backtest_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TimelineStatus>, ApiError> {
    Ok(Json(current_backtest(&state)?.status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    use crate::market_data::{Candle, SymbolContext, Tick};
    use crate::runtime_config::EngineConfig;
    use crate::store::{CandleRepository, MemoryRepository};
    use crate::types::{IntervalKind, SessionType, MINUTE_MS};
    use crate::upstream::NoGapFill;

    fn minute(i: i64) -> Candle {
        let tick = Tick {
            symbol: "a005930".into(),
            event_time: i * MINUTE_MS,
            price: Decimal::from(10),
            quantity: Decimal::ONE,
            is_sell: false,
            session: SessionType::Normal,
        };
        Candle::from_tick(&tick, i * MINUTE_MS, (i + 1) * MINUTE_MS - 1)
    }

    async fn app() -> Router {
        let repo = Arc::new(MemoryRepository::new());
        for i in 0..5 {
            repo.append_candle("a005930", IntervalKind::Minute, &minute(i))
                .await
                .unwrap();
        }
        let mut config = EngineConfig::default();
        config.symbols = vec![SymbolContext::new("a005930", 0)];
        let state = AppState::new(config, repo, Arc::new(NoGapFill), Arc::new(NoGapFill));
        router(Arc::new(state))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_and_live_candles() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let uri = "/api/v1/candle?symbol=a005930&interval=1m";
        let (status, body) = call(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = call(&app, "GET", "/api/v1/candle?symbol=nope&interval=1m", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn backtest_lifecycle() {
        let app = app().await;
        let (status, _) = call(&app, "GET", "/api/v1/backtest/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let create = json!({
            "targets": ["a005930"],
            "startTime": 0,
            "endTime": 4 * MINUTE_MS,
            "timeFrame": "m"
        });
        let (status, body) = call(&app, "POST", "/api/v1/backtest", Some(create)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "stopped");
        assert_eq!(body["timeFrame"], "m");

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/backtest/next",
            Some(json!({ "currentTime": 2 * MINUTE_MS })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["published"], 3);

        let uri = "/api/v1/backtest/candle?symbol=a005930&interval=1m";
        let (_, body) = call(&app, "GET", uri, None).await;
        assert_eq!(body.as_array().unwrap().len(), 3);

        let uri = "/api/v1/backtest/speed";
        let (status, _) = call(&app, "POST", uri, Some(json!({ "speed": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (_, body) = call(&app, "POST", uri, Some(json!({ "speed": 4.0 }))).await;
        assert_eq!(body["speed"], 4.0);

        let (status, _) = call(&app, "POST", "/api/v1/backtest/finish", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "POST", "/api/v1/backtest/play", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_backtest_is_rejected() {
        let app = app().await;
        let create = json!({
            "targets": [],
            "startTime": 0,
            "endTime": MINUTE_MS,
            "timeFrame": "r"
        });
        let (status, body) = call(&app, "POST", "/api/v1/backtest", Some(create)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("target"));
    }
}
