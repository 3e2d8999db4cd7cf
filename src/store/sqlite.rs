// =============================================================================
// SQLite repository (sqlx, WAL)
// =============================================================================
//
// Append-only tables keyed by an autoincrement rowid so reads come back in
// insertion order.  Deliberately no uniqueness constraints: the candle stores
// dedupe on read.
// =============================================================================

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{info, warn};

use crate::market_data::{Candle, CandleDocument, OrderbookEvent, Tick, TickDocument};
use crate::store::{candle_collection, CandleRange, CandleRepository};
use crate::types::{IntervalKind, SessionType};

pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .with_context(|| format!("invalid sqlite path {path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(60))
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {path}"))?;

        let repo = Self { pool };
        repo.initialize().await?;
        info!(path = %path, "sqlite repository ready");
        Ok(repo)
    }

    /// Private in-memory database, single connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory sqlite database")?;
        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    async fn initialize(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                time_type TEXT NOT NULL,
                arr TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS candles_by_start ON candles (collection, start_time)",
            r#"
            CREATE TABLE IF NOT EXISTS ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                time INTEGER NOT NULL,
                doc TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS ticks_by_time ON ticks (symbol, time)",
            r#"
            CREATE TABLE IF NOT EXISTS orderbooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                time INTEGER NOT NULL,
                doc TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS orderbooks_by_time ON orderbooks (symbol, time)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("failed to create sqlite schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl CandleRepository for SqliteRepository {
    async fn load_candles(
        &self,
        symbol: &str,
        kind: IntervalKind,
        range: CandleRange,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT start_time, end_time, time_type, arr
            FROM candles
            WHERE collection = ?
              AND start_time >= ? AND start_time <= ?
              AND end_time >= ? AND end_time <= ?
            ORDER BY id
            "#,
        )
        .bind(candle_collection(symbol, kind))
        .bind(range.start_from.unwrap_or(i64::MIN))
        .bind(range.start_to.unwrap_or(i64::MAX))
        .bind(range.end_from.unwrap_or(i64::MIN))
        .bind(range.end_to.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("failed to query candles")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_candle(&row) {
                Ok(candle) => out.push(candle),
                Err(e) => {
                    warn!(symbol, interval = %kind, error = %e, "skipping malformed candle row")
                }
            }
        }
        Ok(out)
    }

    async fn append_candle(&self, symbol: &str, kind: IntervalKind, candle: &Candle) -> Result<()> {
        let doc = candle.to_document();
        sqlx::query(
            "INSERT INTO candles (collection, start_time, end_time, time_type, arr)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(candle_collection(symbol, kind))
        .bind(doc.start_time)
        .bind(doc.end_time)
        .bind(doc.time_type.code())
        .bind(serde_json::to_string(&doc.arr)?)
        .execute(&self.pool)
        .await
        .context("failed to insert candle")?;
        Ok(())
    }

    async fn price_events(&self, symbol: &str, from: i64, to: i64) -> Result<Vec<Tick>> {
        let rows = sqlx::query(
            "SELECT doc FROM ticks WHERE symbol = ? AND time >= ? AND time <= ? ORDER BY id",
        )
        .bind(symbol.to_lowercase())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("failed to query ticks")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_tick(symbol, &row) {
                Ok(tick) => out.push(tick),
                Err(e) => warn!(symbol, error = %e, "skipping malformed tick row"),
            }
        }
        Ok(out)
    }

    async fn orderbook_events(
        &self,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<OrderbookEvent>> {
        let rows = sqlx::query(
            "SELECT doc FROM orderbooks WHERE symbol = ? AND time >= ? AND time <= ? ORDER BY id",
        )
        .bind(symbol.to_lowercase())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("failed to query orderbooks")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_orderbook(symbol, &row) {
                Ok(event) => out.push(event),
                Err(e) => warn!(symbol, error = %e, "skipping malformed orderbook row"),
            }
        }
        Ok(out)
    }

    async fn append_tick(&self, tick: &Tick) -> Result<()> {
        sqlx::query("INSERT INTO ticks (symbol, time, doc) VALUES (?, ?, ?)")
            .bind(tick.symbol.to_lowercase())
            .bind(tick.event_time)
            .bind(serde_json::to_string(&tick.to_document())?)
            .execute(&self.pool)
            .await
            .context("failed to insert tick")?;
        Ok(())
    }

    async fn append_orderbook(&self, event: &OrderbookEvent) -> Result<()> {
        sqlx::query("INSERT INTO orderbooks (symbol, time, doc) VALUES (?, ?, ?)")
            .bind(event.symbol.to_lowercase())
            .bind(event.event_time)
            .bind(event.to_wire().to_string())
            .execute(&self.pool)
            .await
            .context("failed to insert orderbook")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn decode_candle(row: &SqliteRow) -> Result<Candle> {
    let time_type: String = row.try_get("time_type")?;
    let arr: String = row.try_get("arr")?;
    let doc = CandleDocument {
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        time_type: SessionType::from_code(&time_type),
        arr: serde_json::from_str(&arr).context("malformed candle arr column")?,
    };
    Candle::from_document(&doc)
}

fn decode_tick(symbol: &str, row: &SqliteRow) -> Result<Tick> {
    let doc: String = row.try_get("doc")?;
    let doc: TickDocument = serde_json::from_str(&doc).context("malformed tick document")?;
    Tick::from_document(symbol, &doc)
}

fn decode_orderbook(symbol: &str, row: &SqliteRow) -> Result<OrderbookEvent> {
    let doc: String = row.try_get("doc")?;
    let doc: serde_json::Value =
        serde_json::from_str(&doc).context("malformed orderbook document")?;
    OrderbookEvent::from_document(symbol, &doc)
}
