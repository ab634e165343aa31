//! TimescaleDB access.
//!
//! Two hypertable-shaped tables: `realtime_data` (one row per minute, JSON
//! payloads) and `daily_data` (one row per (date, symbol)). Every insert is
//! an upsert so replays and retries are idempotent.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::models::{CombinedBar, DailyBar, PersistRecord};

/// Startup connect attempts before the fault is considered fatal.
const CONNECT_ATTEMPTS: u32 = 5;
/// Spacing between startup connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS realtime_data (
        datetime TIMESTAMPTZ PRIMARY KEY,
        l1 JSONB NOT NULL,
        l2 JSONB NOT NULL,
        features JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_data (
        date DATE NOT NULL,
        symbol TEXT NOT NULL,
        open DOUBLE PRECISION,
        high DOUBLE PRECISION,
        low DOUBLE PRECISION,
        close DOUBLE PRECISION,
        volume DOUBLE PRECISION,
        adj_close DOUBLE PRECISION,
        sma DOUBLE PRECISION,
        ema DOUBLE PRECISION,
        rsi DOUBLE PRECISION,
        macd DOUBLE PRECISION,
        vwap DOUBLE PRECISION,
        momentum DOUBLE PRECISION,
        PRIMARY KEY (date, symbol)
    )
    "#,
];

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect with a bounded retry loop, then bootstrap the schema.
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let url = cfg.url();
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
            {
                Ok(pool) => {
                    info!(host = %cfg.host, dbname = %cfg.dbname, "database connection established");
                    let db = Self { pool };
                    db.ensure_schema().await?;
                    return Ok(db);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %e,
                        "database connect failed"
                    );
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        match last_err {
            Some(e) => Err(anyhow::Error::from(e).context("database unreachable after retries")),
            None => Err(anyhow::anyhow!("database unreachable after retries")),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        for stmt in SCHEMA_SQL {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("schema bootstrap failed")?;
        }
        info!("database tables created or verified");
        Ok(())
    }

    /// Dispatch one queued record to its upsert.
    pub async fn write(&self, record: &PersistRecord) -> Result<()> {
        match record {
            PersistRecord::Minute(bar) => self.upsert_minute_bar(bar).await,
            PersistRecord::Daily(bar) => self.upsert_daily_bar(bar).await,
        }
    }

    /// Upsert one minute bar keyed by its datetime.
    pub async fn upsert_minute_bar(&self, bar: &CombinedBar) -> Result<()> {
        let datetime = parse_local_datetime(&bar.datetime)?;
        sqlx::query(
            r#"
            INSERT INTO realtime_data (datetime, l1, l2, features)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (datetime) DO UPDATE
            SET l1 = EXCLUDED.l1, l2 = EXCLUDED.l2, features = EXCLUDED.features
            "#,
        )
        .bind(datetime)
        .bind(serde_json::to_value(&bar.l1)?)
        .bind(serde_json::to_value(&bar.l2)?)
        .bind(serde_json::to_value(&bar.features)?)
        .execute(&self.pool)
        .await
        .context("realtime_data upsert failed")?;
        Ok(())
    }

    /// Upsert one daily row keyed by (date, symbol).
    pub async fn upsert_daily_bar(&self, bar: &DailyBar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_data
                (date, symbol, open, high, low, close, volume, adj_close,
                 sma, ema, rsi, macd, vwap, momentum)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (date, symbol) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                adj_close = EXCLUDED.adj_close,
                sma = EXCLUDED.sma,
                ema = EXCLUDED.ema,
                rsi = EXCLUDED.rsi,
                macd = EXCLUDED.macd,
                vwap = EXCLUDED.vwap,
                momentum = EXCLUDED.momentum
            "#,
        )
        .bind(bar.date)
        .bind(&bar.symbol)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.adj_close)
        .bind(bar.sma)
        .bind(bar.ema)
        .bind(bar.rsi)
        .bind(bar.macd)
        .bind(bar.vwap)
        .bind(bar.momentum)
        .execute(&self.pool)
        .await
        .context("daily_data upsert failed")?;
        Ok(())
    }

    /// Newest persisted date for a symbol, for incremental resume.
    pub async fn last_daily_date(&self, symbol: &str) -> Result<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MAX(date) FROM daily_data WHERE symbol = $1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .context("max(date) query failed")?;
        Ok(row.try_get::<Option<NaiveDate>, _>(0)?)
    }

    /// Oldest persisted date for a symbol.
    pub async fn first_daily_date(&self, symbol: &str) -> Result<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MIN(date) FROM daily_data WHERE symbol = $1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .context("min(date) query failed")?;
        Ok(row.try_get::<Option<NaiveDate>, _>(0)?)
    }

    /// Most recent `limit` daily rows for a symbol, returned oldest first
    /// so they can seed indicator state in order.
    pub async fn recent_daily_bars(&self, symbol: &str, limit: i64) -> Result<Vec<DailyBar>> {
        let rows = sqlx::query(
            r#"
            SELECT date, symbol, open, high, low, close, volume, adj_close,
                   sma, ema, rsi, macd, vwap, momentum
            FROM daily_data
            WHERE symbol = $1
            ORDER BY date DESC
            LIMIT $2
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent daily rows query failed")?;

        let mut bars: Vec<DailyBar> = rows
            .into_iter()
            .map(|row| {
                Ok(DailyBar {
                    date: row.try_get("date")?,
                    symbol: row.try_get("symbol")?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: row.try_get("volume")?,
                    adj_close: row.try_get("adj_close")?,
                    sma: row.try_get("sma")?,
                    ema: row.try_get("ema")?,
                    rsi: row.try_get("rsi")?,
                    macd: row.try_get("macd")?,
                    vwap: row.try_get("vwap")?,
                    momentum: row.try_get("momentum")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        bars.reverse();
        Ok(bars)
    }
}

/// Interpret a `%Y-%m-%d %H:%M:%S` local timestamp as an instant.
fn parse_local_datetime(s: &str) -> Result<chrono::DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("invalid bar datetime {s:?}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bar datetime {s:?} does not exist in the local timezone"))
}
