//! Daily OHLCV backfill driver.
//!
//! Walks a per-symbol calendar range day by day, skipping weekends and
//! market holidays, requesting one day of historical bars at a time and
//! upserting each day with its rolling indicators. Incremental resume
//! starts the day after the newest persisted row; a cold symbol starts
//! ten years back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::broker::protocol::{ErrorKind, GatewayEvent, HistoricalBarData};
use crate::broker::{BrokerSession, Contract, SessionEvent};
use crate::calendar;
use crate::indicators::{
    IndicatorKernel, MAX_PERIOD, MOMENTUM_PERIOD, RSI_PERIOD, SMA_PERIOD,
};
use crate::models::{DailyBar, PersistRecord};
use crate::persist::{Database, PersistQueue};
use crate::supervisor::Shutdown;

/// The database surface the driver needs: resume point and seed rows.
#[async_trait::async_trait]
pub trait DailyStore: Send + Sync {
    async fn last_daily_date(&self, symbol: &str) -> Result<Option<NaiveDate>>;
    async fn recent_daily_bars(&self, symbol: &str, limit: i64) -> Result<Vec<DailyBar>>;
}

#[async_trait::async_trait]
impl DailyStore for Database {
    async fn last_daily_date(&self, symbol: &str) -> Result<Option<NaiveDate>> {
        Database::last_daily_date(self, symbol).await
    }

    async fn recent_daily_bars(&self, symbol: &str, limit: i64) -> Result<Vec<DailyBar>> {
        Database::recent_daily_bars(self, symbol, limit).await
    }
}

#[derive(Debug, Clone)]
pub struct DailyConfig {
    pub symbols: Vec<String>,
    pub incremental: bool,
    /// Cold-start lookback.
    pub history_years: i32,
    /// Bound on waiting for the historical-data-end ack.
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_pause: Duration,
    /// First request id; each request increments from here.
    pub base_req_id: i64,
    /// Walk end override; `None` means today.
    pub end_date: Option<NaiveDate>,
}

impl DailyConfig {
    pub fn new(symbols: Vec<String>, incremental: bool) -> Self {
        Self {
            symbols,
            incremental,
            history_years: 10,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_pause: Duration::from_secs(5),
            base_req_id: 1_000,
            end_date: None,
        }
    }
}

pub struct DailyBackfillDriver {
    cfg: DailyConfig,
    store: Arc<dyn DailyStore>,
    queue: Arc<PersistQueue>,
    kernel: IndicatorKernel,
    next_req_id: i64,
}

impl DailyBackfillDriver {
    pub fn new(cfg: DailyConfig, store: Arc<dyn DailyStore>, queue: Arc<PersistQueue>) -> Self {
        let next_req_id = cfg.base_req_id;
        Self {
            cfg,
            store,
            queue,
            kernel: IndicatorKernel::new(),
            next_req_id,
        }
    }

    /// One full pass over the configured symbol list, in list order.
    pub async fn run_pass(
        &mut self,
        session: &BrokerSession,
        events: &mut UnboundedReceiver<SessionEvent>,
        shutdown: &Shutdown,
    ) -> Result<()> {
        for symbol in self.cfg.symbols.clone() {
            if shutdown.is_stopped() {
                break;
            }
            if let Err(e) = self.backfill_symbol(session, events, &symbol, shutdown).await {
                warn!(symbol = %symbol, error = %e, "symbol backfill failed; moving on");
            }
        }
        Ok(())
    }

    async fn backfill_symbol(
        &mut self,
        session: &BrokerSession,
        events: &mut UnboundedReceiver<SessionEvent>,
        symbol: &str,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let end = self.cfg.end_date.unwrap_or_else(|| Local::now().date_naive());
        let start = self.resolve_start_date(symbol, end).await?;
        if start > end {
            info!(symbol, "daily data already up to date");
            return Ok(());
        }

        let seed_rows = self.store.recent_daily_bars(symbol, MAX_PERIOD as i64).await;
        match seed_rows {
            Ok(rows) if !rows.is_empty() => {
                self.kernel.seed(symbol, &rows);
                info!(symbol, rows = rows.len(), "indicator state seeded");
            }
            Ok(_) => {}
            Err(e) => warn!(symbol, error = %e, "indicator seed query failed; starting cold"),
        }

        info!(symbol, start = %start, end = %end, "daily backfill walking calendar");
        let mut day = start;
        while day <= end {
            if shutdown.is_stopped() {
                break;
            }
            if calendar::is_trading_day(day) {
                let fetched = self.fetch_day(session, events, symbol, day, shutdown).await;
                match fetched {
                    Ok(bars) => {
                        for bar in &bars {
                            let daily = self.build_daily_bar(symbol, day, bar);
                            self.queue.push(PersistRecord::Daily(daily));
                        }
                    }
                    Err(e) => {
                        warn!(symbol, date = %day, error = %e, "daily request abandoned")
                    }
                }
            }
            day = day.succ_opt().context("calendar overflow")?;
        }
        Ok(())
    }

    async fn resolve_start_date(&self, symbol: &str, end: NaiveDate) -> Result<NaiveDate> {
        if self.cfg.incremental {
            if let Some(last) = self.store.last_daily_date(symbol).await? {
                return last.succ_opt().context("calendar overflow");
            }
        }
        Ok(years_back(end, self.cfg.history_years))
    }

    /// Request one day, waiting for the end ack. Timeouts retry with a
    /// pause; a gateway rejection abandons the day immediately.
    async fn fetch_day(
        &mut self,
        session: &BrokerSession,
        events: &mut UnboundedReceiver<SessionEvent>,
        symbol: &str,
        day: NaiveDate,
        shutdown: &Shutdown,
    ) -> Result<Vec<HistoricalBarData>> {
        let contract = Contract::stock(symbol);
        let end_datetime = format!("{} 23:59:59", day.format("%Y-%m-%d"));

        for attempt in 1..=self.cfg.max_retries {
            if shutdown.is_stopped() {
                bail!("shutdown requested");
            }
            let req_id = self.next_req_id;
            self.next_req_id += 1;

            session
                .request_historical(
                    req_id,
                    &contract,
                    &end_datetime,
                    "1 D",
                    "1 day",
                    "ADJUSTED_LAST",
                    true,
                )
                .await?;

            match timeout(self.cfg.request_timeout, collect_day(events, req_id)).await {
                Ok(result) => return result,
                Err(_) => {
                    warn!(
                        symbol,
                        date = %day,
                        attempt,
                        max_retries = self.cfg.max_retries,
                        "historical request timed out"
                    );
                    let _ = session.cancel(req_id).await;
                    if attempt < self.cfg.max_retries {
                        tokio::time::sleep(self.cfg.retry_pause).await;
                    }
                }
            }
        }
        bail!("no response after {} attempts", self.cfg.max_retries)
    }

    /// Advance the indicator state with this bar and pack the row.
    fn build_daily_bar(&mut self, symbol: &str, day: NaiveDate, bar: &HistoricalBarData) -> DailyBar {
        let date = NaiveDate::parse_from_str(&bar.time, "%Y-%m-%d").unwrap_or(day);
        let sma = self.kernel.sma(symbol, bar.close, SMA_PERIOD);
        let ema = self.kernel.ema(symbol, bar.close, SMA_PERIOD);
        let rsi = self.kernel.rsi(symbol, bar.close, RSI_PERIOD);
        let macd = self.kernel.macd(symbol, bar.close);
        let vwap = self.kernel.vwap(symbol, bar.volume, bar.close);
        let momentum = self.kernel.momentum(symbol, bar.close, MOMENTUM_PERIOD);

        DailyBar {
            date,
            symbol: symbol.to_string(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            adj_close: bar.close,
            sma,
            ema,
            rsi,
            macd,
            vwap,
            momentum,
        }
    }
}

/// Drain events until the end ack (or a rejection) for `req_id`.
async fn collect_day(
    events: &mut UnboundedReceiver<SessionEvent>,
    req_id: i64,
) -> Result<Vec<HistoricalBarData>> {
    let mut bars = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Gateway(GatewayEvent::HistoricalBar { req_id: id, bar })
                if id == req_id =>
            {
                bars.push(bar);
            }
            SessionEvent::Gateway(GatewayEvent::HistoricalEnd { req_id: id, .. })
                if id == req_id =>
            {
                return Ok(bars);
            }
            SessionEvent::Gateway(GatewayEvent::Error { id, code, message })
                if id == req_id && ErrorKind::classify(code).abandons_request() =>
            {
                bail!("request {req_id} rejected by gateway: {code} {message}");
            }
            _ => {}
        }
    }
    bail!("session event channel closed")
}

/// `years` calendar years before `date`, clamping Feb 29 to Feb 28.
fn years_back(date: NaiveDate, years: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year() - years, date.month(), date.day())
        .or_else(|| NaiveDate::from_ymd_opt(date.year() - years, date.month(), 28))
        .unwrap_or(date)
}
