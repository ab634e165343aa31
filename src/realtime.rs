//! Realtime minute-bar aggregator.
//!
//! Consumes gateway callbacks into live L1/L2 accumulators under the data
//! lock, rolls over on each wall-clock minute boundary, and produces one
//! combined bar per non-empty minute: OHLCV + depth histogram + features.
//! Each bar is enqueued for the database writer and mirrored as JSON into
//! the shared-memory region.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Timelike};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::protocol::{GatewayEvent, TICK_FIELD_LAST, TICK_FIELD_LAST_SIZE};
use crate::broker::{BrokerSession, Contract, SessionEvent};
use crate::depth::{DepthBook, DepthHistogram, DepthOp, Side};
use crate::features::{self, HistorySnapshot};
use crate::indicators::{IndicatorKernel, MAX_PERIOD};
use crate::models::{CombinedBar, MinuteBarL1, PersistRecord};
use crate::persist::{shm, PersistQueue, SharedMemory};
use crate::supervisor::Shutdown;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub symbol: String,
    /// Bound of the per-minute close/volume history ring.
    pub max_period: usize,
    pub shm_name: String,
    /// Explicit shared-memory directory; `None` uses the default region
    /// location.
    pub shm_dir: Option<PathBuf>,
    pub l1_req_id: i64,
    pub l2_req_id: i64,
    pub depth_rows: u32,
}

impl AggregatorConfig {
    pub fn for_symbol(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            max_period: MAX_PERIOD,
            shm_name: shm::REGION_NAME.to_string(),
            shm_dir: None,
            l1_req_id: 1,
            l2_req_id: 2,
            depth_rows: 60,
        }
    }
}

#[derive(Default)]
struct LiveBuffers {
    l1_prices: Vec<f64>,
    l1_volumes: Vec<f64>,
    book: DepthBook,
}

#[derive(Default)]
struct HistoryRing {
    closes: VecDeque<f64>,
    volumes: VecDeque<f64>,
}

pub struct RealTimeAggregator {
    cfg: AggregatorConfig,
    /// Data lock: live accumulators touched by the callback path.
    live: Mutex<LiveBuffers>,
    /// Buffer lock: bounded history of finalized minutes.
    history: Mutex<HistoryRing>,
    indicators: Mutex<IndicatorKernel>,
    queue: Arc<PersistQueue>,
    shm: Mutex<Option<SharedMemory>>,
}

impl RealTimeAggregator {
    pub fn new(cfg: AggregatorConfig, queue: Arc<PersistQueue>) -> Self {
        Self {
            cfg,
            live: Mutex::new(LiveBuffers::default()),
            history: Mutex::new(HistoryRing::default()),
            indicators: Mutex::new(IndicatorKernel::new()),
            queue,
            shm: Mutex::new(None),
        }
    }

    /// Create the shared-memory region, replacing any stale copy.
    pub fn open_shared_memory(&self) -> Result<()> {
        let region = match &self.cfg.shm_dir {
            Some(dir) => SharedMemory::create_in(dir, &self.cfg.shm_name)?,
            None => SharedMemory::create(&self.cfg.shm_name)?,
        };
        *self.shm.lock() = Some(region);
        Ok(())
    }

    /// Remove the shared-memory region.
    pub fn close_shared_memory(&self) {
        *self.shm.lock() = None;
    }

    /// Fold one gateway callback into the live buffers. No per-event work
    /// beyond the append.
    pub fn handle_gateway_event(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::TickPrice { req_id, field, price }
                if *req_id == self.cfg.l1_req_id && *field == TICK_FIELD_LAST =>
            {
                self.live.lock().l1_prices.push(*price);
            }
            GatewayEvent::TickSize { req_id, field, size }
                if *req_id == self.cfg.l1_req_id && *field == TICK_FIELD_LAST_SIZE =>
            {
                self.live.lock().l1_volumes.push(*size);
            }
            GatewayEvent::MarketDepth {
                req_id,
                position,
                operation,
                side,
                price,
                size,
            } if *req_id == self.cfg.l2_req_id => {
                match (DepthOp::from_wire(*operation), Side::from_wire(*side)) {
                    (Some(op), Some(side)) => {
                        self.live.lock().book.apply(*position, op, side, *price, *size);
                    }
                    _ => warn!(operation, side, "unrecognized depth update"),
                }
            }
            _ => {}
        }
    }

    /// Minute rollover: freeze the live buffers, aggregate, enqueue, and
    /// mirror. Returns `None` (and clears the buffers) when the minute was
    /// incomplete.
    pub fn finalize_minute(&self, datetime: &str) -> Option<CombinedBar> {
        let (prices, volumes, frozen_depth) = {
            let mut live = self.live.lock();
            if live.l1_prices.is_empty() || live.l1_volumes.is_empty() || live.book.is_empty() {
                warn!(datetime, "incomplete minute data; skipping bar");
                live.l1_prices.clear();
                live.l1_volumes.clear();
                live.book = DepthBook::new();
                return None;
            }
            (
                std::mem::take(&mut live.l1_prices),
                std::mem::take(&mut live.l1_volumes),
                live.book.freeze(),
            )
        };

        let l1 = MinuteBarL1::from_ticks(&prices, &volumes)?;
        if !l1.is_valid() {
            warn!(datetime, ?l1, "aggregated bar failed its integrity check");
        }

        let snapshot = {
            let mut history = self.history.lock();
            history.closes.push_back(l1.close);
            history.volumes.push_back(l1.volume);
            while history.closes.len() > self.cfg.max_period {
                history.closes.pop_front();
            }
            while history.volumes.len() > self.cfg.max_period {
                history.volumes.pop_front();
            }
            HistorySnapshot {
                closes: history.closes.iter().copied().collect(),
                volumes: history.volumes.iter().copied().collect(),
            }
        };

        let histogram = DepthHistogram::from_entries(&frozen_depth);
        let feature_set = features::compute(
            &self.cfg.symbol,
            &prices,
            &volumes,
            &frozen_depth,
            &snapshot,
            &self.indicators,
        );

        let bar = CombinedBar {
            datetime: datetime.to_string(),
            l1,
            l2: histogram,
            features: feature_set,
        };

        self.queue.push(PersistRecord::Minute(bar.clone()));
        self.publish(&bar);
        Some(bar)
    }

    /// Mirror the bar's JSON into the shared-memory region.
    fn publish(&self, bar: &CombinedBar) {
        let payload = match serde_json::to_vec(bar) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize combined bar");
                return;
            }
        };
        if let Some(region) = self.shm.lock().as_mut() {
            region.write_payload(&payload);
        }
    }

    /// Drive the aggregator: subscribe, pump events, roll over minutes.
    /// Returns after `stop` trips; the shared-memory region is always
    /// removed on the way out.
    pub async fn run(
        &self,
        session: &BrokerSession,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        stop: &Shutdown,
    ) -> Result<()> {
        self.open_shared_memory()?;
        let contract = Contract::stock(&self.cfg.symbol);
        session.request_l1(self.cfg.l1_req_id, &contract).await?;
        session
            .request_l2(self.cfg.l2_req_id, &contract, self.cfg.depth_rows)
            .await?;
        info!(symbol = %self.cfg.symbol, "realtime aggregation running");

        loop {
            tokio::select! {
                _ = stop.wait_stopped() => break,
                _ = tokio::time::sleep(duration_until_next_minute()) => {
                    let datetime = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                    if let Some(bar) = self.finalize_minute(&datetime) {
                        debug!(datetime = %bar.datetime, close = bar.l1.close, volume = bar.l1.volume, "minute bar emitted");
                    }
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Gateway(ev)) => self.handle_gateway_event(&ev),
                    Some(SessionEvent::Reconnected) => {
                        info!("session reconnected; re-issuing market data subscriptions");
                        if let Err(e) = session.request_l1(self.cfg.l1_req_id, &contract).await {
                            warn!(error = %e, "L1 re-subscribe failed");
                        }
                        if let Err(e) = session
                            .request_l2(self.cfg.l2_req_id, &contract, self.cfg.depth_rows)
                            .await
                        {
                            warn!(error = %e, "L2 re-subscribe failed");
                        }
                    }
                    None => {
                        warn!("session event channel closed");
                        break;
                    }
                },
            }
        }

        self.close_shared_memory();
        info!(symbol = %self.cfg.symbol, "realtime aggregation stopped");
        Ok(())
    }
}

/// Time left until the local wall clock's seconds roll from 59 to 00.
fn duration_until_next_minute() -> Duration {
    let now = Local::now();
    let elapsed_ns =
        u64::from(now.second()) * 1_000_000_000 + u64::from(now.nanosecond().min(999_999_999));
    Duration::from_nanos((60_000_000_000 - elapsed_ns).max(1_000_000))
}
