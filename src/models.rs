//! Record types shared across the ingestion pipeline.
//!
//! A minute on the realtime path produces one [`CombinedBar`]; a day on the
//! backfill path produces one [`DailyBar`]. Both travel through the same
//! persistence queue as a [`PersistRecord`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::depth::DepthHistogram;

/// OHLCV aggregate of the L1 trade ticks observed within one minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBarL1 {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl MinuteBarL1 {
    /// Aggregate a minute of tick observations. Returns `None` when no
    /// prices were observed (the caller skips the minute).
    pub fn from_ticks(prices: &[f64], volumes: &[f64]) -> Option<Self> {
        let (&open, &close) = (prices.first()?, prices.last()?);
        let high = prices.iter().copied().fold(f64::MIN, f64::max);
        let low = prices.iter().copied().fold(f64::MAX, f64::min);
        let volume = volumes.iter().sum();
        Some(Self {
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// OHLCV integrity check: low <= open,close <= high and volume >= 0.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// Derived per-minute features. Every field has a defined default when its
/// inputs are missing or degenerate (documented on the feature engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub weighted_avg_price: f64,
    pub buy_sell_ratio: f64,
    pub depth_change: f64,
    pub implied_liquidity: f64,
    pub price_momentum: f64,
    pub trade_density: f64,
    pub rsi: f64,
    pub macd: f64,
    pub vwap: f64,
}

/// The atomic unit of realtime persistence: one minute of L1 + L2 + features.
///
/// `datetime` is local time, `%Y-%m-%d %H:%M:%S`, assigned at rollover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedBar {
    pub datetime: String,
    pub l1: MinuteBarL1,
    pub l2: DepthHistogram,
    pub features: FeatureSet,
}

/// One day of OHLCV plus rolling indicators, keyed by (date, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub adj_close: f64,
    pub sma: f64,
    pub ema: f64,
    pub rsi: f64,
    pub macd: f64,
    pub vwap: f64,
    pub momentum: f64,
}

/// Item carried by the persistence queue. The writer maps each variant to
/// its upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistRecord {
    Minute(CombinedBar),
    Daily(DailyBar),
}

impl PersistRecord {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PersistRecord::Minute(_) => "minute",
            PersistRecord::Daily(_) => "daily",
        }
    }
}
