//! Rolling per-symbol indicator kernel.
//!
//! Bounded-window SMA/EMA/RSI/MACD/VWAP/momentum state, keyed by symbol and
//! owned by whichever pipeline instance drives it (never global). Window
//! bounds are enforced by FIFO eviction; VWAP accumulates for the process
//! lifetime. MACD keeps an independent short/long EMA pair per symbol.

use std::collections::{HashMap, VecDeque};

use crate::models::DailyBar;

/// Default SMA/EMA window.
pub const SMA_PERIOD: usize = 20;
/// Default RSI window.
pub const RSI_PERIOD: usize = 14;
/// Momentum lookback.
pub const MOMENTUM_PERIOD: usize = 10;
/// MACD fast EMA window.
pub const MACD_SHORT_PERIOD: usize = 12;
/// MACD slow EMA window.
pub const MACD_LONG_PERIOD: usize = 26;
/// Largest window any indicator needs; close history is bounded to this.
pub const MAX_PERIOD: usize = MACD_LONG_PERIOD;

/// Running EMA with a warm-up counter.
#[derive(Debug, Clone, Copy, Default)]
struct EmaState {
    value: f64,
    seen: usize,
}

impl EmaState {
    /// Fold in one close. Returns the warmed EMA once `seen >= period`,
    /// otherwise `None` (caller substitutes the SMA-style warm-up value).
    fn update(&mut self, close: f64, period: usize) -> Option<f64> {
        let multiplier = 2.0 / (period as f64 + 1.0);
        if self.seen == 0 {
            self.value = close;
        } else {
            self.value += (close - self.value) * multiplier;
        }
        self.seen += 1;
        (self.seen >= period).then_some(self.value)
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolState {
    /// Closing prices, newest last, capped at [`MAX_PERIOD`].
    closes: VecDeque<f64>,
    ema: EmaState,
    macd_short: EmaState,
    macd_long: EmaState,
    gains: VecDeque<f64>,
    losses: VecDeque<f64>,
    last_close: Option<f64>,
    cumulative_price_volume: f64,
    cumulative_volume: f64,
}

impl SymbolState {
    /// SMA over the trailing `period` closes, or `close` itself while the
    /// window is still filling (never a partial mean).
    fn sma_value(&self, close: f64, period: usize) -> f64 {
        if self.closes.len() < period {
            close
        } else {
            self.closes.iter().rev().take(period).sum::<f64>() / period as f64
        }
    }
}

/// Per-symbol indicator state map. One mutator at a time per instance; the
/// owner serializes access.
#[derive(Debug, Default)]
pub struct IndicatorKernel {
    symbols: HashMap<String, SymbolState>,
}

impl IndicatorKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self, symbol: &str) -> &mut SymbolState {
        self.symbols.entry(symbol.to_string()).or_default()
    }

    /// Append `close` to the symbol's window and return the simple moving
    /// average, or `close` while fewer than `period` samples exist.
    pub fn sma(&mut self, symbol: &str, close: f64, period: usize) -> f64 {
        let state = self.state(symbol);
        state.closes.push_back(close);
        while state.closes.len() > MAX_PERIOD.max(period) {
            state.closes.pop_front();
        }
        state.sma_value(close, period)
    }

    /// Exponential moving average. Warm-up (fewer than `period` samples)
    /// returns the SMA-style value while the EMA keeps folding in closes.
    pub fn ema(&mut self, symbol: &str, close: f64, period: usize) -> f64 {
        let state = self.state(symbol);
        match state.ema.update(close, period) {
            Some(value) => value,
            None => state.sma_value(close, period),
        }
    }

    /// Wilder-style RSI over gain/loss FIFOs. First observation and any
    /// under-filled window return the neutral 50; an all-gain window
    /// saturates at 100.
    pub fn rsi(&mut self, symbol: &str, close: f64, period: usize) -> f64 {
        let state = self.state(symbol);
        let Some(last) = state.last_close.replace(close) else {
            return 50.0;
        };

        let change = close - last;
        state.gains.push_back(change.max(0.0));
        state.losses.push_back((-change).max(0.0));
        while state.gains.len() > period {
            state.gains.pop_front();
        }
        while state.losses.len() > period {
            state.losses.pop_front();
        }

        if state.gains.len() < period {
            return 50.0;
        }

        let avg_gain = state.gains.iter().sum::<f64>() / period as f64;
        let avg_loss = state.losses.iter().sum::<f64>() / period as f64;
        if avg_loss == 0.0 {
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }

    /// MACD line: EMA(12) - EMA(26) over segregated per-symbol EMA states.
    pub fn macd(&mut self, symbol: &str, close: f64) -> f64 {
        let state = self.state(symbol);
        let short = state
            .macd_short
            .update(close, MACD_SHORT_PERIOD)
            .unwrap_or_else(|| state.sma_value(close, MACD_SHORT_PERIOD));
        let long = state
            .macd_long
            .update(close, MACD_LONG_PERIOD)
            .unwrap_or_else(|| state.sma_value(close, MACD_LONG_PERIOD));
        short - long
    }

    /// Volume-weighted average price, cumulated from process start. Returns
    /// `close` until any volume has been observed.
    pub fn vwap(&mut self, symbol: &str, volume: f64, close: f64) -> f64 {
        let state = self.state(symbol);
        state.cumulative_price_volume += close * volume;
        state.cumulative_volume += volume;
        if state.cumulative_volume == 0.0 {
            close
        } else {
            state.cumulative_price_volume / state.cumulative_volume
        }
    }

    /// Close minus the close `period` observations back, 0 while the window
    /// is under-filled. Reads the window written by [`IndicatorKernel::sma`].
    pub fn momentum(&mut self, symbol: &str, close: f64, period: usize) -> f64 {
        let state = self.state(symbol);
        if state.closes.len() < period {
            0.0
        } else {
            close - state.closes[state.closes.len() - period]
        }
    }

    /// Preload state from persisted daily rows (oldest first) so a restart
    /// does not begin with a cold window.
    pub fn seed(&mut self, symbol: &str, history: &[DailyBar]) {
        for row in history {
            self.sma(symbol, row.close, SMA_PERIOD);
            self.ema(symbol, row.close, SMA_PERIOD);
            self.rsi(symbol, row.close, RSI_PERIOD);
            self.macd(symbol, row.close);
            self.vwap(symbol, row.volume, row.close);
        }
    }

    /// Number of closes currently in the symbol's window.
    pub fn history_len(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map_or(0, |s| s.closes.len())
    }
}
