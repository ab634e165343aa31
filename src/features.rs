//! Per-minute feature computation over the frozen rollover buffers.
//!
//! Everything here is a pure function of the frozen L1 ticks, the frozen L2
//! entries, and the bounded close/volume history, except the final three
//! indicator features (RSI/MACD/VWAP) which advance the kernel exactly once
//! per bar. The independent features are computed in parallel; the frozen
//! inputs are never mutated while they run.

use parking_lot::Mutex;

use crate::depth::{DepthEntry, Side};
use crate::indicators::{IndicatorKernel, RSI_PERIOD};
use crate::models::FeatureSet;

/// Snapshot of the aggregator's bounded per-minute history ring.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// Minute closes, oldest first.
    pub closes: Vec<f64>,
    /// Minute volume sums, oldest first.
    pub volumes: Vec<f64>,
}

/// Volume-weighted average of the minute's trade ticks; 0 when the minute
/// carried no volume. Prices and volumes are paired positionally, surplus
/// observations on either side are ignored.
pub fn weighted_avg_price(prices: &[f64], volumes: &[f64]) -> f64 {
    let mut pv = 0.0;
    let mut v = 0.0;
    for (price, volume) in prices.iter().zip(volumes.iter()) {
        pv += price * volume;
        v += volume;
    }
    if v == 0.0 {
        0.0
    } else {
        pv / v
    }
}

fn side_volume(entries: &[DepthEntry], side: Side) -> (f64, usize) {
    entries
        .iter()
        .filter(|e| e.side == side)
        .fold((0.0, 0), |(sum, n), e| (sum + e.volume, n + 1))
}

/// Buy volume over sell volume across the minute's depth; 0 when no sell
/// volume was observed.
pub fn buy_sell_ratio(entries: &[DepthEntry]) -> f64 {
    let (buy, _) = side_volume(entries, Side::Buy);
    let (sell, _) = side_volume(entries, Side::Sell);
    if sell == 0.0 {
        0.0
    } else {
        buy / sell
    }
}

/// Net depth imbalance: buy volume minus sell volume.
pub fn depth_change(entries: &[DepthEntry]) -> f64 {
    let (buy, _) = side_volume(entries, Side::Buy);
    let (sell, _) = side_volume(entries, Side::Sell);
    buy - sell
}

/// Average resting size per side divided by the observed spread
/// (lowest ask minus highest bid); 0 when the spread is not positive or a
/// side is missing.
pub fn implied_liquidity(entries: &[DepthEntry]) -> f64 {
    let (buy_volume, buy_count) = side_volume(entries, Side::Buy);
    let (sell_volume, sell_count) = side_volume(entries, Side::Sell);
    if buy_count == 0 || sell_count == 0 {
        return 0.0;
    }

    let highest_bid = entries
        .iter()
        .filter(|e| e.side == Side::Buy)
        .map(|e| e.price)
        .fold(f64::MIN, f64::max);
    let lowest_ask = entries
        .iter()
        .filter(|e| e.side == Side::Sell)
        .map(|e| e.price)
        .fold(f64::MAX, f64::min);

    let spread = lowest_ask - highest_bid;
    if spread <= 0.0 {
        return 0.0;
    }

    let avg_buy = buy_volume / buy_count as f64;
    let avg_sell = sell_volume / sell_count as f64;
    (avg_buy + avg_sell) / spread
}

/// Last minus first close of the bounded history; 0 with fewer than two
/// samples.
pub fn price_momentum(history: &HistorySnapshot) -> f64 {
    match (history.closes.first(), history.closes.last()) {
        (Some(first), Some(last)) if history.closes.len() >= 2 => last - first,
        _ => 0.0,
    }
}

/// Mean per-minute volume over the bounded history; 0 when empty.
pub fn trade_density(history: &HistorySnapshot) -> f64 {
    if history.volumes.is_empty() {
        0.0
    } else {
        history.volumes.iter().sum::<f64>() / history.volumes.len() as f64
    }
}

/// Compute the full feature record for one finalized minute.
///
/// The six history/buffer features run concurrently; the kernel-backed
/// three run after them under the kernel lock so only one mutator touches
/// per-symbol state at a time.
pub fn compute(
    symbol: &str,
    prices: &[f64],
    volumes: &[f64],
    depth_entries: &[DepthEntry],
    history: &HistorySnapshot,
    kernel: &Mutex<IndicatorKernel>,
) -> FeatureSet {
    let ((wap, (ratio, change)), (liquidity, (momentum, density))) = rayon::join(
        || {
            rayon::join(
                || weighted_avg_price(prices, volumes),
                || {
                    (
                        buy_sell_ratio(depth_entries),
                        depth_change(depth_entries),
                    )
                },
            )
        },
        || {
            rayon::join(
                || implied_liquidity(depth_entries),
                || (price_momentum(history), trade_density(history)),
            )
        },
    );

    let close = prices.last().copied().unwrap_or(0.0);
    let minute_volume: f64 = volumes.iter().sum();

    let (rsi, macd, vwap) = {
        let mut kernel = kernel.lock();
        (
            kernel.rsi(symbol, close, RSI_PERIOD),
            kernel.macd(symbol, close),
            kernel.vwap(symbol, minute_volume, close),
        )
    };

    FeatureSet {
        weighted_avg_price: wap,
        buy_sell_ratio: ratio,
        depth_change: change,
        implied_liquidity: liquidity,
        price_momentum: momentum,
        trade_density: density,
        rsi,
        macd,
        vwap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::EntryStatus;

    fn entry(price: f64, volume: f64, side: Side) -> DepthEntry {
        DepthEntry {
            price,
            volume,
            side,
            status: EntryStatus::Inserted,
        }
    }

    #[test]
    fn weighted_avg_price_matches_hand_computation() {
        let prices = [100.0, 101.5, 99.5, 100.5];
        let volumes = [10.0, 20.0, 5.0, 15.0];
        let wap = weighted_avg_price(&prices, &volumes);
        let expected = (100.0 * 10.0 + 101.5 * 20.0 + 99.5 * 5.0 + 100.5 * 15.0) / 50.0;
        assert!((wap - expected).abs() < 1e-9);
    }

    #[test]
    fn weighted_avg_price_zero_volume() {
        assert_eq!(weighted_avg_price(&[100.0], &[0.0]), 0.0);
        assert_eq!(weighted_avg_price(&[], &[]), 0.0);
    }

    #[test]
    fn buy_sell_features() {
        let entries = vec![
            entry(100.0, 30.0, Side::Buy),
            entry(101.0, 40.0, Side::Sell),
        ];
        assert!((buy_sell_ratio(&entries) - 0.75).abs() < 1e-9);
        assert!((depth_change(&entries) - (-10.0)).abs() < 1e-9);
    }

    #[test]
    fn buy_sell_ratio_no_sells_is_zero() {
        let entries = vec![entry(100.0, 30.0, Side::Buy)];
        assert_eq!(buy_sell_ratio(&entries), 0.0);
    }

    #[test]
    fn implied_liquidity_uses_spread() {
        // Highest bid 100, lowest ask 101: spread 1, avg sizes 30 and 40.
        let entries = vec![
            entry(100.0, 30.0, Side::Buy),
            entry(101.0, 40.0, Side::Sell),
        ];
        assert!((implied_liquidity(&entries) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn implied_liquidity_crossed_or_onesided_is_zero() {
        let crossed = vec![
            entry(101.0, 30.0, Side::Buy),
            entry(100.0, 40.0, Side::Sell),
        ];
        assert_eq!(implied_liquidity(&crossed), 0.0);

        let one_sided = vec![entry(100.0, 30.0, Side::Buy)];
        assert_eq!(implied_liquidity(&one_sided), 0.0);
    }

    #[test]
    fn history_features_defaults() {
        let empty = HistorySnapshot::default();
        assert_eq!(price_momentum(&empty), 0.0);
        assert_eq!(trade_density(&empty), 0.0);

        let single = HistorySnapshot {
            closes: vec![100.0],
            volumes: vec![50.0],
        };
        assert_eq!(price_momentum(&single), 0.0);
        assert_eq!(trade_density(&single), 50.0);
    }

    #[test]
    fn history_features_values() {
        let history = HistorySnapshot {
            closes: vec![100.0, 102.0, 101.0],
            volumes: vec![10.0, 30.0, 20.0],
        };
        assert!((price_momentum(&history) - 1.0).abs() < 1e-9);
        assert!((trade_density(&history) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn compute_full_record() {
        let kernel = Mutex::new(IndicatorKernel::new());
        let prices = [100.0, 101.5, 99.5, 100.5];
        let volumes = [10.0, 20.0, 5.0, 15.0];
        let entries = vec![
            entry(100.0, 30.0, Side::Buy),
            entry(101.0, 40.0, Side::Sell),
        ];
        let history = HistorySnapshot {
            closes: vec![100.5],
            volumes: vec![50.0],
        };

        let features = compute("SPY", &prices, &volumes, &entries, &history, &kernel);
        assert!((features.buy_sell_ratio - 0.75).abs() < 1e-9);
        assert!((features.depth_change - (-10.0)).abs() < 1e-9);
        assert!((features.implied_liquidity - 70.0).abs() < 1e-9);
        // First RSI observation is neutral; VWAP of a single (close, volume)
        // pair is the close.
        assert_eq!(features.rsi, 50.0);
        assert_eq!(features.macd, 0.0);
        assert!((features.vwap - 100.5).abs() < 1e-9);
    }
}
