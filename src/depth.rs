//! L2 market-depth book and the per-minute depth histogram.
//!
//! The gateway streams depth updates keyed by a broker-assigned `position`
//! slot. The book keeps an append-ordered list of entries per slot so that
//! a delete never erases the liquidity that was observed earlier in the
//! minute: deleted entries stay in the list until the minute rollover
//! drains them into the frozen aggregate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of price buckets in the per-minute depth histogram.
pub const HISTOGRAM_BUCKETS: usize = 20;

/// Book side of a depth entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Decode the gateway's integer encoding (0 = buy, 1 = sell).
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Depth operation encoded by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthOp {
    Insert,
    Update,
    Delete,
}

impl DepthOp {
    /// Decode the gateway's integer encoding (0/1/2).
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DepthOp::Insert),
            1 => Some(DepthOp::Update),
            2 => Some(DepthOp::Delete),
            _ => None,
        }
    }
}

/// Lifecycle of an entry within the current minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Inserted,
    Updated,
    Deleted,
}

/// One observed liquidity level.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthEntry {
    pub price: f64,
    pub volume: f64,
    pub side: Side,
    pub status: EntryStatus,
}

/// Live L2 book: position slot -> append-ordered entry history.
///
/// Event ordering within one position is preserved by append; the broker's
/// arrival order is the only ordering authority.
#[derive(Debug, Default)]
pub struct DepthBook {
    slots: BTreeMap<i32, Vec<DepthEntry>>,
}

impl DepthBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one gateway depth update.
    ///
    /// Insert appends; Update mutates the last entry in place unless that
    /// entry is already deleted (then it appends a fresh insert); Delete
    /// marks the last entry deleted without removing it.
    pub fn apply(&mut self, position: i32, op: DepthOp, side: Side, price: f64, volume: f64) {
        let entries = self.slots.entry(position).or_default();
        match op {
            DepthOp::Insert => entries.push(DepthEntry {
                price,
                volume,
                side,
                status: EntryStatus::Inserted,
            }),
            DepthOp::Update => match entries.last_mut() {
                Some(last) if last.status != EntryStatus::Deleted => {
                    last.price = price;
                    last.volume = volume;
                    last.side = side;
                    last.status = EntryStatus::Updated;
                }
                _ => entries.push(DepthEntry {
                    price,
                    volume,
                    side,
                    status: EntryStatus::Inserted,
                }),
            },
            DepthOp::Delete => {
                if let Some(last) = entries.last_mut() {
                    last.status = EntryStatus::Deleted;
                }
            }
        }
    }

    /// True when no entries have been observed.
    pub fn is_empty(&self) -> bool {
        self.slots.values().all(|v| v.is_empty())
    }

    /// Total number of live (non-deleted) entries.
    pub fn live_len(&self) -> usize {
        self.slots
            .values()
            .flatten()
            .filter(|e| e.status != EntryStatus::Deleted)
            .count()
    }

    /// Minute-rollover partition.
    ///
    /// Deleted entries are moved out; still-live entries are copied out and
    /// retained as the starting book of the next minute. The returned
    /// vector is this minute's frozen L2 observation: consumed liquidity
    /// (deleted within the minute) plus resting liquidity.
    pub fn freeze(&mut self) -> Vec<DepthEntry> {
        let mut frozen = Vec::new();
        self.slots.retain(|_, entries| {
            let mut live = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if entry.status == EntryStatus::Deleted {
                    frozen.push(entry);
                } else {
                    frozen.push(entry.clone());
                    live.push(entry);
                }
            }
            *entries = live;
            !entries.is_empty()
        });
        frozen
    }
}

/// One histogram bucket: mid-price of the bucket's range plus the buy and
/// sell volume that landed in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

/// Fixed-size histogram of the minute's depth over its observed price range.
///
/// Empty when the minute saw no depth or a degenerate (min == max) range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthHistogram {
    pub min_price: f64,
    pub max_price: f64,
    pub buckets: Vec<HistogramBucket>,
}

impl DepthHistogram {
    pub fn empty() -> Self {
        Self {
            min_price: 0.0,
            max_price: 0.0,
            buckets: Vec::new(),
        }
    }

    /// Build the histogram from the frozen minute entries.
    ///
    /// Bucket index is `clamp(floor((price - min) / interval), 0, 19)` with
    /// `interval = (max - min) / 20`; a bucket's price is the midpoint
    /// `min + (i + 0.5) * interval`.
    pub fn from_entries(entries: &[DepthEntry]) -> Self {
        if entries.is_empty() {
            return Self::empty();
        }

        let min_price = entries.iter().map(|e| e.price).fold(f64::MAX, f64::min);
        let max_price = entries.iter().map(|e| e.price).fold(f64::MIN, f64::max);
        if max_price <= min_price {
            return Self {
                min_price,
                max_price,
                buckets: Vec::new(),
            };
        }

        let interval = (max_price - min_price) / HISTOGRAM_BUCKETS as f64;
        let mut buckets: Vec<HistogramBucket> = (0..HISTOGRAM_BUCKETS)
            .map(|i| HistogramBucket {
                price: min_price + (i as f64 + 0.5) * interval,
                buy_volume: 0.0,
                sell_volume: 0.0,
            })
            .collect();

        for entry in entries {
            let idx = (((entry.price - min_price) / interval).floor() as usize)
                .min(HISTOGRAM_BUCKETS - 1);
            match entry.side {
                Side::Buy => buckets[idx].buy_volume += entry.volume,
                Side::Sell => buckets[idx].sell_volume += entry.volume,
            }
        }

        Self {
            min_price,
            max_price,
            buckets,
        }
    }

    /// Total volume across all buckets (both sides).
    pub fn total_volume(&self) -> f64 {
        self.buckets
            .iter()
            .map(|b| b.buy_volume + b.sell_volume)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(price: f64, volume: f64, side: Side) -> DepthEntry {
        DepthEntry {
            price,
            volume,
            side,
            status: EntryStatus::Inserted,
        }
    }

    #[test]
    fn insert_update_delete_lifecycle() {
        let mut book = DepthBook::new();
        book.apply(0, DepthOp::Insert, Side::Buy, 100.0, 30.0);
        book.apply(0, DepthOp::Update, Side::Buy, 100.5, 25.0);
        assert_eq!(book.live_len(), 1);

        book.apply(0, DepthOp::Delete, Side::Buy, 0.0, 0.0);
        assert_eq!(book.live_len(), 0);
        assert!(!book.is_empty());
    }

    #[test]
    fn update_after_delete_appends_fresh_entry() {
        let mut book = DepthBook::new();
        book.apply(3, DepthOp::Insert, Side::Sell, 101.0, 40.0);
        book.apply(3, DepthOp::Delete, Side::Sell, 0.0, 0.0);
        book.apply(3, DepthOp::Update, Side::Sell, 102.0, 15.0);

        let frozen = book.freeze();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen[0].status, EntryStatus::Deleted);
        assert_eq!(frozen[1].status, EntryStatus::Inserted);
        assert_eq!(frozen[1].price, 102.0);
    }

    #[test]
    fn freeze_keeps_live_entries_for_next_minute() {
        let mut book = DepthBook::new();
        book.apply(0, DepthOp::Insert, Side::Buy, 100.0, 30.0);
        book.apply(1, DepthOp::Insert, Side::Sell, 101.0, 40.0);
        book.apply(1, DepthOp::Delete, Side::Sell, 0.0, 0.0);

        let frozen = book.freeze();
        assert_eq!(frozen.len(), 2);

        // Deleted slot 1 is gone; resting slot 0 carries into the next minute.
        assert_eq!(book.live_len(), 1);
        let frozen_again = book.freeze();
        assert_eq!(frozen_again.len(), 1);
        assert_eq!(frozen_again[0].price, 100.0);
    }

    #[test]
    fn histogram_bucket_assignment_spans_range() {
        // min=100, max=101 -> interval 0.05; ends map to buckets 0 and 19.
        let entries = vec![
            entry(100.0, 30.0, Side::Buy),
            entry(101.0, 40.0, Side::Sell),
        ];
        let histogram = DepthHistogram::from_entries(&entries);
        assert_eq!(histogram.buckets.len(), HISTOGRAM_BUCKETS);
        assert!((histogram.max_price - histogram.min_price - 1.0).abs() < 1e-12);
        assert_eq!(histogram.buckets[0].buy_volume, 30.0);
        assert_eq!(histogram.buckets[19].sell_volume, 40.0);
        assert!((histogram.buckets[0].price - 100.025).abs() < 1e-9);
        assert!((histogram.buckets[19].price - 100.975).abs() < 1e-9);
    }

    #[test]
    fn histogram_conserves_volume() {
        let entries: Vec<DepthEntry> = (0..57)
            .map(|i| {
                let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
                entry(100.0 + (i as f64) * 0.13, 1.0 + i as f64, side)
            })
            .collect();
        let expected: f64 = entries.iter().map(|e| e.volume).sum();
        let histogram = DepthHistogram::from_entries(&entries);
        assert!((histogram.total_volume() - expected).abs() < 1e-9);
        for bucket in &histogram.buckets {
            assert!(bucket.buy_volume >= 0.0 && bucket.sell_volume >= 0.0);
        }
    }

    #[test]
    fn histogram_degenerate_range_is_empty() {
        let entries = vec![
            entry(100.0, 5.0, Side::Buy),
            entry(100.0, 7.0, Side::Sell),
        ];
        let histogram = DepthHistogram::from_entries(&entries);
        assert!(histogram.buckets.is_empty());
        assert_eq!(histogram.total_volume(), 0.0);
    }

    #[test]
    fn wire_decoding() {
        assert_eq!(Side::from_wire(0), Some(Side::Buy));
        assert_eq!(Side::from_wire(1), Some(Side::Sell));
        assert_eq!(Side::from_wire(7), None);
        assert_eq!(DepthOp::from_wire(2), Some(DepthOp::Delete));
        assert_eq!(DepthOp::from_wire(-1), None);
    }
}
