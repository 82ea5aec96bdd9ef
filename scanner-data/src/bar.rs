//! 1-minute OHLCV bar aggregation from live ticks.
//!
//! Uses tick timestamps (not wall clock) for bar boundaries. At most one bar per symbol is
//! open; it completes the instant a tick with a later minute arrives. Late ticks for an
//! already-completed minute are dropped, not merged back.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// A single 1-minute OHLCV bar keyed by `(symbol, time)`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub symbol: SmolStr,
    /// Start of the minute.
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
}

impl Bar {
    fn open_at(symbol: SmolStr, time: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            symbol,
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            trade_count: 1,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
        self.trade_count += 1;
    }
}

/// Floor a timestamp to the start of its minute.
#[inline]
pub fn minute_floor(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(TimeDelta::minutes(1)).unwrap_or(time)
}

/// What a tick did to the aggregator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarUpdate {
    Opened,
    Updated,
    /// The previous open bar moved to the completed buffer and a new bar opened.
    Rolled,
    /// The tick belonged to a minute older than the open bar.
    Late,
    Invalid,
}

/// Folds ticks into per-symbol minute bars, buffering completed bars until drained.
#[derive(Debug)]
pub struct BarAggregator {
    open: FnvHashMap<SmolStr, Bar>,
    completed: VecDeque<Bar>,
    max_completed: usize,
    late_ticks: u64,
}

impl BarAggregator {
    pub fn new(max_completed: usize) -> Self {
        Self {
            open: FnvHashMap::default(),
            completed: VecDeque::new(),
            max_completed: max_completed.max(1),
            late_ticks: 0,
        }
    }

    pub fn update(
        &mut self,
        symbol: &SmolStr,
        price: f64,
        volume: f64,
        time: DateTime<Utc>,
    ) -> BarUpdate {
        // Guard: ignore invalid prices or volumes
        if !(price.is_finite() && price > 0.0) || !(volume.is_finite() && volume >= 0.0) {
            return BarUpdate::Invalid;
        }

        let minute = minute_floor(time);

        let Some(bar) = self.open.get_mut(symbol) else {
            self.open
                .insert(symbol.clone(), Bar::open_at(symbol.clone(), minute, price, volume));
            return BarUpdate::Opened;
        };

        if minute == bar.time {
            bar.update(price, volume);
            BarUpdate::Updated
        } else if minute > bar.time {
            let finished = std::mem::replace(bar, Bar::open_at(symbol.clone(), minute, price, volume));
            self.push_completed(finished);
            BarUpdate::Rolled
        } else {
            self.late_ticks += 1;
            trace!(%symbol, tick = %time, open_bar = %bar.time, "dropping late tick for closed minute");
            BarUpdate::Late
        }
    }

    fn push_completed(&mut self, bar: Bar) {
        if self.completed.len() >= self.max_completed {
            if let Some(dropped) = self.completed.pop_front() {
                warn!(
                    symbol = %dropped.symbol,
                    bar_time = %dropped.time,
                    max_completed = self.max_completed,
                    "completed bar buffer full, dropping oldest bar"
                );
            }
        }
        self.completed.push_back(bar);
    }

    /// Take every completed bar awaiting flush.
    pub fn drain_completed(&mut self) -> Vec<Bar> {
        self.completed.drain(..).collect()
    }

    /// Move every open bar to the completed buffer. Used on shutdown.
    pub fn close_all(&mut self) {
        let open: Vec<Bar> = self.open.drain().map(|(_, bar)| bar).collect();
        for bar in open {
            self.push_completed(bar);
        }
    }

    pub fn open_bar(&self, symbol: &str) -> Option<&Bar> {
        self.open.get(symbol)
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn late_ticks(&self) -> u64 {
        self.late_ticks
    }
}
