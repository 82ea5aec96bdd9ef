//! Per-symbol rolling price state.
//!
//! Percent fields are expressed in percent (3.5 = 3.5%) and always recomputed from their
//! source prices by [`SymbolState::apply_price`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Trailing reference price, replaced once it is older than its window.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    pub price: f64,
    pub captured_at: DateTime<Utc>,
}

/// High or low of day, tracked as a percent extreme from the previous close.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Extreme {
    pub price: f64,
    pub pct: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SymbolState {
    pub symbol: SmolStr,
    pub current_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub price_time: Option<DateTime<Utc>>,

    pub yesterday_close: f64,
    pub today_open: Option<f64>,

    pub snapshot_5min: Option<Snapshot>,
    pub snapshot_15min: Option<Snapshot>,

    pub hod: Option<Extreme>,
    pub lod: Option<Extreme>,

    pub pct_from_yesterday: Option<f64>,
    pub pct_from_open: Option<f64>,
    pub pct_from_5min: Option<f64>,
    pub pct_from_15min: Option<f64>,

    pub spread_pct: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Top of book (or a synthesised equivalent) applied to a [`SymbolState`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PriceUpdate {
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_pct: f64,
    pub time: DateTime<Utc>,
}

impl SymbolState {
    /// Seed a session state from the previous close. The symbol is upper-cased.
    pub fn new(symbol: &str, yesterday_close: f64) -> Self {
        Self {
            symbol: SmolStr::new(symbol.to_uppercase()),
            current_price: None,
            bid: None,
            ask: None,
            price_time: None,
            yesterday_close,
            today_open: None,
            snapshot_5min: None,
            snapshot_15min: None,
            hod: None,
            lod: None,
            pct_from_yesterday: None,
            pct_from_open: None,
            pct_from_5min: None,
            pct_from_15min: None,
            spread_pct: None,
            last_updated: None,
        }
    }

    /// Apply a full state update.
    ///
    /// `today_open` is first-write-wins, snapshots roll when older than their window, and
    /// HOD/LOD only move outward so `hod.pct` never decreases and `lod.pct` never increases.
    pub fn apply_price(&mut self, update: PriceUpdate, short: Duration, long: Duration) {
        let PriceUpdate {
            price,
            bid,
            ask,
            spread_pct,
            time,
        } = update;

        self.current_price = Some(price);
        self.bid = Some(bid);
        self.ask = Some(ask);
        self.spread_pct = Some(spread_pct);
        self.price_time = Some(time);

        if self.today_open.is_none() {
            self.today_open = Some(price);
        }

        roll_snapshot(&mut self.snapshot_5min, price, time, short);
        roll_snapshot(&mut self.snapshot_15min, price, time, long);

        let pct_from_yesterday = pct_change(self.yesterday_close, price);
        if let Some(pct) = pct_from_yesterday {
            if self.hod.is_none_or(|hod| pct > hod.pct) {
                self.hod = Some(Extreme { price, pct, time });
            }
            if self.lod.is_none_or(|lod| pct < lod.pct) {
                self.lod = Some(Extreme { price, pct, time });
            }
        }

        self.pct_from_yesterday = pct_from_yesterday;
        self.pct_from_open = self.today_open.and_then(|open| pct_change(open, price));
        self.pct_from_5min = self
            .snapshot_5min
            .and_then(|snapshot| pct_change(snapshot.price, price));
        self.pct_from_15min = self
            .snapshot_15min
            .and_then(|snapshot| pct_change(snapshot.price, price));
        self.last_updated = Some(time);
    }

    /// Whether no full update has landed within `max_age` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_updated {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .is_ok_and(|elapsed| elapsed > max_age),
        }
    }
}

fn roll_snapshot(slot: &mut Option<Snapshot>, price: f64, time: DateTime<Utc>, window: Duration) {
    let expired = match slot {
        None => true,
        Some(snapshot) => time
            .signed_duration_since(snapshot.captured_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed > window),
    };
    if expired {
        *slot = Some(Snapshot {
            price,
            captured_at: time,
        });
    }
}

/// Percent change from `reference` to `price`, `None` for a non-positive reference.
pub fn pct_change(reference: f64, price: f64) -> Option<f64> {
    (reference > 0.0).then(|| (price - reference) / reference * 100.0)
}

/// Alert re-arm bookkeeping. `last_alerted_price` is the reference for the next move.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertCooldown {
    pub last_alerted_price: f64,
    pub last_alert_time: Option<DateTime<Utc>>,
}

impl AlertCooldown {
    pub fn new(yesterday_close: f64) -> Self {
        Self {
            last_alerted_price: yesterday_close,
            last_alert_time: None,
        }
    }

    /// Fractional move of `price` from the last alerted price.
    pub fn move_from_reference(&self, price: f64) -> Option<f64> {
        (self.last_alerted_price > 0.0)
            .then(|| ((price - self.last_alerted_price) / self.last_alerted_price).abs())
    }

    pub fn cooled_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_alert_time {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= cooldown),
        }
    }

    /// Re-arm at `price`, restarting the cooldown clock.
    pub fn rearm(&mut self, price: f64, now: DateTime<Utc>) {
        self.last_alerted_price = price;
        self.last_alert_time = Some(now);
    }
}
