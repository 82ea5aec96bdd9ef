//! Per-event tick processor.
//!
//! A [`Scanner`] owns the [`SymbolState`], [`AlertCooldown`] and [`PriorityState`] of every
//! symbol in one shard. Bulk state updates are sampled by priority tier, while alert
//! evaluation runs on every admitted quote so no symbol can silently miss a qualifying move.

use crate::{
    alert::AlertRecord,
    config::ScannerConfig,
    event::Quote,
    sampler::{PriorityState, SampleRates, Tier},
    state::{AlertCooldown, PriceUpdate, SymbolState, pct_change},
};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{debug, trace};

/// Subset of [`ScannerConfig`] the tick processor needs.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScanParams {
    pub tier_threshold: f64,
    pub alert_threshold: f64,
    pub cooldown: Duration,
    pub spread_cutoff: f64,
    pub sample_rates: SampleRates,
    pub snapshot_short: Duration,
    pub snapshot_long: Duration,
}

impl From<&ScannerConfig> for ScanParams {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            tier_threshold: config.tier_threshold,
            alert_threshold: config.alert_threshold,
            cooldown: config.cooldown,
            spread_cutoff: config.spread_cutoff,
            sample_rates: config.sample_rates,
            snapshot_short: config.snapshot_short,
            snapshot_long: config.snapshot_long,
        }
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self::from(&ScannerConfig::default())
    }
}

/// Everything the scanner tracks for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolEntry {
    pub state: SymbolState,
    pub cooldown: AlertCooldown,
    pub priority: PriorityState,
}

impl SymbolEntry {
    /// Seed from the previous close. The alert reference starts at the same price.
    pub fn seed(symbol: &str, yesterday_close: f64) -> Self {
        Self {
            state: SymbolState::new(symbol, yesterday_close),
            cooldown: AlertCooldown::new(yesterday_close),
            priority: PriorityState::default(),
        }
    }
}

/// What happened to a single event.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disposition {
    /// No previous close for the symbol, so no percent move can be computed.
    NoBaseline,
    /// Non-positive or crossed book.
    InvalidQuote,
    /// Spread wider than the cutoff; nothing mutated.
    SpreadFiltered,
    /// Sampling gate skipped the state update.
    Gated,
    Updated,
}

impl Disposition {
    /// Whether the event's price may feed the bar aggregator.
    pub fn admits_bar(&self) -> bool {
        matches!(self, Disposition::Gated | Disposition::Updated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub disposition: Disposition,
    pub alert: Option<AlertRecord>,
}

impl ScanOutcome {
    fn dropped(disposition: Disposition) -> Self {
        Self {
            disposition,
            alert: None,
        }
    }
}

/// Per-shard event counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScanStats {
    pub quotes: u64,
    pub no_baseline: u64,
    pub invalid: u64,
    pub spread_filtered: u64,
    pub gated: u64,
    pub updated: u64,
    pub alerts: u64,
    pub synthetic: u64,
}

impl std::ops::AddAssign for ScanStats {
    fn add_assign(&mut self, rhs: Self) {
        self.quotes += rhs.quotes;
        self.no_baseline += rhs.no_baseline;
        self.invalid += rhs.invalid;
        self.spread_filtered += rhs.spread_filtered;
        self.gated += rhs.gated;
        self.updated += rhs.updated;
        self.alerts += rhs.alerts;
        self.synthetic += rhs.synthetic;
    }
}

#[derive(Debug)]
pub struct Scanner {
    params: ScanParams,
    symbols: FnvHashMap<SmolStr, SymbolEntry>,
    dirty: FnvHashSet<SmolStr>,
    stats: ScanStats,
}

impl Scanner {
    pub fn new<'a, Iter>(params: ScanParams, baselines: Iter) -> Self
    where
        Iter: IntoIterator<Item = (&'a SmolStr, f64)>,
    {
        let symbols = baselines
            .into_iter()
            .map(|(symbol, close)| (symbol.clone(), SymbolEntry::seed(symbol, close)))
            .collect();

        Self {
            params,
            symbols,
            dirty: FnvHashSet::default(),
            stats: ScanStats::default(),
        }
    }

    /// Run one quote through spread filter, sampling gate and alert evaluation.
    pub fn process_quote(&mut self, symbol: &str, quote: &Quote) -> ScanOutcome {
        self.stats.quotes += 1;

        let Some(entry) = self.symbols.get_mut(symbol) else {
            self.stats.no_baseline += 1;
            trace!(%symbol, "no baseline, dropping quote");
            return ScanOutcome::dropped(Disposition::NoBaseline);
        };

        let spread_pct = match quote.spread_pct() {
            Some(spread_pct) if quote.bid > 0.0 && quote.ask >= quote.bid => spread_pct,
            _ => {
                self.stats.invalid += 1;
                debug!(%symbol, bid = quote.bid, ask = quote.ask, "ignoring invalid quote");
                return ScanOutcome::dropped(Disposition::InvalidQuote);
            }
        };

        let mid = quote.mid();
        if spread_pct > self.params.spread_cutoff {
            self.stats.spread_filtered += 1;
            trace!(%symbol, spread_pct, "wide spread, dropping quote");
            return ScanOutcome::dropped(Disposition::SpreadFiltered);
        }

        let yesterday_close = entry.state.yesterday_close;
        let pct_move = ((mid - yesterday_close) / yesterday_close).abs();
        let mut process = entry.priority.sample(
            pct_move,
            self.params.tier_threshold,
            &self.params.sample_rates,
        );

        let alert = Self::evaluate_alert(&self.params, entry, quote, mid);
        if alert.is_some() {
            // State persisted alongside an alert must reflect the trigger price
            process = true;
            self.stats.alerts += 1;
        }

        let disposition = if process {
            entry.state.apply_price(
                PriceUpdate {
                    price: mid,
                    bid: quote.bid,
                    ask: quote.ask,
                    spread_pct,
                    time: quote.time,
                },
                self.params.snapshot_short,
                self.params.snapshot_long,
            );
            self.dirty.insert(entry.state.symbol.clone());
            self.stats.updated += 1;
            Disposition::Updated
        } else {
            self.stats.gated += 1;
            Disposition::Gated
        };

        ScanOutcome { disposition, alert }
    }

    fn evaluate_alert(
        params: &ScanParams,
        entry: &mut SymbolEntry,
        quote: &Quote,
        mid: f64,
    ) -> Option<AlertRecord> {
        let move_from_reference = entry.cooldown.move_from_reference(mid)?;
        if move_from_reference <= params.alert_threshold
            || !entry.cooldown.cooled_down(quote.time, params.cooldown)
        {
            return None;
        }

        let reference_price = entry.cooldown.last_alerted_price;
        entry.cooldown.rearm(mid, quote.time);

        Some(AlertRecord {
            symbol: entry.state.symbol.clone(),
            trigger_price: mid,
            reference_price,
            pct_move: (mid - reference_price) / reference_price * 100.0,
            pct_from_yesterday: pct_change(entry.state.yesterday_close, mid),
            tier: entry.priority.tier,
            time: quote.time,
            bid: quote.bid,
            ask: quote.ask,
            bid_size: quote.bid_size,
            ask_size: quote.ask_size,
        })
    }

    /// Force a state update from a synthesised `bid = ask = price` tick.
    ///
    /// Bypasses the spread filter and the sampling gate. Returns `false` for unknown symbols
    /// or non-positive prices.
    pub fn apply_synthetic(&mut self, symbol: &str, price: f64, time: DateTime<Utc>) -> bool {
        if !(price.is_finite() && price > 0.0) {
            return false;
        }
        let Some(entry) = self.symbols.get_mut(symbol) else {
            return false;
        };

        entry.state.apply_price(
            PriceUpdate {
                price,
                bid: price,
                ask: price,
                spread_pct: 0.0,
                time,
            },
            self.params.snapshot_short,
            self.params.snapshot_long,
        );
        self.dirty.insert(entry.state.symbol.clone());
        self.stats.synthetic += 1;
        true
    }

    /// Symbols with no full update within `max_age`, longest-stale first, at most `limit`.
    pub fn stale_symbols(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        limit: usize,
    ) -> Vec<SmolStr> {
        let mut stale: Vec<(Option<DateTime<Utc>>, &SmolStr)> = self
            .symbols
            .iter()
            .filter(|(_, entry)| entry.state.is_stale(now, max_age))
            .map(|(symbol, entry)| (entry.state.last_updated, symbol))
            .collect();

        stale.sort_unstable();
        stale
            .into_iter()
            .take(limit)
            .map(|(_, symbol)| symbol.clone())
            .collect()
    }

    /// Snapshot every state updated since the last call.
    pub fn take_dirty(&mut self) -> Vec<SymbolState> {
        let symbols = &self.symbols;
        self.dirty
            .drain()
            .filter_map(|symbol| symbols.get(&symbol).map(|entry| entry.state.clone()))
            .collect()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn entry(&self, symbol: &str) -> Option<&SymbolEntry> {
        self.symbols.get(symbol)
    }

    pub fn tier(&self, symbol: &str) -> Option<Tier> {
        self.symbols.get(symbol).map(|entry| entry.priority.tier)
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn quote(bid: f64, ask: f64, secs: i64) -> Quote {
        Quote {
            instrument_id: 1,
            bid,
            ask,
            bid_size: 100.0,
            ask_size: 200.0,
            time: time(secs),
        }
    }

    fn at_mid(mid: f64, secs: i64) -> Quote {
        quote(mid - 0.005, mid + 0.005, secs)
    }

    fn scanner(closes: &[(&str, f64)]) -> Scanner {
        let closes: Vec<(SmolStr, f64)> = closes
            .iter()
            .map(|(symbol, close)| (SmolStr::new(symbol), *close))
            .collect();
        Scanner::new(
            ScanParams::default(),
            closes.iter().map(|(symbol, close)| (symbol, *close)),
        )
    }

    #[test]
    fn test_alert_scenario() {
        let mut scanner = scanner(&[("ABC", 10.0)]);

        // TC0: 3.5% from the previous close fires and re-arms at the trigger price
        let outcome = scanner.process_quote("ABC", &at_mid(10.35, 0));
        let alert = outcome.alert.expect("first move should alert");
        assert_eq!(outcome.disposition, Disposition::Updated);
        assert_eq!(alert.reference_price, 10.0);
        assert!((alert.trigger_price - 10.35).abs() < 1e-9);
        assert!((alert.pct_move - 3.5).abs() < 1e-6);
        assert_eq!(alert.bid_size, 100.0);
        let entry = scanner.entry("ABC").unwrap();
        assert!((entry.cooldown.last_alerted_price - 10.35).abs() < 1e-9);
        assert_eq!(entry.cooldown.last_alert_time, Some(time(0)));

        // TC1: 0.96% from 10.35 inside the cooldown does not fire
        let outcome = scanner.process_quote("ABC", &at_mid(10.45, 10));
        assert!(outcome.alert.is_none());

        // TC2: 1.45% from 10.35 after the cooldown fires again
        let outcome = scanner.process_quote("ABC", &at_mid(10.50, 35));
        let alert = outcome.alert.expect("cooldown elapsed, should alert");
        assert!((alert.reference_price - 10.35).abs() < 1e-9);
        let entry = scanner.entry("ABC").unwrap();
        assert!((entry.cooldown.last_alerted_price - 10.50).abs() < 1e-9);
        assert_eq!(scanner.stats().alerts, 2);
    }

    #[test]
    fn test_alert_requires_cooldown_even_for_large_moves() {
        let mut scanner = scanner(&[("ABC", 10.0)]);
        assert!(scanner.process_quote("ABC", &at_mid(10.35, 0)).alert.is_some());
        // 10% further but only 29s later
        assert!(scanner.process_quote("ABC", &at_mid(11.40, 29)).alert.is_none());
        // exactly 30s satisfies the cooldown
        assert!(scanner.process_quote("ABC", &at_mid(11.40, 30)).alert.is_some());
    }

    #[test]
    fn test_alert_threshold_is_strict() {
        let mut scanner = scanner(&[("ABC", 100.0)]);
        // exactly 1% does not fire
        assert!(scanner.process_quote("ABC", &quote(101.0, 101.0, 0)).alert.is_none());
        assert!(scanner.process_quote("ABC", &quote(101.02, 101.02, 1)).alert.is_some());
    }

    #[test]
    fn test_wide_spread_is_discarded() {
        let mut scanner = scanner(&[("ABC", 4.0)]);
        let before = scanner.entry("ABC").unwrap().clone();

        // 3.9% spread with a 27% implied move
        let outcome = scanner.process_quote("ABC", &quote(5.00, 5.20, 0));

        assert_eq!(outcome.disposition, Disposition::SpreadFiltered);
        assert!(!outcome.disposition.admits_bar());
        assert!(outcome.alert.is_none());
        assert_eq!(scanner.entry("ABC").unwrap(), &before);
        assert_eq!(scanner.dirty_len(), 0);
        assert_eq!(scanner.stats().spread_filtered, 1);
    }

    #[test]
    fn test_dropped_events() {
        struct TestCase {
            symbol: &'static str,
            input: Quote,
            expected: Disposition,
        }

        let tests = vec![
            TestCase {
                // TC0: symbol without baseline
                symbol: "NEW",
                input: at_mid(10.0, 0),
                expected: Disposition::NoBaseline,
            },
            TestCase {
                // TC1: zero bid
                symbol: "ABC",
                input: quote(0.0, 10.0, 0),
                expected: Disposition::InvalidQuote,
            },
            TestCase {
                // TC2: crossed book
                symbol: "ABC",
                input: quote(10.1, 10.0, 0),
                expected: Disposition::InvalidQuote,
            },
            TestCase {
                // TC3: empty book, no spread defined
                symbol: "ABC",
                input: quote(0.0, 0.0, 0),
                expected: Disposition::InvalidQuote,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut scanner = scanner(&[("ABC", 10.0)]);
            let actual = scanner.process_quote(test.symbol, &test.input);
            assert_eq!(actual.disposition, test.expected, "TC{} failed", index);
            assert!(actual.alert.is_none(), "TC{} failed", index);
            assert_eq!(scanner.dirty_len(), 0, "TC{} failed", index);
        }
    }

    #[test]
    fn test_sampling_gates_state_but_not_alerts() {
        let mut scanner = scanner(&[("ABC", 100.0)]);

        // 1.5% from the close alerts and re-arms the reference at 101.5
        let first = scanner.process_quote("ABC", &at_mid(101.5, 0));
        assert!(first.alert.is_some());
        assert_eq!(first.disposition, Disposition::Updated);

        // Low tier, rate 10: counters 1..=9 are gated
        for secs in 1..10 {
            let outcome = scanner.process_quote("ABC", &at_mid(101.6, secs));
            assert_eq!(outcome.disposition, Disposition::Gated, "tick {secs}");
            assert!(outcome.disposition.admits_bar());
            assert!(outcome.alert.is_none());
        }
        assert_eq!(scanner.tier("ABC"), Some(Tier::Low));
        assert!((scanner.entry("ABC").unwrap().state.current_price.unwrap() - 101.5).abs() < 1e-9);

        // counter 10 applies again
        assert_eq!(
            scanner.process_quote("ABC", &at_mid(101.6, 10)).disposition,
            Disposition::Updated
        );

        // counter 11 would be gated but a 3% move past the cooldown alerts and forces the update
        let outcome = scanner.process_quote("ABC", &at_mid(104.6, 40));
        assert!(outcome.alert.is_some());
        assert_eq!(outcome.disposition, Disposition::Updated);
        assert!((scanner.entry("ABC").unwrap().state.current_price.unwrap() - 104.6).abs() < 1e-9);
        assert_eq!(scanner.stats().gated, 9);
        assert_eq!(scanner.stats().alerts, 2);
    }

    #[test]
    fn test_synthetic_tick_forces_update() {
        let mut scanner = scanner(&[("XYZ", 2.0)]);

        assert!(scanner.apply_synthetic("XYZ", 2.30, time(660)));
        let state = &scanner.entry("XYZ").unwrap().state;
        assert_eq!(state.current_price, Some(2.30));
        assert_eq!(state.bid, Some(2.30));
        assert_eq!(state.ask, Some(2.30));
        assert_eq!(state.spread_pct, Some(0.0));
        assert_eq!(state.last_updated, Some(time(660)));
        // the alert reference is untouched by refreshes
        assert_eq!(scanner.entry("XYZ").unwrap().cooldown.last_alerted_price, 2.0);

        assert!(!scanner.apply_synthetic("NOPE", 1.0, time(660)));
        assert!(!scanner.apply_synthetic("XYZ", 0.0, time(660)));
        assert_eq!(scanner.stats().synthetic, 1);
    }

    #[test]
    fn test_stale_symbols_oldest_first() {
        let mut scanner = scanner(&[("AAA", 1.0), ("BBB", 1.0), ("CCC", 1.0), ("DDD", 1.0)]);
        scanner.apply_synthetic("AAA", 1.0, time(0));
        scanner.apply_synthetic("BBB", 1.0, time(100));
        scanner.apply_synthetic("CCC", 1.0, time(650));

        // DDD never updated, then AAA, then BBB; CCC is fresh
        let stale = scanner.stale_symbols(time(800), Duration::from_secs(600), 10);
        assert_eq!(stale, vec!["DDD", "AAA", "BBB"]);

        let stale = scanner.stale_symbols(time(800), Duration::from_secs(600), 2);
        assert_eq!(stale, vec!["DDD", "AAA"]);
    }

    #[test]
    fn test_take_dirty_dedups_by_symbol() {
        let mut scanner = scanner(&[("AAA", 1.0), ("BBB", 1.0)]);
        scanner.apply_synthetic("AAA", 1.1, time(0));
        scanner.apply_synthetic("AAA", 1.2, time(1));
        scanner.apply_synthetic("BBB", 1.0, time(1));
        assert_eq!(scanner.dirty_len(), 2);

        let mut dirty = scanner.take_dirty();
        dirty.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].current_price, Some(1.2));
        assert_eq!(scanner.dirty_len(), 0);
        assert!(scanner.take_dirty().is_empty());
    }
}
