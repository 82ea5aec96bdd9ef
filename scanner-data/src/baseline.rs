//! Previous-session closes for the tradable universe.
//!
//! Loaded once at startup. Every percent move in the scanner is measured from these closes,
//! so a failed or empty load is fatal rather than retried.

use crate::{
    error::ScannerError,
    provider::{HistoricalProvider, SymbolSelection, Timeframe},
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use smol_str::SmolStr;
use tracing::{info, warn};

/// Calendar days scanned back for the last completed session (covers long weekends).
const SESSION_LOOKBACK_DAYS: i64 = 7;

/// Immutable `symbol -> previous close` snapshot shared by every shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baselines {
    closes: FnvHashMap<SmolStr, f64>,
}

impl Baselines {
    pub fn new(closes: FnvHashMap<SmolStr, f64>) -> Self {
        Self { closes }
    }

    pub fn close(&self, symbol: &str) -> Option<f64> {
        self.closes.get(symbol).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, f64)> {
        self.closes.iter().map(|(symbol, close)| (symbol, *close))
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

impl FromIterator<(SmolStr, f64)> for Baselines {
    fn from_iter<T: IntoIterator<Item = (SmolStr, f64)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Fetch the last daily close strictly before the session containing `now`.
pub async fn load_baselines<P>(provider: &P, now: DateTime<Utc>) -> Result<Baselines, ScannerError>
where
    P: HistoricalProvider + ?Sized,
{
    let session_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    let start = session_start - TimeDelta::days(SESSION_LOOKBACK_DAYS);

    let bars = provider
        .get_bars(SymbolSelection::All, start, session_start, Timeframe::Day)
        .await
        .map_err(|error| ScannerError::BaselineUnavailable(error.to_string()))?;

    let mut skipped = 0usize;
    let baselines: Baselines = bars
        .into_iter()
        .filter_map(|(symbol, bars)| {
            let close = bars
                .iter()
                .filter(|bar| bar.timestamp < session_start)
                .max_by_key(|bar| bar.timestamp)
                .map(|bar| bar.close)
                .filter(|close| close.is_finite() && *close > 0.0);
            if close.is_none() {
                skipped += 1;
            }
            close.map(|close| (symbol, close))
        })
        .collect();

    if skipped > 0 {
        warn!(skipped, "symbols without a usable previous close");
    }
    if baselines.is_empty() {
        return Err(ScannerError::BaselineEmpty);
    }

    info!(
        symbols = baselines.len(),
        session = %session_start.date_naive(),
        "loaded previous-session closes"
    );
    Ok(baselines)
}
