//! Priority tiering and load-shedding sampler.
//!
//! Each tick is classified by the magnitude of its move from the previous close. Bigger movers
//! get every tick applied; quiet symbols only every Nth. The per-symbol counter is never reset,
//! only the modulus changes with the tier.

use crate::error::ScannerError;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Priority class of a symbol, derived from `|pct_from_yesterday|` relative to the tier threshold.
#[derive(
    Debug, Display, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum Tier {
    /// `>= 20x` threshold.
    #[display("tier1")]
    Critical,
    /// `>= 10x` threshold.
    #[display("tier2")]
    High,
    /// `>= 5x` threshold.
    #[display("tier3")]
    Medium,
    /// `>= 1x` threshold.
    #[display("tier4")]
    Low,
    /// Below threshold; sampled at the [`Tier::Low`] rate.
    #[display("inactive")]
    Inactive,
}

impl Tier {
    /// Classify an absolute fractional move (`0.035` = 3.5%) against `threshold`.
    pub fn classify(pct_move: f64, threshold: f64) -> Self {
        let pct_move = pct_move.abs();
        if pct_move >= 20.0 * threshold {
            Tier::Critical
        } else if pct_move >= 10.0 * threshold {
            Tier::High
        } else if pct_move >= 5.0 * threshold {
            Tier::Medium
        } else if pct_move >= threshold {
            Tier::Low
        } else {
            Tier::Inactive
        }
    }
}

/// Process one tick in every `rate` ticks per tier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SampleRates {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl Default for SampleRates {
    fn default() -> Self {
        Self {
            critical: 1,
            high: 3,
            medium: 5,
            low: 10,
        }
    }
}

impl SampleRates {
    pub fn rate(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Critical => self.critical,
            Tier::High => self.high,
            Tier::Medium => self.medium,
            Tier::Low | Tier::Inactive => self.low,
        }
    }

    pub fn validate(&self) -> Result<(), ScannerError> {
        if [self.critical, self.high, self.medium, self.low].contains(&0) {
            return Err(ScannerError::Config("sample rates must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Per-symbol sampling state.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriorityState {
    pub tick_count: u64,
    pub tier: Tier,
}

impl Default for PriorityState {
    fn default() -> Self {
        Self {
            tick_count: 0,
            tier: Tier::Inactive,
        }
    }
}

impl PriorityState {
    /// Re-tier from the latest move and decide whether this tick passes the sampling gate.
    ///
    /// The gate is evaluated against the count of prior ticks, so the very first tick of a
    /// symbol is always applied.
    pub fn sample(&mut self, pct_move: f64, threshold: f64, rates: &SampleRates) -> bool {
        self.tier = Tier::classify(pct_move, threshold);
        let rate = rates.rate(self.tier).max(1);
        let process = self.tick_count % rate == 0;
        self.tick_count = self.tick_count.wrapping_add(1);
        process
    }
}
