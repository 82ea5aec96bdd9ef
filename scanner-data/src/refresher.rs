//! Fallback price source for symbols the live feed has gone quiet on.
//!
//! Every check interval the refresher asks each shard for its longest-stale symbols, fetches
//! recent minute bars for a bounded batch, and routes the last close back to the owning shard
//! as a synthetic `bid = ask = close` tick. Provider failures skip the cycle.

use crate::{
    config::ScannerConfig,
    provider::{HistoricalProvider, SymbolSelection, Timeframe},
    shard::{ShardCommand, ShardHandle},
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use futures::future::join_all;
use smol_str::SmolStr;
use std::time::Duration;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct StaleRefresher<P> {
    provider: P,
    shards: Vec<ShardHandle>,
    check_interval: Duration,
    stale_age: Duration,
    batch_size: usize,
    lookback: Duration,
}

impl<P> StaleRefresher<P>
where
    P: HistoricalProvider,
{
    pub fn new(provider: P, shards: Vec<ShardHandle>, config: &ScannerConfig) -> Self {
        Self {
            provider,
            shards,
            check_interval: config.stale_check_interval,
            stale_age: config.stale_age,
            batch_size: config.stale_batch_size.max(1),
            lookback: config.stale_lookback,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval_at(Instant::now() + self.check_interval, self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let refreshed = self.refresh_once(Utc::now()).await;
                    if refreshed > 0 {
                        info!(refreshed, "refreshed stale symbols from historical bars");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("stale symbol refresher stopped");
    }

    /// One refresh cycle. Returns how many synthetic ticks were delivered.
    pub async fn refresh_once(&self, now: DateTime<Utc>) -> usize {
        let owners = self.collect_stale(now).await;
        if owners.is_empty() {
            return 0;
        }

        let symbols: Vec<SmolStr> = owners.keys().cloned().collect();
        let lookback = TimeDelta::from_std(self.lookback).unwrap_or(TimeDelta::minutes(30));
        let bars = match self
            .provider
            .get_bars(
                SymbolSelection::List(&symbols),
                now - lookback,
                now,
                Timeframe::Minute,
            )
            .await
        {
            Ok(bars) => bars,
            Err(error) => {
                warn!(%error, symbols = symbols.len(), time = %now, "stale refresh skipped");
                return 0;
            }
        };

        let mut refreshed = 0;
        let mut without_bars = 0;
        for (symbol, shard) in owners {
            let Some(close) = bars
                .get(&symbol)
                .and_then(|bars| bars.last())
                .map(|bar| bar.close)
            else {
                without_bars += 1;
                continue;
            };

            let command = ShardCommand::Synthetic {
                symbol: symbol.clone(),
                price: close,
                time: now,
            };
            let Some(handle) = self.shards.get(shard) else {
                continue;
            };
            match handle.try_send(command) {
                Ok(true) => refreshed += 1,
                Ok(false) => debug!(%symbol, shard, "shard channel full, skipping refresh"),
                Err(error) => warn!(%error, %symbol, "stale refresh delivery failed"),
            }
        }

        if without_bars > 0 {
            debug!(without_bars, "stale symbols with no recent historical bars");
        }
        refreshed
    }

    /// Stale symbols mapped to their owning shard, at most `batch_size` overall.
    async fn collect_stale(&self, now: DateTime<Utc>) -> FnvHashMap<SmolStr, usize> {
        let per_shard = self.batch_size.div_ceil(self.shards.len().max(1));
        let requests = self.shards.iter().filter_map(|shard| {
            match shard.try_request(|reply| ShardCommand::StaleSymbols {
                now,
                max_age: self.stale_age,
                limit: per_shard,
                reply,
            }) {
                Ok(Some(rx)) => Some(async move { (shard.id(), rx.await) }),
                Ok(None) => {
                    debug!(shard = shard.id(), "shard channel full, skipping stale scan");
                    None
                }
                Err(error) => {
                    warn!(%error, "stale scan failed");
                    None
                }
            }
        });

        join_all(requests)
            .await
            .into_iter()
            .filter_map(|(shard, reply)| reply.ok().map(|symbols| (shard, symbols)))
            .flat_map(|(shard, symbols)| symbols.into_iter().map(move |symbol| (symbol, shard)))
            .take(self.batch_size)
            .collect()
    }
}
