//! Periodic persistence of dirty symbol state and completed bars.
//!
//! The flusher never blocks a shard: drains are requested with `try_send` and a busy shard is
//! simply picked up next cycle. A failed write keeps its batch pending; states merge by symbol
//! (newest wins) and bars by `(symbol, time)`, so retries stay idempotent.

use crate::{
    bar::Bar,
    config::ScannerConfig,
    error::ScannerError,
    scanner::ScanStats,
    shard::{ShardCommand, ShardHandle, StateDrain},
    state::SymbolState,
    store::Store,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use futures::future::join_all;
use smol_str::SmolStr;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct Flusher<S> {
    store: S,
    shards: Vec<ShardHandle>,
    state_interval: Duration,
    bar_interval: Duration,
    max_pending_bars: usize,
    pending_states: FnvHashMap<SmolStr, SymbolState>,
    /// Keyed by `(time, symbol)` so the oldest bar is first to go when over the cap.
    pending_bars: BTreeMap<(DateTime<Utc>, SmolStr), Bar>,
    unresolved: Arc<AtomicU64>,
}

impl<S> Flusher<S>
where
    S: Store,
{
    pub fn new(store: S, shards: Vec<ShardHandle>, config: &ScannerConfig) -> Self {
        Self {
            store,
            shards,
            state_interval: config.state_flush_interval,
            bar_interval: config.bar_flush_interval,
            max_pending_bars: config.max_pending_bars.max(1),
            pending_states: FnvHashMap::default(),
            pending_bars: BTreeMap::new(),
            unresolved: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report the dispatcher's unresolved-instrument count alongside shard stats.
    pub fn with_unresolved_counter(self, unresolved: Arc<AtomicU64>) -> Self {
        Self { unresolved, ..self }
    }

    pub fn pending_states(&self) -> usize {
        self.pending_states.len()
    }

    pub fn pending_bars(&self) -> usize {
        self.pending_bars.len()
    }

    /// Run until `shutdown` flips, then perform one final blocking drain of every shard.
    ///
    /// `flush_requests` carries shard ids whose dirty set crossed the size threshold.
    pub async fn run(
        mut self,
        mut flush_requests: mpsc::Receiver<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut state_timer = interval_at(Instant::now() + self.state_interval, self.state_interval);
        state_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bar_timer = interval_at(Instant::now() + self.bar_interval, self.bar_interval);
        bar_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            shards = self.shards.len(),
            state_interval = ?self.state_interval,
            bar_interval = ?self.bar_interval,
            "persistence flusher started"
        );

        loop {
            tokio::select! {
                _ = state_timer.tick() => {
                    let shards: Vec<usize> = (0..self.shards.len()).collect();
                    self.flush_states(&shards).await;
                }
                _ = bar_timer.tick() => self.flush_bars().await,
                Some(shard) = flush_requests.recv() => self.flush_states(&[shard]).await,
                _ = shutdown.changed() => break,
            }
        }

        self.final_flush().await;
    }

    /// Drain dirty states from `shards` without blocking and write everything pending.
    pub async fn flush_states(&mut self, shards: &[usize]) {
        let requests = shards
            .iter()
            .filter_map(|&id| self.shards.get(id))
            .filter_map(|shard| {
                match shard.try_request(|reply| ShardCommand::DrainStates { reply }) {
                    Ok(Some(rx)) => Some(rx),
                    Ok(None) => {
                        debug!(shard = shard.id(), "shard channel full, skipping state drain");
                        None
                    }
                    Err(error) => {
                        warn!(%error, "state drain failed");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let all_shards = requests.len() == self.shards.len();
        let drains = collect_replies(requests).await;
        if all_shards && drains.len() == self.shards.len() {
            log_stats(&drains, self.unresolved.load(Ordering::Relaxed));
        }
        for drain in drains {
            self.retain_states(drain.states);
        }

        self.write_states().await;
    }

    /// Drain completed bars from every shard without blocking and write everything pending.
    pub async fn flush_bars(&mut self) {
        let requests = self
            .shards
            .iter()
            .filter_map(|shard| {
                match shard.try_request(|reply| ShardCommand::DrainBars {
                    close_open: false,
                    reply,
                }) {
                    Ok(Some(rx)) => Some(rx),
                    Ok(None) => {
                        debug!(shard = shard.id(), "shard channel full, skipping bar drain");
                        None
                    }
                    Err(error) => {
                        warn!(%error, "bar drain failed");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        for bars in collect_replies(requests).await {
            self.retain_bars(bars);
        }

        self.write_bars().await;
    }

    /// Wait on every shard, close open bars, and write what remains once.
    pub async fn final_flush(&mut self) {
        let shards = self.shards.clone();
        for shard in &shards {
            match shard
                .request(|reply| ShardCommand::DrainStates { reply })
                .await
            {
                Ok(drain) => self.retain_states(drain.states),
                Err(error) => warn!(%error, "final state drain failed"),
            }

            match shard
                .request(|reply| ShardCommand::DrainBars {
                    close_open: true,
                    reply,
                })
                .await
            {
                Ok(bars) => self.retain_bars(bars),
                Err(error) => warn!(%error, "final bar drain failed"),
            }
        }

        self.write_states().await;
        self.write_bars().await;

        if self.pending_states.is_empty() && self.pending_bars.is_empty() {
            info!("final flush complete");
        } else {
            error!(
                lost_states = self.pending_states.len(),
                lost_bars = self.pending_bars.len(),
                "final flush failed, unwritten data discarded"
            );
        }
    }

    fn retain_states(&mut self, states: Vec<SymbolState>) {
        for state in states {
            self.pending_states.insert(state.symbol.clone(), state);
        }
    }

    fn retain_bars(&mut self, bars: Vec<Bar>) {
        for bar in bars {
            self.pending_bars
                .insert((bar.time, bar.symbol.clone()), bar);
        }

        let overflow = self.pending_bars.len().saturating_sub(self.max_pending_bars);
        if overflow > 0 {
            for _ in 0..overflow {
                self.pending_bars.pop_first();
            }
            warn!(
                dropped = overflow,
                max_pending_bars = self.max_pending_bars,
                "pending bar buffer full, dropped oldest bars"
            );
        }
    }

    async fn write_states(&mut self) {
        if self.pending_states.is_empty() {
            return;
        }
        let batch: Vec<SymbolState> = self.pending_states.values().cloned().collect();
        match self.store.upsert_states(&batch).await {
            Ok(()) => {
                debug!(states = batch.len(), "flushed symbol states");
                self.pending_states.clear();
            }
            Err(error) => warn_retained(&error, "symbol states", batch.len()),
        }
    }

    async fn write_bars(&mut self) {
        if self.pending_bars.is_empty() {
            return;
        }
        let batch: Vec<Bar> = self.pending_bars.values().cloned().collect();
        match self.store.upsert_bars(&batch).await {
            Ok(()) => {
                debug!(bars = batch.len(), "flushed completed bars");
                self.pending_bars.clear();
            }
            Err(error) => warn_retained(&error, "bars", batch.len()),
        }
    }
}

async fn collect_replies<T>(requests: Vec<oneshot::Receiver<T>>) -> Vec<T> {
    join_all(requests)
        .await
        .into_iter()
        .filter_map(|reply| match reply {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("shard stopped before replying to flush request");
                None
            }
        })
        .collect()
}

fn log_stats(drains: &[StateDrain], unresolved: u64) {
    let mut total = ScanStats::default();
    let mut late_ticks = 0;
    for drain in drains {
        total += drain.stats;
        late_ticks += drain.late_ticks;
    }
    info!(
        quotes = total.quotes,
        updated = total.updated,
        gated = total.gated,
        spread_filtered = total.spread_filtered,
        no_baseline = total.no_baseline,
        invalid = total.invalid,
        alerts = total.alerts,
        synthetic = total.synthetic,
        late_ticks,
        unresolved,
        "scan stats"
    );
}

fn warn_retained(error: &ScannerError, what: &str, batch: usize) {
    warn!(
        %error,
        batch,
        time = %Utc::now(),
        "failed to persist {what}, retaining batch for retry"
    );
}
