//! Shard worker actor.
//!
//! Each worker exclusively owns the [`Scanner`] and [`BarAggregator`] for its slice of the
//! symbol universe and is reached only through its bounded command channel, so no symbol is
//! ever mutated from two tasks.

use crate::{
    alert::AlertQueue,
    bar::{Bar, BarAggregator, BarUpdate},
    config::ScannerConfig,
    error::ScannerError,
    event::{Quote, Trade},
    scanner::{ScanStats, Scanner},
    state::SymbolState,
};
use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace};

/// Dirty states handed to the flusher, with the shard's cumulative counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDrain {
    pub shard: usize,
    pub states: Vec<SymbolState>,
    pub stats: ScanStats,
    pub late_ticks: u64,
}

#[derive(Debug)]
pub enum ShardCommand {
    Quote {
        symbol: SmolStr,
        quote: Quote,
    },
    Trade {
        symbol: SmolStr,
        trade: Trade,
    },
    /// Fallback price from the stale refresher.
    Synthetic {
        symbol: SmolStr,
        price: f64,
        time: DateTime<Utc>,
    },
    StaleSymbols {
        now: DateTime<Utc>,
        max_age: Duration,
        limit: usize,
        reply: oneshot::Sender<Vec<SmolStr>>,
    },
    DrainStates {
        reply: oneshot::Sender<StateDrain>,
    },
    /// Completed bars; with `close_open` every open bar is completed first.
    DrainBars {
        close_open: bool,
        reply: oneshot::Sender<Vec<Bar>>,
    },
}

/// Cloneable sending half of a shard's command channel.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: usize,
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Send, waiting for channel capacity. Used by the feed path.
    pub async fn send(&self, command: ShardCommand) -> Result<(), ScannerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ScannerError::ShardClosed(self.id))
    }

    /// Send without waiting. `Ok(false)` if the channel is full.
    pub fn try_send(&self, command: ShardCommand) -> Result<bool, ScannerError> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ScannerError::ShardClosed(self.id)),
        }
    }

    /// Non-blocking request/reply. `Ok(None)` if the channel is full.
    pub fn try_request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ShardCommand,
    ) -> Result<Option<oneshot::Receiver<T>>, ScannerError> {
        let (reply, rx) = oneshot::channel();
        Ok(self.try_send(build(reply))?.then_some(rx))
    }

    /// Request/reply that waits for channel capacity.
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ShardCommand,
    ) -> Result<T, ScannerError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| ScannerError::ShardClosed(self.id))
    }
}

#[derive(Debug)]
pub struct ShardWorker {
    id: usize,
    scanner: Scanner,
    bars: BarAggregator,
    alerts: AlertQueue,
    flush_tx: mpsc::Sender<usize>,
    state_flush_size: usize,
    flush_requested: bool,
}

impl ShardWorker {
    pub fn new(
        id: usize,
        scanner: Scanner,
        config: &ScannerConfig,
        alerts: AlertQueue,
        flush_tx: mpsc::Sender<usize>,
    ) -> Self {
        let bar_capacity = config.max_pending_bars.div_ceil(config.shards.max(1));
        Self {
            id,
            scanner,
            bars: BarAggregator::new(bar_capacity),
            alerts,
            flush_tx,
            state_flush_size: config.state_flush_size.div_ceil(config.shards.max(1)).max(1),
            flush_requested: false,
        }
    }

    pub fn spawn(self, capacity: usize) -> (ShardHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ShardHandle { id: self.id, tx };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ShardCommand>) {
        debug!(shard = self.id, symbols = self.scanner.len(), "shard worker started");

        while let Some(command) = rx.recv().await {
            self.handle(command);
        }

        let stats = self.scanner.stats();
        info!(
            shard = self.id,
            quotes = stats.quotes,
            updated = stats.updated,
            alerts = stats.alerts,
            unflushed_states = self.scanner.dirty_len(),
            unflushed_bars = self.bars.completed_len(),
            "shard worker stopped"
        );
    }

    fn handle(&mut self, command: ShardCommand) {
        match command {
            ShardCommand::Quote { symbol, quote } => self.on_quote(symbol, quote),
            ShardCommand::Trade { symbol, trade } => self.on_trade(symbol, trade),
            ShardCommand::Synthetic {
                symbol,
                price,
                time,
            } => {
                if self.scanner.apply_synthetic(&symbol, price, time) {
                    self.request_flush_if_full();
                } else {
                    debug!(shard = self.id, %symbol, price, "synthetic tick rejected");
                }
            }
            ShardCommand::StaleSymbols {
                now,
                max_age,
                limit,
                reply,
            } => {
                let stale = self.scanner.stale_symbols(now, max_age, limit);
                if reply.send(stale).is_err() {
                    debug!(shard = self.id, "stale symbol requester went away");
                }
            }
            ShardCommand::DrainStates { reply } => {
                self.flush_requested = false;
                let drain = StateDrain {
                    shard: self.id,
                    states: self.scanner.take_dirty(),
                    stats: self.scanner.stats(),
                    late_ticks: self.bars.late_ticks(),
                };
                if let Err(drain) = reply.send(drain) {
                    debug!(
                        shard = self.id,
                        states = drain.states.len(),
                        "state drain requester went away"
                    );
                }
            }
            ShardCommand::DrainBars { close_open, reply } => {
                if close_open {
                    self.bars.close_all();
                }
                if let Err(bars) = reply.send(self.bars.drain_completed()) {
                    debug!(shard = self.id, bars = bars.len(), "bar drain requester went away");
                }
            }
        }
    }

    fn on_quote(&mut self, symbol: SmolStr, quote: Quote) {
        let outcome = self.scanner.process_quote(&symbol, &quote);

        if outcome.disposition.admits_bar() {
            self.update_bar(&symbol, quote.mid(), 0.0, quote.time);
        }
        if let Some(alert) = outcome.alert {
            self.alerts.publish(alert);
        }
        self.request_flush_if_full();
    }

    fn on_trade(&mut self, symbol: SmolStr, trade: Trade) {
        if self.scanner.entry(&symbol).is_none() {
            trace!(shard = self.id, %symbol, "no baseline, dropping trade");
            return;
        }
        self.update_bar(&symbol, trade.price, trade.size, trade.time);
    }

    fn update_bar(&mut self, symbol: &SmolStr, price: f64, volume: f64, time: DateTime<Utc>) {
        if self.bars.update(symbol, price, volume, time) == BarUpdate::Invalid {
            debug!(shard = self.id, %symbol, price, volume, "ignoring invalid bar input");
        }
    }

    fn request_flush_if_full(&mut self) {
        if self.flush_requested || self.scanner.dirty_len() < self.state_flush_size {
            return;
        }
        // Full flusher queue: the interval timer picks this shard up instead.
        self.flush_requested = self.flush_tx.try_send(self.id).is_ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanParams;
    use chrono::TimeZone;

    fn time(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_699_999_980 + secs, 0).unwrap()
    }

    fn quote(price: f64, secs: i64) -> Quote {
        Quote {
            instrument_id: 1,
            bid: price,
            ask: price,
            bid_size: 100.0,
            ask_size: 200.0,
            time: time(secs),
        }
    }

    fn spawn_worker(
        config: &ScannerConfig,
        alerts: &AlertQueue,
    ) -> (ShardHandle, JoinHandle<()>, mpsc::Receiver<usize>) {
        let baselines = [(SmolStr::new("ABC"), 10.0), (SmolStr::new("XYZ"), 2.0)];
        let scanner = Scanner::new(
            ScanParams::from(config),
            baselines.iter().map(|(symbol, close)| (symbol, *close)),
        );
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let (handle, task) =
            ShardWorker::new(0, scanner, config, alerts.clone(), flush_tx).spawn(16);
        (handle, task, flush_rx)
    }

    #[tokio::test]
    async fn test_quote_updates_state_bars_and_alerts() {
        let config = ScannerConfig::default();
        let alerts = AlertQueue::new(8);
        let mut alert_rx = alerts.subscribe();
        let (shard, task, _flush_rx) = spawn_worker(&config, &alerts);

        let abc = SmolStr::new("ABC");
        shard
            .send(ShardCommand::Quote { symbol: abc.clone(), quote: quote(10.35, 1) })
            .await
            .unwrap();
        shard
            .send(ShardCommand::Trade {
                symbol: abc.clone(),
                trade: Trade { instrument_id: 1, price: 10.40, size: 300.0, time: time(2) },
            })
            .await
            .unwrap();
        // unknown symbol trades never open a bar
        shard
            .send(ShardCommand::Trade {
                symbol: SmolStr::new("NOPE"),
                trade: Trade { instrument_id: 9, price: 1.0, size: 1.0, time: time(2) },
            })
            .await
            .unwrap();

        let alert = alert_rx.recv().await.unwrap();
        assert_eq!(alert.symbol, "ABC");
        assert_eq!(alert.reference_price, 10.0);

        let drain = shard.request(|reply| ShardCommand::DrainStates { reply }).await.unwrap();
        assert_eq!(drain.states.len(), 1);
        assert_eq!(drain.states[0].current_price, Some(10.35));
        assert_eq!(drain.stats.alerts, 1);

        let bars = shard
            .request(|reply| ShardCommand::DrainBars { close_open: false, reply })
            .await
            .unwrap();
        assert!(bars.is_empty());

        let bars = shard
            .request(|reply| ShardCommand::DrainBars { close_open: true, reply })
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 10.35);
        assert_eq!(bars[0].close, 10.40);
        assert_eq!(bars[0].volume, 300.0);
        assert_eq!(bars[0].trade_count, 2);

        drop(shard);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_threshold_requests_flush_once() {
        let config = ScannerConfig::default()
            .with_shards(1)
            .with_state_flush(2, Duration::from_secs(5));
        let alerts = AlertQueue::new(8);
        let (shard, _task, mut flush_rx) = spawn_worker(&config, &alerts);

        for symbol in ["ABC", "XYZ"] {
            shard
                .send(ShardCommand::Synthetic { symbol: SmolStr::new(symbol), price: 10.1, time: time(0) })
                .await
                .unwrap();
        }
        assert_eq!(flush_rx.recv().await, Some(0));

        // no second request until the flusher drains
        shard
            .send(ShardCommand::Synthetic { symbol: SmolStr::new("ABC"), price: 10.2, time: time(1) })
            .await
            .unwrap();
        let drain = shard.request(|reply| ShardCommand::DrainStates { reply }).await.unwrap();
        assert_eq!(drain.states.len(), 2);
        assert!(flush_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_threshold_is_split_across_shards() {
        // 4 dirty states across 2 shards: this shard asks at 2
        let config = ScannerConfig::default()
            .with_shards(2)
            .with_state_flush(4, Duration::from_secs(5));
        let alerts = AlertQueue::new(8);
        let (shard, _task, mut flush_rx) = spawn_worker(&config, &alerts);

        shard
            .send(ShardCommand::Synthetic { symbol: SmolStr::new("ABC"), price: 10.1, time: time(0) })
            .await
            .unwrap();
        shard
            .request(|reply| ShardCommand::StaleSymbols {
                now: time(0),
                max_age: Duration::from_secs(600),
                limit: 1,
                reply,
            })
            .await
            .unwrap();
        assert!(flush_rx.try_recv().is_err());

        shard
            .send(ShardCommand::Synthetic { symbol: SmolStr::new("XYZ"), price: 2.1, time: time(0) })
            .await
            .unwrap();
        assert_eq!(flush_rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_stale_symbols_reply() {
        let config = ScannerConfig::default();
        let alerts = AlertQueue::new(8);
        let (shard, _task, _flush_rx) = spawn_worker(&config, &alerts);

        shard
            .send(ShardCommand::Quote { symbol: SmolStr::new("ABC"), quote: quote(10.01, 0) })
            .await
            .unwrap();

        let stale = shard
            .request(|reply| ShardCommand::StaleSymbols {
                now: time(30),
                max_age: Duration::from_secs(600),
                limit: 10,
                reply,
            })
            .await
            .unwrap();
        assert_eq!(stale, vec![SmolStr::new("XYZ")]);
    }
}
