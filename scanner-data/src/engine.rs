//! Shard pool wiring: stable-hash partitioning, event dispatch and graceful shutdown.

use crate::{
    alert::AlertQueue,
    baseline::Baselines,
    config::ScannerConfig,
    directory::SymbolDirectory,
    error::ScannerError,
    event::FeedEvent,
    flusher::Flusher,
    provider::HistoricalProvider,
    refresher::StaleRefresher,
    scanner::{ScanParams, Scanner},
    shard::{ShardCommand, ShardHandle, ShardWorker},
    store::Store,
};
use fnv::FnvHasher;
use smol_str::SmolStr;
use std::{
    hash::Hasher,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Owning shard for `symbol` out of `shards`. Stable across processes and restarts.
pub fn shard_for(symbol: &str, shards: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(symbol.as_bytes());
    (hasher.finish() % shards.max(1) as u64) as usize
}

#[derive(Debug)]
pub struct Engine {
    directory: SymbolDirectory,
    shards: Vec<ShardHandle>,
    shard_tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    flusher_task: JoinHandle<()>,
    refresher_task: JoinHandle<()>,
    unresolved: Arc<AtomicU64>,
}

impl Engine {
    /// Spawn the shard workers, the persistence flusher and the stale symbol refresher.
    pub fn start<S, P>(
        config: &ScannerConfig,
        baselines: &Baselines,
        store: S,
        provider: P,
        alerts: AlertQueue,
    ) -> Self
    where
        S: Store,
        P: HistoricalProvider + 'static,
    {
        let shard_count = config.shards.max(1);
        let params = ScanParams::from(config);

        let mut partitions: Vec<Vec<(&SmolStr, f64)>> = vec![Vec::new(); shard_count];
        for (symbol, close) in baselines.iter() {
            partitions[shard_for(symbol, shard_count)].push((symbol, close));
        }

        let (flush_tx, flush_rx) = mpsc::channel(shard_count);
        let (shards, shard_tasks): (Vec<_>, Vec<_>) = partitions
            .into_iter()
            .enumerate()
            .map(|(id, partition)| {
                let scanner = Scanner::new(params, partition);
                ShardWorker::new(id, scanner, config, alerts.clone(), flush_tx.clone())
                    .spawn(config.shard_channel_capacity)
            })
            .unzip();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let unresolved = Arc::new(AtomicU64::new(0));
        let flusher = Flusher::new(store, shards.clone(), config)
            .with_unresolved_counter(Arc::clone(&unresolved));
        let flusher_task = tokio::spawn(flusher.run(flush_rx, shutdown_rx.clone()));

        let refresher = StaleRefresher::new(provider, shards.clone(), config);
        let refresher_task = tokio::spawn(refresher.run(shutdown_rx));

        info!(
            shards = shard_count,
            symbols = baselines.len(),
            "scanner engine started"
        );

        Self {
            directory: SymbolDirectory::new(),
            shards,
            shard_tasks,
            shutdown_tx,
            flusher_task,
            refresher_task,
            unresolved,
        }
    }

    /// Events dropped because their instrument had no announced symbol.
    pub fn unresolved(&self) -> u64 {
        self.unresolved.load(Ordering::Relaxed)
    }

    /// Route one feed event. Waits for shard capacity so per-symbol order is preserved.
    pub async fn dispatch(&self, event: FeedEvent) -> Result<(), ScannerError> {
        match event {
            FeedEvent::SymbolMapping {
                instrument_id,
                symbol,
            } => {
                self.directory.insert(instrument_id, symbol);
                Ok(())
            }
            FeedEvent::Quote(quote) => match self.directory.resolve(quote.instrument_id) {
                Some(symbol) => {
                    self.shard(&symbol)
                        .send(ShardCommand::Quote { symbol, quote })
                        .await
                }
                None => {
                    self.on_unresolved(quote.instrument_id);
                    Ok(())
                }
            },
            FeedEvent::Trade(trade) => match self.directory.resolve(trade.instrument_id) {
                Some(symbol) => {
                    self.shard(&symbol)
                        .send(ShardCommand::Trade { symbol, trade })
                        .await
                }
                None => {
                    self.on_unresolved(trade.instrument_id);
                    Ok(())
                }
            },
        }
    }

    /// Dispatch everything from `events` until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<FeedEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(error) = self.dispatch(event).await {
                error!(%error, "failed to dispatch feed event");
            }
        }
        debug!("feed event channel closed");
    }

    fn shard(&self, symbol: &str) -> &ShardHandle {
        &self.shards[shard_for(symbol, self.shards.len())]
    }

    fn on_unresolved(&self, instrument_id: u32) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
        trace!(instrument_id, "no symbol mapping, dropping event");
    }

    /// Stop maintenance tasks, flush everything buffered once, then stop the shards.
    pub async fn shutdown(self) {
        info!("scanner engine shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Err(error) = self.refresher_task.await {
            warn!(%error, "stale refresher task failed");
        }
        if let Err(error) = self.flusher_task.await {
            warn!(%error, "flusher task failed");
        }

        drop(self.shards);
        for task in self.shard_tasks {
            if let Err(error) = task.await {
                warn!(%error, "shard worker task failed");
            }
        }
        info!(
            mapped = self.directory.len(),
            unresolved = self.unresolved.load(Ordering::Relaxed),
            "scanner engine stopped"
        );
    }
}
