use chrono::Utc;
use scanner_data::{
    AlertQueue, Engine, InMemoryStore, LogAlertSink, RestHistoricalProvider, ScannerConfig,
    SqliteStore, Store, load_baselines,
    feed::{FeedConfig, spawn_feed},
    spawn_alert_dispatcher,
};
use std::{error::Error, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    init_logging();

    info!("Starting equity tick scanner");

    let config = ScannerConfig::from_env();
    if let Err(error) = config.validate() {
        error!(%error, "invalid configuration");
        return Err(error.into());
    }

    let provider = Arc::new(RestHistoricalProvider::new(&config.historical_url)?);

    // Without previous closes no percent move is defined, so refuse to start
    let baselines = match load_baselines(provider.as_ref(), Utc::now()).await {
        Ok(baselines) => baselines,
        Err(error) => {
            error!(%error, "failed to load previous-session closes, refusing to start");
            return Err(error.into());
        }
    };

    let store: Arc<dyn Store> = match &config.sqlite_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => {
            warn!("SCANNER_SQLITE_PATH not set, persisting to memory only");
            Arc::new(InMemoryStore::new())
        }
    };

    let alerts = AlertQueue::new(config.alert_queue_capacity);
    let dispatcher = spawn_alert_dispatcher(alerts.subscribe(), LogAlertSink);

    let engine = Engine::start(&config, &baselines, store, Arc::clone(&provider), alerts);

    let (event_tx, event_rx) = mpsc::channel(config.shard_channel_capacity);
    let (feed_shutdown_tx, feed_shutdown_rx) = watch::channel(false);
    let feed = spawn_feed(FeedConfig::from(&config), event_tx, feed_shutdown_rx);

    // Dispatch until the feed task exits or the process is interrupted
    tokio::select! {
        _ = engine.run(event_rx) => warn!("feed stopped delivering events"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(error) => error!(%error, "failed to listen for interrupt, shutting down"),
        },
    }

    let _ = feed_shutdown_tx.send(true);
    if let Err(error) = feed.await {
        warn!(%error, "feed task failed");
    }

    engine.shutdown().await;
    if let Err(error) = dispatcher.await {
        warn!(%error, "alert dispatcher failed");
    }

    info!("Equity tick scanner stopped");
    Ok(())
}

/// Initialize logging
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Structured output for log shippers
    if std::env::var("SCANNER_LOG_JSON").is_ok_and(|value| value == "1") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
