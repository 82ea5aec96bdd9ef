//! Alert records and the bounded, fire-and-forget queue to the alert sink.
//!
//! The queue is a `tokio::sync::broadcast` channel: publishing never blocks ingestion, and a
//! sink that falls behind loses the oldest pending alerts, logged as a warning on its side.

use crate::sampler::Tier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

/// A finalised price-move alert.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertRecord {
    pub symbol: SmolStr,
    pub trigger_price: f64,
    /// Last alerted price (or previous close) the move is measured from.
    pub reference_price: f64,
    /// Signed move from `reference_price`, in percent.
    pub pct_move: f64,
    pub pct_from_yesterday: Option<f64>,
    pub tier: Tier,
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
}

/// Consumer of finalised alerts. Owns persistence and downstream notification.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn on_alert(&self, alert: AlertRecord);
}

/// [`AlertSink`] that emits each alert as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn on_alert(&self, alert: AlertRecord) {
        info!(
            symbol = %alert.symbol,
            price = alert.trigger_price,
            reference = alert.reference_price,
            pct_move = %format_args!("{:+.2}", alert.pct_move),
            tier = %alert.tier,
            time = %alert.time,
            "ALERT"
        );
    }
}

/// Cloneable publishing half of the alert queue.
#[derive(Debug, Clone)]
pub struct AlertQueue {
    tx: broadcast::Sender<AlertRecord>,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish without blocking. With no subscribed sink the alert is discarded.
    pub fn publish(&self, alert: AlertRecord) {
        if let Err(broadcast::error::SendError(alert)) = self.tx.send(alert) {
            debug!(symbol = %alert.symbol, "no alert sink subscribed, alert discarded");
        }
    }

    pub fn subscribe(&self) -> AlertReceiver {
        AlertReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consuming half of the alert queue.
#[derive(Debug)]
pub struct AlertReceiver {
    rx: broadcast::Receiver<AlertRecord>,
}

impl AlertReceiver {
    /// Next pending alert, skipping past any the receiver lagged over. `None` once every
    /// [`AlertQueue`] handle is dropped.
    pub async fn recv(&mut self) -> Option<AlertRecord> {
        loop {
            match self.rx.recv().await {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "alert sink lagged, dropped oldest pending alerts");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Drive `sink` from `receiver` until the queue closes.
pub fn spawn_alert_dispatcher<Sink>(mut receiver: AlertReceiver, sink: Sink) -> JoinHandle<()>
where
    Sink: AlertSink,
{
    tokio::spawn(async move {
        while let Some(alert) = receiver.recv().await {
            sink.on_alert(alert).await;
        }
        debug!("alert queue closed, dispatcher exiting");
    })
}
