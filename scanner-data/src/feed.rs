//! Live WebSocket feed client with auto-reconnect and idle detection.

use crate::{
    config::ScannerConfig,
    event::{FeedEvent, parse_feed_text},
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Ends the inner stream if it yields nothing for `timeout`, so a silently dead socket
/// falls through to the reconnect path.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let timeout = self.timeout;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "feed idle timeout, no data received"
                    );
                    self.deadline.as_mut().reset(Instant::now() + timeout);
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Subscription sent on every (re)connect.
#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    channels: [&'a str; 2],
    symbols: &'a str,
}

const SUBSCRIBE_ALL: SubscribeRequest<'static> = SubscribeRequest {
    kind: "subscribe",
    channels: ["quotes", "trades"],
    symbols: "*",
};

/// What to do with one WebSocket frame.
#[derive(Debug, PartialEq)]
enum Frame {
    Event(FeedEvent),
    Skip,
    Close,
}

fn decode_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => match parse_feed_text(&text) {
            Ok(Some(event)) => Frame::Event(event),
            Ok(None) => Frame::Skip,
            Err(error) => {
                let raw = text.as_str();
                debug!(
                    %error,
                    raw = raw.get(..100).unwrap_or(raw),
                    "failed to decode feed message"
                );
                Frame::Skip
            }
        },
        Message::Close(frame) => {
            info!(?frame, "feed server closed connection");
            Frame::Close
        }
        // tungstenite answers pings itself
        _ => Frame::Skip,
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl From<&ScannerConfig> for FeedConfig {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            url: config.feed_url.clone(),
            idle_timeout: config.feed_idle_timeout,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Spawn the feed loop. It reconnects until `shutdown` flips or `events` is dropped.
pub fn spawn_feed(
    config: FeedConfig,
    events: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_feed_loop(config, events, shutdown))
}

async fn run_feed_loop(
    config: FeedConfig,
    events: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(url = %config.url, "starting market data feed");

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "connected to market data feed");
                let (mut write, read) = ws_stream.split();

                let subscribe = match serde_json::to_string(&SUBSCRIBE_ALL) {
                    Ok(subscribe) => subscribe,
                    Err(error) => {
                        error!(%error, "failed to encode subscription");
                        return;
                    }
                };
                if let Err(error) = write.send(Message::Text(subscribe.into())).await {
                    error!(%error, "failed to subscribe to feed");
                } else {
                    let mut read = TimeoutStream::new(read, config.idle_timeout);
                    loop {
                        let message = tokio::select! {
                            message = read.next() => message,
                            _ = shutdown.changed() => {
                                info!("feed shutting down");
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        };

                        match message {
                            Some(Ok(message)) => match decode_frame(message) {
                                Frame::Event(event) => {
                                    if events.send(event).await.is_err() {
                                        warn!("feed event receiver dropped, stopping feed");
                                        return;
                                    }
                                }
                                Frame::Skip => {}
                                Frame::Close => break,
                            },
                            Some(Err(error)) => {
                                error!(%error, "feed socket error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
                warn!("feed connection lost, will reconnect");
            }
            Err(error) => error!(url = %config.url, %error, "failed to connect to feed"),
        }

        debug!(delay = ?config.reconnect_delay, "waiting before reconnecting to feed");
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => {
                info!("feed shutting down");
                return;
            }
        }
    }
}
