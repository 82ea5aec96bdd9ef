#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Scanner-Data
//! Real-time equity tick scanner. Consumes an "all symbols" quote/trade feed, keeps per-symbol
//! intraday state (price, day open, trailing snapshots, high/low of day, percent moves),
//! fires cooldown-gated price-move alerts, aggregates 1-minute OHLCV bars and persists both
//! to a durable store.
//!
//! ## Architecture
//! Symbols are partitioned by a stable hash across a fixed pool of shard workers. Each
//! [`shard::ShardWorker`] exclusively owns the [`scanner::Scanner`] and [`bar::BarAggregator`]
//! for its symbols, so the hot path takes no locks:
//!
//! ```text
//! feed ─► Engine::dispatch ─► ShardWorker[hash(symbol) % N] ─► AlertQueue ─► AlertSink
//!                                   ▲        │
//!              StaleRefresher ──────┘        └──► Flusher ─► Store
//! ```
//!
//! * Feed dispatch waits for shard capacity, preserving per-symbol order.
//! * The [`flusher::Flusher`] and [`refresher::StaleRefresher`] only ever `try_send` into a
//!   shard and skip the cycle when it is busy.
//! * Alerts are published over a bounded queue that drops the oldest pending alert instead of
//!   stalling ingestion.
//!
//! ## Startup
//! [`baseline::load_baselines`] must succeed before any event is processed; without the
//! previous close no percent move is defined.

/// Previous-session closes loaded once at startup.
pub mod baseline;

/// 1-minute OHLCV bar aggregation.
pub mod bar;

/// Alert records, the bounded alert queue and the [`alert::AlertSink`] seam.
pub mod alert;

/// [`config::ScannerConfig`] and its environment loader.
pub mod config;

/// Instrument id to ticker lookup.
pub mod directory;

/// Engine wiring the shard pool, flusher and refresher together.
pub mod engine;

/// All [`Error`](std::error::Error)s generated in Scanner-Data.
pub mod error;

/// Feed wire messages and normalised events.
pub mod event;

/// Live WebSocket feed client.
pub mod feed;

/// Periodic persistence task.
pub mod flusher;

/// Historical OHLCV provider.
pub mod provider;

/// Stale symbol refresher task.
pub mod refresher;

/// Priority tiers and the sampling gate.
pub mod sampler;

/// Per-event tick processor.
pub mod scanner;

/// Shard worker actor and its command channel.
pub mod shard;

/// Per-symbol intraday state and alert cooldown.
pub mod state;

/// Durable store for symbol state and bars.
pub mod store;

pub use alert::{AlertQueue, AlertRecord, AlertSink, LogAlertSink, spawn_alert_dispatcher};
pub use baseline::{Baselines, load_baselines};
pub use config::ScannerConfig;
pub use engine::Engine;
pub use error::ScannerError;
pub use event::FeedEvent;
pub use provider::{HistoricalProvider, RestHistoricalProvider};
pub use store::{InMemoryStore, SqliteStore, Store};
