//! Durable storage for symbol state and minute bars.
//!
//! Both tables are written with keyed upserts (`symbol` for state, `(symbol, time)` for bars)
//! so a batch retried after a failure can be written again safely.

use crate::{bar::Bar, error::ScannerError, state::SymbolState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use smol_str::SmolStr;
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::info;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert-or-update keyed by `symbol`.
    async fn upsert_states(&self, states: &[SymbolState]) -> Result<(), ScannerError>;

    /// Insert-or-update keyed by `(symbol, time)`.
    async fn upsert_bars(&self, bars: &[Bar]) -> Result<(), ScannerError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn upsert_states(&self, states: &[SymbolState]) -> Result<(), ScannerError> {
        (**self).upsert_states(states).await
    }

    async fn upsert_bars(&self, bars: &[Bar]) -> Result<(), ScannerError> {
        (**self).upsert_bars(bars).await
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    states: FnvHashMap<SmolStr, SymbolState>,
    bars: BTreeMap<(SmolStr, DateTime<Utc>), Bar>,
}

/// In-process [`Store`] used for dry runs and tests. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`ScannerError::Store`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), ScannerError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(ScannerError::Store("injected write failure".to_string()));
        }
        Ok(())
    }

    pub fn state(&self, symbol: &str) -> Option<SymbolState> {
        self.tables.lock().states.get(symbol).cloned()
    }

    pub fn state_count(&self) -> usize {
        self.tables.lock().states.len()
    }

    /// Every stored bar ordered by `(symbol, time)`.
    pub fn bars(&self) -> Vec<Bar> {
        self.tables.lock().bars.values().cloned().collect()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_states(&self, states: &[SymbolState]) -> Result<(), ScannerError> {
        self.check_failure()?;
        let mut tables = self.tables.lock();
        for state in states {
            tables.states.insert(state.symbol.clone(), state.clone());
        }
        Ok(())
    }

    async fn upsert_bars(&self, bars: &[Bar]) -> Result<(), ScannerError> {
        self.check_failure()?;
        let mut tables = self.tables.lock();
        for bar in bars {
            tables
                .bars
                .insert((bar.symbol.clone(), bar.time), bar.clone());
        }
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_state (
    symbol TEXT PRIMARY KEY,
    current_price REAL NULL,
    bid REAL NULL,
    ask REAL NULL,
    price_time_ms INTEGER NULL,
    yesterday_close REAL NOT NULL,
    today_open REAL NULL,
    snapshot_5min_price REAL NULL,
    snapshot_5min_time_ms INTEGER NULL,
    snapshot_15min_price REAL NULL,
    snapshot_15min_time_ms INTEGER NULL,
    hod_price REAL NULL,
    hod_pct REAL NULL,
    hod_time_ms INTEGER NULL,
    lod_price REAL NULL,
    lod_pct REAL NULL,
    lod_time_ms INTEGER NULL,
    pct_from_yesterday REAL NULL,
    pct_from_open REAL NULL,
    pct_from_5min REAL NULL,
    pct_from_15min REAL NULL,
    spread_pct REAL NULL,
    last_updated_ms INTEGER NULL
);

CREATE TABLE IF NOT EXISTS price_bars (
    symbol TEXT NOT NULL,
    time_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trade_count INTEGER NOT NULL,
    PRIMARY KEY (symbol, time_ms)
);
"#;

const UPSERT_STATE: &str = r#"
INSERT INTO symbol_state (
    symbol, current_price, bid, ask, price_time_ms, yesterday_close, today_open,
    snapshot_5min_price, snapshot_5min_time_ms, snapshot_15min_price, snapshot_15min_time_ms,
    hod_price, hod_pct, hod_time_ms, lod_price, lod_pct, lod_time_ms,
    pct_from_yesterday, pct_from_open, pct_from_5min, pct_from_15min,
    spread_pct, last_updated_ms
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
    ?8, ?9, ?10, ?11,
    ?12, ?13, ?14, ?15, ?16, ?17,
    ?18, ?19, ?20, ?21,
    ?22, ?23
)
ON CONFLICT(symbol) DO UPDATE SET
    current_price = excluded.current_price,
    bid = excluded.bid,
    ask = excluded.ask,
    price_time_ms = excluded.price_time_ms,
    yesterday_close = excluded.yesterday_close,
    today_open = excluded.today_open,
    snapshot_5min_price = excluded.snapshot_5min_price,
    snapshot_5min_time_ms = excluded.snapshot_5min_time_ms,
    snapshot_15min_price = excluded.snapshot_15min_price,
    snapshot_15min_time_ms = excluded.snapshot_15min_time_ms,
    hod_price = excluded.hod_price,
    hod_pct = excluded.hod_pct,
    hod_time_ms = excluded.hod_time_ms,
    lod_price = excluded.lod_price,
    lod_pct = excluded.lod_pct,
    lod_time_ms = excluded.lod_time_ms,
    pct_from_yesterday = excluded.pct_from_yesterday,
    pct_from_open = excluded.pct_from_open,
    pct_from_5min = excluded.pct_from_5min,
    pct_from_15min = excluded.pct_from_15min,
    spread_pct = excluded.spread_pct,
    last_updated_ms = excluded.last_updated_ms
"#;

const UPSERT_BAR: &str = r#"
INSERT INTO price_bars (symbol, time_ms, open, high, low, close, volume, trade_count)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(symbol, time_ms) DO UPDATE SET
    open = excluded.open,
    high = excluded.high,
    low = excluded.low,
    close = excluded.close,
    volume = excluded.volume,
    trade_count = excluded.trade_count
"#;

/// SQLite-backed [`Store`]. Each batch is one transaction run on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ScannerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        info!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ScannerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ScannerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_transaction<F>(&self, write: F) -> Result<(), ScannerError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<(), rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            write(&tx)?;
            tx.commit()?;
            Ok::<_, ScannerError>(())
        })
        .await
        .map_err(|error| ScannerError::Store(format!("sqlite writer task failed: {error}")))?
    }

    pub fn bar_count(&self) -> Result<usize, ScannerError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM price_bars", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Stored bars for `symbol`, oldest first.
    pub fn load_bars(&self, symbol: &str) -> Result<Vec<Bar>, ScannerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time_ms, open, high, low, close, volume, trade_count
             FROM price_bars WHERE symbol = ?1 ORDER BY time_ms",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            let time_ms: i64 = row.get(0)?;
            let trade_count: i64 = row.get(6)?;
            Ok(Bar {
                symbol: SmolStr::new(symbol),
                time: DateTime::from_timestamp_millis(time_ms).unwrap_or_default(),
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
                trade_count: trade_count.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `(current_price, last_updated)` for `symbol`, if a row exists.
    pub fn load_price(
        &self,
        symbol: &str,
    ) -> Result<Option<(Option<f64>, Option<DateTime<Utc>>)>, ScannerError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT current_price, last_updated_ms FROM symbol_state WHERE symbol = ?1")?;
        let mut rows = stmt.query(params![symbol])?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => {
                let price: Option<f64> = row.get(0)?;
                let updated: Option<i64> = row.get(1)?;
                Ok(Some((price, updated.and_then(DateTime::from_timestamp_millis))))
            }
        }
    }
}

fn millis(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|time| time.timestamp_millis())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_states(&self, states: &[SymbolState]) -> Result<(), ScannerError> {
        if states.is_empty() {
            return Ok(());
        }
        let states = states.to_vec();
        self.with_transaction(move |tx| {
            let mut stmt = tx.prepare_cached(UPSERT_STATE)?;
            for state in &states {
                stmt.execute(params![
                    state.symbol.as_str(),
                    state.current_price,
                    state.bid,
                    state.ask,
                    millis(state.price_time),
                    state.yesterday_close,
                    state.today_open,
                    state.snapshot_5min.map(|snapshot| snapshot.price),
                    millis(state.snapshot_5min.map(|snapshot| snapshot.captured_at)),
                    state.snapshot_15min.map(|snapshot| snapshot.price),
                    millis(state.snapshot_15min.map(|snapshot| snapshot.captured_at)),
                    state.hod.map(|hod| hod.price),
                    state.hod.map(|hod| hod.pct),
                    millis(state.hod.map(|hod| hod.time)),
                    state.lod.map(|lod| lod.price),
                    state.lod.map(|lod| lod.pct),
                    millis(state.lod.map(|lod| lod.time)),
                    state.pct_from_yesterday,
                    state.pct_from_open,
                    state.pct_from_5min,
                    state.pct_from_15min,
                    state.spread_pct,
                    millis(state.last_updated),
                ])?;
            }
            Ok(())
        })
        .await
    }

    async fn upsert_bars(&self, bars: &[Bar]) -> Result<(), ScannerError> {
        if bars.is_empty() {
            return Ok(());
        }
        let bars = bars.to_vec();
        self.with_transaction(move |tx| {
            let mut stmt = tx.prepare_cached(UPSERT_BAR)?;
            for bar in &bars {
                stmt.execute(params![
                    bar.symbol.as_str(),
                    bar.time.timestamp_millis(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.trade_count as i64,
                ])?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PriceUpdate;
    use chrono::TimeZone;
    use std::time::Duration;

    fn bar(symbol: &str, minute: i64, close: f64) -> Bar {
        Bar {
            symbol: SmolStr::new(symbol),
            time: Utc.timestamp_opt(1_699_999_980 + minute * 60, 0).unwrap(),
            open: 10.0,
            high: 10.5,
            low: 9.5,
            close,
            volume: 1_000.0,
            trade_count: 12,
        }
    }

    fn state(symbol: &str, price: f64) -> SymbolState {
        let mut state = SymbolState::new(symbol, 10.0);
        state.apply_price(
            PriceUpdate {
                price,
                bid: price,
                ask: price,
                spread_pct: 0.0,
                time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            },
            Duration::from_secs(300),
            Duration::from_secs(900),
        );
        state
    }

    #[tokio::test]
    async fn test_sqlite_bar_upsert_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bars = vec![bar("ABC", 0, 10.1), bar("ABC", 1, 10.2)];

        store.upsert_bars(&bars).await.unwrap();
        store.upsert_bars(&bars).await.unwrap();

        assert_eq!(store.bar_count().unwrap(), 2);
        assert_eq!(store.load_bars("ABC").unwrap(), bars);

        // same key, new values: row is updated in place
        store.upsert_bars(&[bar("ABC", 1, 10.3)]).await.unwrap();
        let loaded = store.load_bars("ABC").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].close, 10.3);
    }

    #[tokio::test]
    async fn test_sqlite_state_upsert_keyed_by_symbol() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.upsert_states(&[state("ABC", 10.35)]).await.unwrap();
        store
            .upsert_states(&[state("ABC", 10.50), state("XYZ", 2.30)])
            .await
            .unwrap();

        let (price, updated) = store.load_price("ABC").unwrap().unwrap();
        assert_eq!(price, Some(10.50));
        assert_eq!(updated, Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        assert!(store.load_price("XYZ").unwrap().is_some());
        assert!(store.load_price("NOPE").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_upserts_and_injected_failures() {
        let store = InMemoryStore::new();
        store.fail_next(1);

        let bars = vec![bar("ABC", 0, 10.1)];
        assert!(matches!(
            store.upsert_bars(&bars).await,
            Err(ScannerError::Store(_))
        ));
        assert!(store.bars().is_empty());

        store.upsert_bars(&bars).await.unwrap();
        store.upsert_bars(&bars).await.unwrap();
        assert_eq!(store.bars(), bars);

        store.upsert_states(&[state("ABC", 10.35)]).await.unwrap();
        store.upsert_states(&[state("ABC", 10.50)]).await.unwrap();
        assert_eq!(store.state_count(), 1);
        assert_eq!(store.state("ABC").unwrap().current_price, Some(10.50));
    }
}
