//! Live feed messages and their normalised [`FeedEvent`] form.

use crate::error::ScannerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Opaque numeric instrument identifier assigned by the feed.
pub type InstrumentId = u32;

/// Messages received on the live "all symbols" subscription.
///
/// ### Raw Payload Examples
///```json
/// {"type": "symbol_mapping", "instrument_id": 42, "symbol": "abc"}
/// {"type": "quote", "instrument_id": 42, "bid": 10.34, "ask": 10.36,
///  "bid_size": 200, "ask_size": 300, "ts_event": 1700000000123}
/// {"type": "trade", "instrument_id": 42, "price": 10.35, "size": 100, "ts_event": 1700000000124}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    SymbolMapping {
        instrument_id: InstrumentId,
        symbol: String,
    },
    Quote {
        instrument_id: InstrumentId,
        bid: f64,
        ask: f64,
        #[serde(default)]
        bid_size: f64,
        #[serde(default)]
        ask_size: f64,
        /// Epoch milliseconds.
        ts_event: i64,
    },
    Trade {
        instrument_id: InstrumentId,
        price: f64,
        #[serde(default)]
        size: f64,
        ts_event: i64,
    },
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
    Heartbeat {
        #[serde(default)]
        ts: Option<i64>,
    },
}

/// Best bid/offer update for one instrument.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Quote {
    pub instrument_id: InstrumentId,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub time: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// `(ask - bid) / mid`, `None` for a crossed-to-zero or non-positive book.
    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid();
        (mid > 0.0).then(|| (self.ask - self.bid) / mid)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Trade {
    pub instrument_id: InstrumentId,
    pub price: f64,
    pub size: f64,
    pub time: DateTime<Utc>,
}

/// Normalised feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    SymbolMapping {
        instrument_id: InstrumentId,
        symbol: SmolStr,
    },
    Quote(Quote),
    Trade(Trade),
}

impl FeedMessage {
    /// Normalise a wire message. Control messages yield `Ok(None)`.
    pub fn into_event(self) -> Result<Option<FeedEvent>, ScannerError> {
        match self {
            FeedMessage::SymbolMapping {
                instrument_id,
                symbol,
            } => {
                let symbol = symbol.trim();
                if symbol.is_empty() {
                    return Err(ScannerError::Decode(format!(
                        "empty symbol for instrument {instrument_id}"
                    )));
                }
                Ok(Some(FeedEvent::SymbolMapping {
                    instrument_id,
                    symbol: SmolStr::new(symbol.to_uppercase()),
                }))
            }
            FeedMessage::Quote {
                instrument_id,
                bid,
                ask,
                bid_size,
                ask_size,
                ts_event,
            } => {
                if !(bid.is_finite() && ask.is_finite()) {
                    return Err(ScannerError::Decode(format!(
                        "non-finite quote for instrument {instrument_id}"
                    )));
                }
                Ok(Some(FeedEvent::Quote(Quote {
                    instrument_id,
                    bid,
                    ask,
                    bid_size,
                    ask_size,
                    time: time_from_millis(ts_event)?,
                })))
            }
            FeedMessage::Trade {
                instrument_id,
                price,
                size,
                ts_event,
            } => Ok(Some(FeedEvent::Trade(Trade {
                instrument_id,
                price,
                size,
                time: time_from_millis(ts_event)?,
            }))),
            FeedMessage::Welcome { .. } | FeedMessage::Heartbeat { .. } => Ok(None),
        }
    }
}

/// Decode and normalise one text frame from the feed.
pub fn parse_feed_text(text: &str) -> Result<Option<FeedEvent>, ScannerError> {
    serde_json::from_str::<FeedMessage>(text)?.into_event()
}

fn time_from_millis(ts_event: i64) -> Result<DateTime<Utc>, ScannerError> {
    DateTime::from_timestamp_millis(ts_event)
        .ok_or_else(|| ScannerError::Decode(format!("ts_event out of range: {ts_event}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feed_text() {
        struct TestCase {
            input: &'static str,
            expected: Result<Option<FeedEvent>, ScannerError>,
        }

        let time = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();

        let tests = vec![
            TestCase {
                // TC0: symbol mapping is upper-cased
                input: r#"{"type": "symbol_mapping", "instrument_id": 42, "symbol": " abc "}"#,
                expected: Ok(Some(FeedEvent::SymbolMapping {
                    instrument_id: 42,
                    symbol: SmolStr::new("ABC"),
                })),
            },
            TestCase {
                // TC1: quote w/ sizes
                input: r#"{"type": "quote", "instrument_id": 42, "bid": 10.34, "ask": 10.36,
                           "bid_size": 200, "ask_size": 300, "ts_event": 1700000000123}"#,
                expected: Ok(Some(FeedEvent::Quote(Quote {
                    instrument_id: 42,
                    bid: 10.34,
                    ask: 10.36,
                    bid_size: 200.0,
                    ask_size: 300.0,
                    time,
                }))),
            },
            TestCase {
                // TC2: trade w/o size defaults to zero
                input: r#"{"type": "trade", "instrument_id": 7, "price": 2.3, "ts_event": 1700000000123}"#,
                expected: Ok(Some(FeedEvent::Trade(Trade {
                    instrument_id: 7,
                    price: 2.3,
                    size: 0.0,
                    time,
                }))),
            },
            TestCase {
                // TC3: heartbeat is ignored
                input: r#"{"type": "heartbeat"}"#,
                expected: Ok(None),
            },
            TestCase {
                // TC4: quote missing bid is a decode error
                input: r#"{"type": "quote", "instrument_id": 42, "ask": 10.36, "ts_event": 1}"#,
                expected: Err(ScannerError::Decode(String::new())),
            },
            TestCase {
                // TC5: empty symbol mapping is a decode error
                input: r#"{"type": "symbol_mapping", "instrument_id": 1, "symbol": "  "}"#,
                expected: Err(ScannerError::Decode(String::new())),
            },
            TestCase {
                // TC6: unknown type is a decode error
                input: r#"{"type": "imbalance", "instrument_id": 1}"#,
                expected: Err(ScannerError::Decode(String::new())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_feed_text(test.input);
            match (actual, test.expected) {
                (Ok(actual), Ok(expected)) => {
                    assert_eq!(actual, expected, "TC{} failed", index)
                }
                (Err(ScannerError::Decode(_)), Err(ScannerError::Decode(_))) => {
                    // Test passed
                }
                (actual, expected) => {
                    // Test failed
                    panic!(
                        "TC{index} failed because actual != expected. \nActual: {actual:?}\nExpected: {expected:?}\n"
                    );
                }
            }
        }
    }

    #[test]
    fn test_quote_mid_and_spread() {
        let quote = Quote {
            instrument_id: 1,
            bid: 5.00,
            ask: 5.20,
            bid_size: 1.0,
            ask_size: 1.0,
            time: Utc::now(),
        };
        assert!((quote.mid() - 5.10).abs() < 1e-9);
        assert!((quote.spread_pct().unwrap() - 0.0392).abs() < 1e-4);

        let empty = Quote {
            bid: 0.0,
            ask: 0.0,
            ..quote
        };
        assert_eq!(empty.spread_pct(), None);
    }
}
