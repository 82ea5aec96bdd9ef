//! Historical OHLCV range queries against the market-data vendor.

use crate::error::ScannerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use itertools::Itertools;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;
use url::Url;

/// One historical bar as returned by the vendor.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoricalBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

#[derive(Debug, Display, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Timeframe {
    #[display("1m")]
    Minute,
    #[display("1d")]
    Day,
}

/// Which symbols a range query covers.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SymbolSelection<'a> {
    /// The full tradable universe.
    All,
    List(&'a [SmolStr]),
}

pub type BarsBySymbol = FnvHashMap<SmolStr, Vec<HistoricalBar>>;

#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    /// Fetch bars in `[start, end)` for each requested symbol, oldest first.
    async fn get_bars(
        &self,
        symbols: SymbolSelection<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarsBySymbol, ScannerError>;
}

#[async_trait]
impl<P: HistoricalProvider + ?Sized> HistoricalProvider for std::sync::Arc<P> {
    async fn get_bars(
        &self,
        symbols: SymbolSelection<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarsBySymbol, ScannerError> {
        (**self).get_bars(symbols, start, end, timeframe).await
    }
}

/// REST response body: `{"bars": {"ABC": [{..}, ..]}}`.
#[derive(Debug, Deserialize)]
struct BarsResponse {
    bars: FnvHashMap<String, Vec<HistoricalBar>>,
}

/// [`HistoricalProvider`] over the vendor's `GET /v1/bars` REST endpoint.
#[derive(Debug, Clone)]
pub struct RestHistoricalProvider {
    client: Client,
    base_url: Url,
}

impl RestHistoricalProvider {
    pub fn new(base_url: &str) -> Result<Self, ScannerError> {
        let base_url = Url::parse(base_url)
            .map_err(|error| ScannerError::Config(format!("historical url {base_url}: {error}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|error| ScannerError::Config(format!("http client: {error}")))?;
        Ok(Self { client, base_url })
    }

    fn bars_url(
        &self,
        symbols: SymbolSelection<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<Url, ScannerError> {
        let mut url = self
            .base_url
            .join("v1/bars")
            .map_err(|error| ScannerError::Config(error.to_string()))?;

        let symbols = match symbols {
            SymbolSelection::All => "ALL".to_string(),
            SymbolSelection::List(symbols) => symbols.iter().join(","),
        };

        url.query_pairs_mut()
            .append_pair("symbols", &symbols)
            .append_pair("start", &start.to_rfc3339())
            .append_pair("end", &end.to_rfc3339())
            .append_pair("timeframe", &timeframe.to_string());

        Ok(url)
    }
}

#[async_trait]
impl HistoricalProvider for RestHistoricalProvider {
    async fn get_bars(
        &self,
        symbols: SymbolSelection<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarsBySymbol, ScannerError> {
        let url = self.bars_url(symbols, start, end, timeframe)?;

        let response = self.client.get(url).send().await?;
        if let Err(status_err) = response.error_for_status_ref() {
            return Err(ScannerError::Provider(format!(
                "historical bars request failed ({timeframe}): {status_err}"
            )));
        }

        let body = response.json::<BarsResponse>().await?;

        Ok(body
            .bars
            .into_iter()
            .map(|(symbol, mut bars)| {
                bars.sort_by_key(|bar| bar.timestamp);
                (SmolStr::new(symbol.to_uppercase()), bars)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bars_url() {
        let provider = RestHistoricalProvider::new("http://vendor.local:8766/").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let symbols = [SmolStr::new("ABC"), SmolStr::new("XYZ")];

        let url = provider
            .bars_url(SymbolSelection::List(&symbols), start, end, Timeframe::Minute)
            .unwrap();
        let pairs: FnvHashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/v1/bars");
        assert_eq!(pairs["symbols"], "ABC,XYZ");
        assert_eq!(pairs["timeframe"], "1m");
        assert_eq!(pairs["start"], "2024-03-01T14:30:00+00:00");

        let url = provider
            .bars_url(SymbolSelection::All, start, end, Timeframe::Day)
            .unwrap();
        let pairs: FnvHashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["symbols"], "ALL");
        assert_eq!(pairs["timeframe"], "1d");
    }

    #[test]
    fn test_invalid_base_url() {
        let error = RestHistoricalProvider::new("not a url").unwrap_err();
        assert!(matches!(error, ScannerError::Config(_)));
    }

    #[test]
    fn test_de_bars_response() {
        let input = r#"
            {
                "bars": {
                    "abc": [
                        {"timestamp": "2024-03-01T14:31:00Z", "open": 10.0, "high": 10.2,
                         "low": 9.9, "close": 10.1, "volume": 1200},
                        {"timestamp": "2024-03-01T14:30:00Z", "open": 9.9, "high": 10.0,
                         "low": 9.8, "close": 10.0}
                    ]
                }
            }
        "#;

        let actual = serde_json::from_str::<BarsResponse>(input).unwrap();
        let bars = &actual.bars["abc"];
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 10.1);
        assert_eq!(bars[1].volume, 0.0);
    }
}
