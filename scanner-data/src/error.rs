use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `scanner-data`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum ScannerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("baseline closes unavailable: {0}")]
    BaselineUnavailable(String),

    #[error("baseline load returned no previous-session closes")]
    BaselineEmpty,

    #[error("historical provider error: {0}")]
    Provider(String),

    #[error("durable store error: {0}")]
    Store(String),

    #[error("feed error: {0}")]
    Feed(String),

    #[error("failed to decode feed message: {0}")]
    Decode(String),

    #[error("shard {0} worker is no longer running")]
    ShardClosed(usize),
}

impl ScannerError {
    /// Determine if an error must stop the process before (or instead of) live ingestion.
    ///
    /// Without previous-session closes percent moves are undefined, so baseline failures are
    /// fatal. Store, provider and feed errors are retried by their owning task.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_fatal(&self) -> bool {
        match self {
            ScannerError::Config(_)
            | ScannerError::BaselineUnavailable(_)
            | ScannerError::BaselineEmpty => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for ScannerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<reqwest::Error> for ScannerError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider(value.to_string())
    }
}

impl From<serde_json::Error> for ScannerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ScannerError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Feed(value.to_string())
    }
}
