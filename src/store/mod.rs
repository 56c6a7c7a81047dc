//! Score store module
//!
//! Persists the single high-score record behind the `/set` and `/get` routes.
//! The backing service is either process-local memory or a remote realtime
//! database reached over its REST API.

mod memory;
mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Name recorded when a `/set` request omits one
pub const DEFAULT_NAME: &str = "Anon";

/// Errors that can occur while talking to a score store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Database returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("Malformed database document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The high-score record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HighScore {
    pub name: String,
    #[serde(deserialize_with = "score_from_number_or_string")]
    pub score: u64,
}

impl HighScore {
    pub fn new(name: impl Into<String>, score: u64) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

/// Root document as laid out in the database: `{"highscore": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScoreDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highscore: Option<HighScore>,
}

impl From<HighScore> for ScoreDocument {
    fn from(highscore: HighScore) -> Self {
        Self {
            highscore: Some(highscore),
        }
    }
}

/// Older records hold the score as a string.
fn score_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawScore {
        Number(u64),
        Text(String),
    }

    match RawScore::deserialize(deserializer)? {
        RawScore::Number(n) => Ok(n),
        RawScore::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Key-value document store holding one root document
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Overwrite the root document with `score`
    async fn set(&self, score: HighScore) -> StoreResult<()>;

    /// Fetch the most recently set record, `None` if nothing was ever set
    async fn get(&self) -> StoreResult<Option<HighScore>>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
