//! Realtime-database score store
//!
//! Reads and writes the root document through the database's REST API:
//! `PUT {url}/.json` replaces it, `GET {url}/.json` returns it (or `null`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{HighScore, ScoreDocument, ScoreStore, StoreError, StoreResult};
use crate::config::DatabaseSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Score store backed by a remote realtime database
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
    root_url: String,
    auth: Option<String>,
}

impl RemoteStore {
    pub fn new(settings: &DatabaseSettings) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            root_url: format!("{}/.json", settings.url.trim_end_matches('/')),
            auth: settings.auth.clone(),
        }
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, &self.root_url);
        match &self.auth {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }
}

#[async_trait]
impl ScoreStore for RemoteStore {
    async fn set(&self, score: HighScore) -> StoreResult<()> {
        let document = ScoreDocument::from(score);
        let response = self
            .request(reqwest::Method::PUT)
            .json(&document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status));
        }
        debug!("Stored high score at {}", self.root_url);
        Ok(())
    }

    async fn get(&self) -> StoreResult<Option<HighScore>> {
        let response = self.request(reqwest::Method::GET).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status));
        }

        let body = response.text().await?;
        let document: Option<ScoreDocument> = serde_json::from_str(&body)?;
        Ok(document.and_then(|d| d.highscore))
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }
}
