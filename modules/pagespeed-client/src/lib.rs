//! HTTP client for the PageSpeed Insights v5 API.
//!
//! Issues a single measurement run per call and extracts the
//! `lighthouseResult` document into an [`InsightBundle`]. Quota
//! accounting happens in the caller; this client only talks HTTP.

pub mod error;
pub mod types;

pub use error::{PageSpeedError, Result};
pub use types::{CategoryReport, FailedAudit, InsightBundle};

use std::time::Duration;

pub struct PageSpeedClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PageSpeedClient {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
        }
    }

    /// Run a measurement and return the raw `lighthouseResult` document.
    pub async fn run(&self, url: &str, strategy: &str) -> Result<serde_json::Value> {
        tracing::debug!(url, strategy, "Calling measurement API");

        let mut params = vec![
            ("url", url),
            ("strategy", strategy),
            ("category", "performance"),
            ("category", "seo"),
            ("category", "accessibility"),
        ];
        if let Some(ref key) = self.api_key {
            params.push(("key", key));
        }

        let resp = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PageSpeedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = resp.json().await?;
        body.get("lighthouseResult").cloned().ok_or_else(|| {
            PageSpeedError::Parse("response missing lighthouseResult".to_string())
        })
    }

    /// Run a measurement and extract the insight bundle in one call.
    pub async fn fetch_insights(&self, url: &str, strategy: &str) -> Result<InsightBundle> {
        let result = self.run(url, strategy).await?;
        InsightBundle::from_lighthouse_result(&result)
    }
}
