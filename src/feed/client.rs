// =============================================================================
// Feed Client — HTTP fetch of the signals document
// =============================================================================
//
// The producer publishes a static JSON file. Intermediate caches tend to hold
// on to it, so every request carries a `t=<unix millis>` query parameter.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::feed::record::FeedDocument;

/// Request timeout for a single feed fetch.
const FETCH_TIMEOUT_SECS: u64 = 10;

/// Fetches the feed document from a fixed URL.
#[derive(Clone)]
pub struct FeedClient {
    url: String,
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(concat!("signal-deck/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build feed HTTP client")?;

        let url = url.into();
        debug!(url = %url, "FeedClient initialised");
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// GET the feed document.
    #[instrument(skip(self), name = "feed::fetch", fields(url = %self.url))]
    pub async fn fetch(&self) -> Result<FeedDocument> {
        let cache_buster = Utc::now().timestamp_millis().to_string();

        let resp = self
            .client
            .get(&self.url)
            .query(&[("t", cache_buster.as_str())])
            .send()
            .await
            .context("feed request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("feed returned HTTP {status}");
        }

        let doc: FeedDocument = resp
            .json()
            .await
            .context("failed to parse feed document")?;

        debug!(records = doc.signals.len(), "feed document fetched");
        Ok(doc)
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient").field("url", &self.url).finish()
    }
}
