//! Gamma Market Resolver
//!
//! Resolves a market slug through the Gamma markets API:
//!
//! ```text
//! GET {base}/markets?slug=<slug>
//! ```
//!
//! The response is an array of markets. `clobTokenIds` and `outcomes` are
//! JSON arrays encoded as strings and are index-aligned.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::application::ports::{FeedResolver, ResolveError};
use crate::domain::streaming::FeedMetadata;

/// Default Gamma API base URL.
pub const DEFAULT_GAMMA_BASE_URL: &str = "https://gamma-api.polymarket.com";

/// Market entry as returned by the Gamma API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    /// Market question.
    #[serde(default)]
    pub question: Option<String>,
    /// JSON-encoded array of outcome token identifiers.
    #[serde(default)]
    pub clob_token_ids: Option<String>,
    /// JSON-encoded array of outcome labels.
    #[serde(default)]
    pub outcomes: Option<String>,
}

impl GammaMarket {
    /// Convert into feed metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidResponse`] if the encoded arrays do not
    /// parse or no token identifiers are present.
    pub fn into_metadata(self, slug: &str) -> Result<FeedMetadata, ResolveError> {
        let asset_ids = decode_string_array("clobTokenIds", self.clob_token_ids.as_deref())?;
        if asset_ids.is_empty() {
            return Err(ResolveError::InvalidResponse(format!(
                "market {slug} has no clobTokenIds"
            )));
        }

        let labels = decode_string_array("outcomes", self.outcomes.as_deref())?;
        let outcomes = asset_ids.iter().cloned().zip(labels).collect();

        Ok(FeedMetadata {
            asset_ids,
            question: self.question.unwrap_or_else(|| "N/A".to_string()),
            outcomes,
        })
    }
}

fn decode_string_array(field: &str, raw: Option<&str>) -> Result<Vec<String>, ResolveError> {
    match raw {
        None => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| ResolveError::InvalidResponse(format!("{field}: {e}"))),
    }
}

/// [`FeedResolver`] backed by the Gamma markets API.
#[derive(Debug, Clone)]
pub struct GammaFeedResolver {
    client: reqwest::Client,
    base_url: String,
}

impl GammaFeedResolver {
    /// Create a resolver for `base_url` with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FeedResolver for GammaFeedResolver {
    async fn resolve(&self, feed_name: &str) -> Result<FeedMetadata, ResolveError> {
        let url = format!("{}/markets", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("slug", feed_name)])
            .send()
            .await
            .map_err(|e| ResolveError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ResolveError::Http(format!("status {status}: {body}")));
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .map_err(|e| ResolveError::InvalidResponse(e.to_string()))?;

        let market = markets
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NotFound(feed_name.to_string()))?;

        let metadata = market.into_metadata(feed_name)?;
        tracing::debug!(
            feed_id = feed_name,
            assets = metadata.asset_ids.len(),
            question = %metadata.question,
            "Feed resolved"
        );
        Ok(metadata)
    }
}
