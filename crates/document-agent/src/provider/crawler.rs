//! Web crawling collaborator. Pages come back as markdown.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AgentError;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrawledPage {
    pub url: String,
    #[serde(default, alias = "rawContent")]
    pub raw_content: String,
}

#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, url: &str, instructions: Option<&str>) -> anyhow::Result<Vec<CrawledPage>>;
}

#[derive(Debug, Serialize)]
struct CrawlRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    format: &'static str,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct CrawlResponse {
    #[serde(default)]
    results: Vec<CrawledPage>,
}

pub struct TavilyCrawler {
    base_url: String,
    api_key: String,
    limit: u32,
    http_client: reqwest::Client,
}

impl TavilyCrawler {
    pub fn new(base_url: &str, api_key: &str, limit: u32, timeout: Duration) -> Self {
        info!("Crawler initialized with backend: {}", base_url);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limit,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Crawler for TavilyCrawler {
    async fn crawl(&self, url: &str, instructions: Option<&str>) -> anyhow::Result<Vec<CrawledPage>> {
        metrics::inc_provider_call("crawl");
        let request = CrawlRequest { url, instructions, format: "markdown", limit: self.limit };
        let response = self
            .http_client
            .post(format!("{}/crawl", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("crawl request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!("crawler returned {}: {}", status, body)).into());
        }

        let parsed: CrawlResponse = response
            .json()
            .await
            .map_err(|e| AgentError::provider(format!("failed to parse crawl response: {}", e)))?;
        let pages: Vec<CrawledPage> = parsed
            .results
            .into_iter()
            .filter(|page| !page.raw_content.trim().is_empty())
            .collect();
        debug!("Crawled {} pages from {}", pages.len(), url);
        Ok(pages)
    }
}
