
//! Token counting for budget accounting
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::upstream::llm_client::classify_status;
use crate::upstream::retry::with_retry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Counts tokens the way the completion backend would. Counts only need to
/// be consistent, not exact, since every budget decision uses the same
/// counter.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str) -> Result<usize, UpstreamError>;
}

/// Whitespace-and-length heuristic: roughly one token per word, with long
/// words contributing one extra token per four characters beyond the first
/// four. Tracks BPE-style tokenizers closely enough for budgeting, and never
/// needs the network.
pub struct HeuristicTokenCounter;

impl HeuristicTokenCounter {
    pub fn estimate(text: &str) -> usize {
        text.split_whitespace()
            .map(|word| 1 + word.chars().count().saturating_sub(4) / 4)
            .sum()
    }
}

#[async_trait]
impl TokenCounter for HeuristicTokenCounter {
    async fn count_tokens(&self, text: &str) -> Result<usize, UpstreamError> {
        Ok(Self::estimate(text))
    }
}

#[derive(Debug, Serialize)]
struct TokenizeRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i64>,
}

/// Exact counts from a llama-server-style `/tokenize` endpoint. Transient
/// failures are retried with bounded backoff; only after the attempt budget
/// is exhausted does the counter fall back to the heuristic estimate.
pub struct HttpTokenCounter {
    config: UpstreamConfig,
    http_client: reqwest::Client,
}

impl HttpTokenCounter {
    pub fn new(config: &UpstreamConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            config: config.clone(),
            http_client,
        }
    }

    fn tokenize_url(&self) -> String {
        format!("{}/tokenize", self.config.base_url)
    }

    async fn request_count(&self, text: &str) -> Result<usize, UpstreamError> {
        let request = TokenizeRequest {
            content: text.to_string(),
        };
        let response = self
            .http_client
            .post(self.tokenize_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(format!("tokenize request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let parsed: TokenizeResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Permanent(format!("malformed tokenize response: {}", e)))?;
        Ok(parsed.tokens.len())
    }
}

#[async_trait]
impl TokenCounter for HttpTokenCounter {
    async fn count_tokens(&self, text: &str) -> Result<usize, UpstreamError> {
        match with_retry(&self.config, "tokenize", || self.request_count(text)).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!("Tokenize endpoint failed ({}), using heuristic estimate", e);
                Ok(HeuristicTokenCounter::estimate(text))
            }
        }
    }
}
