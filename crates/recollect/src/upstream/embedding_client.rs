
//! Embedding backend client
use crate::config::{EmbeddingConfig, UpstreamConfig};
use crate::error::UpstreamError;
use crate::upstream::llm_client::classify_status;
use crate::upstream::retry::with_retry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingClient {
    upstream: UpstreamConfig,
    model: String,
    expected_dimension: usize,
    http_client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new(upstream: UpstreamConfig, embedding: &EmbeddingConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(upstream.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            upstream,
            model: embedding.model.clone(),
            expected_dimension: embedding.dimension,
            http_client,
        }
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.upstream.base_url)
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };
        let mut builder = self.http_client.post(self.embeddings_url()).json(&request);
        if let Some(key) = &self.upstream.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Permanent(format!("malformed embedding response: {}", e)))?;
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(UpstreamError::Permanent(format!(
                "embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                embeddings.len()
            )));
        }
        for vector in &embeddings {
            if vector.len() != self.expected_dimension {
                return Err(UpstreamError::Permanent(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    vector.len(),
                    self.expected_dimension
                )));
            }
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Requesting embeddings for {} text(s)", texts.len());
        with_retry(&self.upstream, "embed", || self.request_embeddings(texts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard, dimension: usize) -> HttpEmbeddingClient {
        HttpEmbeddingClient::new(
            UpstreamConfig {
                base_url: server.url(),
                max_attempts: 1,
                ..Default::default()
            },
            &EmbeddingConfig {
                dimension,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_embed_parses_vectors_in_order() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[1.0,0.0]},{"embedding":[0.0,1.0]}]}"#)
            .create_async()
            .await;

        let vectors = client_for(&server, 2)
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_embed_empty_input_skips_network() {
        let server = mockito::Server::new_async().await;
        let vectors = client_for(&server, 2).embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[1.0,0.0,0.0]}]}"#)
            .create_async()
            .await;

        let err = client_for(&server, 2).embed(&["a".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_count_mismatch_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let err = client_for(&server, 2)
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
