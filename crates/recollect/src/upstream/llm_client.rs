
//! Completion backend client
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::upstream::retry::with_retry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion with a system instruction and a user payload.
    async fn complete(&self, system: &str, user: &str) -> Result<String, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct HttpLlmClient {
    config: UpstreamConfig,
    http_client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: UpstreamConfig) -> Self {
        info!("LLM client initialized with backend: {}", config.base_url);
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, http_client }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url)
    }

    async fn request_completion(&self, system: &str, user: &str) -> Result<String, UpstreamError> {
        let request = ChatCompletionRequest {
            model: self.config.completion_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.config.summarization_max_tokens,
            temperature: self.config.summarization_temperature,
            stream: false,
        };
        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Permanent(format!("malformed completion response: {}", e)))?;
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(UpstreamError::Permanent("completion backend returned empty content".to_string()));
        }
        Ok(content)
    }
}

/// 429 and 5xx are worth retrying; other client errors are not.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> UpstreamError {
    if status.as_u16() == 429 || status.is_server_error() {
        UpstreamError::Transient(format!("backend returned {}: {}", status, body))
    } else {
        UpstreamError::Permanent(format!("backend returned {}: {}", status, body))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, UpstreamError> {
        debug!("Requesting completion ({} user chars)", user.len());
        with_retry(&self.config, "complete", || self.request_completion(system, user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> HttpLlmClient {
        HttpLlmClient::new(UpstreamConfig {
            base_url: server.url(),
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..Default::default()
        })
    }

    // ===== Status Classification Tests =====

    #[test]
    fn test_429_is_transient() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_transient());
    }

    #[test]
    fn test_500_is_transient() {
        let err = classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(err.is_transient());
    }

    #[test]
    fn test_400_is_permanent() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad payload");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_403_is_permanent() {
        let err = classify_status(reqwest::StatusCode::FORBIDDEN, "no key");
        assert!(!err.is_transient());
    }

    // ===== HTTP Round Trip Tests =====

    #[tokio::test]
    async fn test_complete_parses_choice() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":" The user asked about rust. "}}]}"#)
            .create_async()
            .await;

        let text = client_for(&server).complete("summarize", "user: rust?").await.unwrap();
        assert_eq!(text, "The user asked about rust.");
    }

    #[tokio::test]
    async fn test_retries_500_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"summary"}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let text = client_for(&server).complete("summarize", "transcript").await.unwrap();
        assert_eq!(text, "summary");
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_400_fails_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(400)
            .with_body("unsupported model")
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server).complete("summarize", "transcript").await.unwrap_err();
        assert!(!err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_choices_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let err = client_for(&server).complete("summarize", "transcript").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
