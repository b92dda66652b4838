// recollect/src/config.rs

use anyhow::Result;
use std::env;
use tracing::{info, warn};

/// Token accounting knobs for the context window.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    /// Hard ceiling on the tokens of any built window.
    pub max_context_tokens: usize,
    /// Summarization triggers when the Active total reaches this fraction
    /// of the ceiling, leaving headroom for the upcoming response.
    pub trigger_ratio: f32,
    /// Once triggered, summarization frees messages until the Active total
    /// is at or below this fraction of the ceiling.
    pub target_ratio: f32,
    /// Maximum sibling summaries at a level before a hierarchical merge.
    pub fan_out_threshold: usize,
    /// The newest N messages are never summarized.
    pub min_recent_active: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: 8192,
            trigger_ratio: 0.8,
            target_ratio: 0.5,
            fan_out_threshold: 5,
            min_recent_active: 2,
        }
    }
}

impl TokenBudget {
    pub fn trigger_tokens(&self) -> usize {
        (self.max_context_tokens as f32 * self.trigger_ratio) as usize
    }

    pub fn target_tokens(&self) -> usize {
        (self.max_context_tokens as f32 * self.target_ratio) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_context_tokens == 0 {
            return Err(anyhow::anyhow!("max_context_tokens must be positive"));
        }
        if !(0.0..=1.0).contains(&self.trigger_ratio) || !(0.0..=1.0).contains(&self.target_ratio) {
            return Err(anyhow::anyhow!("trigger_ratio and target_ratio must be within [0, 1]"));
        }
        if self.target_ratio >= self.trigger_ratio {
            return Err(anyhow::anyhow!(
                "target_ratio ({}) must be below trigger_ratio ({})",
                self.target_ratio,
                self.trigger_ratio
            ));
        }
        if self.fan_out_threshold < 2 {
            return Err(anyhow::anyhow!("fan_out_threshold must be at least 2"));
        }
        Ok(())
    }
}

/// Endpoints, timeouts and retry shape for the upstream collaborators.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub completion_model: String,
    pub summarization_max_tokens: u32,
    pub summarization_temperature: f32,
    pub request_timeout_seconds: u64,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            api_key: None,
            completion_model: "deepseek-chat".to_string(),
            summarization_max_tokens: 2048,
            summarization_temperature: 0.3,
            request_timeout_seconds: 60,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 10_000,
        }
    }
}

/// Embedding index and document chunking knobs.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub relevance_threshold: f32,
    pub max_results: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            chunk_size: 1000,
            chunk_overlap: 200,
            relevance_threshold: 0.35,
            max_results: 8,
        }
    }
}

/// Top-level engine configuration. Constructed explicitly and passed down;
/// no ambient global state.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub budget: TokenBudget,
    pub upstream: UpstreamConfig,
    pub embedding: EmbeddingConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}, using default", key);
            default
        }),
        Err(_) => default,
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded environment variables from .env file");
        }

        let defaults = EngineConfig::default();
        let cfg = Self {
            budget: TokenBudget {
                max_context_tokens: env_parse("MAX_CONTEXT_TOKENS", defaults.budget.max_context_tokens),
                trigger_ratio: env_parse("TRIGGER_RATIO", defaults.budget.trigger_ratio),
                target_ratio: env_parse("TARGET_RATIO", defaults.budget.target_ratio),
                fan_out_threshold: env_parse("FAN_OUT_THRESHOLD", defaults.budget.fan_out_threshold),
                min_recent_active: env_parse("MIN_RECENT_ACTIVE", defaults.budget.min_recent_active),
            },
            upstream: UpstreamConfig {
                base_url: env::var("UPSTREAM_BASE_URL").unwrap_or(defaults.upstream.base_url),
                api_key: env::var("UPSTREAM_API_KEY").ok(),
                completion_model: env::var("COMPLETION_MODEL").unwrap_or(defaults.upstream.completion_model),
                summarization_max_tokens: env_parse("SUMMARIZATION_MAX_TOKENS", defaults.upstream.summarization_max_tokens),
                summarization_temperature: env_parse("SUMMARIZATION_TEMPERATURE", defaults.upstream.summarization_temperature),
                request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", defaults.upstream.request_timeout_seconds),
                max_attempts: env_parse("UPSTREAM_MAX_ATTEMPTS", defaults.upstream.max_attempts),
                backoff_base_ms: env_parse("BACKOFF_BASE_MS", defaults.upstream.backoff_base_ms),
                backoff_max_ms: env_parse("BACKOFF_MAX_MS", defaults.upstream.backoff_max_ms),
            },
            embedding: EmbeddingConfig {
                model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding.model),
                dimension: env_parse("EMBEDDING_DIMENSION", defaults.embedding.dimension),
                chunk_size: env_parse("CHUNK_SIZE", defaults.embedding.chunk_size),
                chunk_overlap: env_parse("CHUNK_OVERLAP", defaults.embedding.chunk_overlap),
                relevance_threshold: env_parse("RELEVANCE_THRESHOLD", defaults.embedding.relevance_threshold),
                max_results: env_parse("MAX_RESULTS", defaults.embedding.max_results),
            },
        };

        cfg.budget.validate()?;
        info!(
            "Engine configuration: budget {} tokens (trigger {:.2}, target {:.2}), fan-out {}, embedding dim {}",
            cfg.budget.max_context_tokens,
            cfg.budget.trigger_ratio,
            cfg.budget.target_ratio,
            cfg.budget.fan_out_threshold,
            cfg.embedding.dimension
        );
        Ok(cfg)
    }
}
