//! Error taxonomy for the memory engine.
//!
//! Upstream services (tokenizer, completion model, embedding service) fail in
//! two ways that callers must tell apart: transient failures are retried by
//! [`crate::upstream::retry::with_retry`] and then deferred, permanent
//! failures skip the cycle and surface immediately.

use thiserror::Error;

/// Failure classes for calls to rate-limited upstream collaborators.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Timeout, connection failure, 429 or 5xx. Safe to retry.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Auth failure or malformed response. Retrying cannot help.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Errors surfaced by the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The budget cannot be satisfied even after a full summarization sweep,
    /// e.g. a single message larger than the whole context window.
    #[error("context overflow: minimum required content is {required} tokens, budget is {budget}")]
    ContextOverflow { required: usize, budget: usize },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A summary references missing messages or a tier moved backward.
    /// Fatal for the conversation: further writes to it are refused.
    #[error("invariant violation in conversation {conversation_id}: {detail}")]
    InvariantViolation {
        conversation_id: String,
        detail: String,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(UpstreamError::Transient("timeout".into()).is_transient());
        assert!(!UpstreamError::Permanent("401".into()).is_transient());
    }

    #[test]
    fn test_upstream_converts_into_engine_error() {
        let err: EngineError = UpstreamError::Permanent("bad auth".into()).into();
        assert!(matches!(err, EngineError::Upstream(UpstreamError::Permanent(_))));
    }

    #[test]
    fn test_overflow_message_carries_amounts() {
        let err = EngineError::ContextOverflow { required: 1200, budget: 1000 };
        let text = err.to_string();
        assert!(text.contains("1200"));
        assert!(text.contains("1000"));
    }
}
