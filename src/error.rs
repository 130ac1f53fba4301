//! Error taxonomy for the ingestion/retrieval core.
//!
//! Every component defines its own error enum; [`CoreError`] is the
//! umbrella type returned from public APIs, with `#[from]` conversions so
//! `?` composes across module boundaries. The taxonomy matches the seven
//! categories the core is contractually required to distinguish:
//! Validation, NotFound, Conflict, Cancelled, ProviderError, Corrupt,
//! Internal.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Coarse category used to map onto transport status codes (§6a).
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::Validation(_) => ErrorCategory::Validation,
            CoreError::NotFound(_) => ErrorCategory::NotFound,
            CoreError::Conflict(_) => ErrorCategory::Conflict,
            CoreError::Cancelled => ErrorCategory::Cancelled,
            CoreError::Provider(_) => ErrorCategory::ProviderError,
            CoreError::Store(StoreError::DimensionMismatch { .. }) => ErrorCategory::Conflict,
            CoreError::Store(StoreError::NotFound(_)) => ErrorCategory::NotFound,
            CoreError::Store(StoreError::Invalid(_)) => ErrorCategory::Validation,
            CoreError::Store(StoreError::Corrupt(_)) => ErrorCategory::Corrupt,
            CoreError::Cache(_) => ErrorCategory::Corrupt,
            CoreError::Corrupt(_) => ErrorCategory::Corrupt,
            CoreError::Flow(FlowError::Cycle(_)) | CoreError::Flow(FlowError::InvalidGraph(_)) => {
                ErrorCategory::Conflict
            }
            CoreError::Flow(FlowError::NotFound(_)) => ErrorCategory::NotFound,
            CoreError::Flow(FlowError::Cancelled) => ErrorCategory::Cancelled,
            CoreError::Flow(_) => ErrorCategory::Internal,
            CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether the caller may reasonably retry without operator intervention.
    ///
    /// Per §7, retrying is deliberately minimal: only the two documented
    /// `tool_choice` rejection retries happen automatically inside the flow
    /// engine. This helper is for callers deciding whether to surface a
    /// "try again" affordance, not for automatic retry loops.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Provider(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Cancelled,
    ProviderError,
    Corrupt,
    Internal,
}

/// Failures from the OpenRouter-compatible LLM/embedding provider (§9a).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    ConnectionFailed(String),

    #[error("provider returned 401 unauthorized")]
    Unauthorized,

    #[error("provider returned 429 rate limited")]
    RateLimited,

    #[error("provider returned server error: {0}")]
    ServerError(u16),

    #[error("provider request timed out")]
    Timeout,

    #[error("provider rejected forced tool_choice: {0}")]
    ToolChoiceRejected(String),

    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("embedding request failed: {0}")]
    EmbeddingFailed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures from the vector store engine (§4.D).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid item: {0}")]
    Invalid(String),
}

/// Failures from the embedding/enrichment caches (§4.B/§4.C).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(String),
}

/// Failures from the flow execution engine (§4.J).
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("cycle detected at node {0}")]
    Cycle(String),

    #[error("node or edge not found: {0}")]
    NotFound(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("node execution failed: {0}")]
    NodeFailed(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_validation() {
        let e = CoreError::Validation("bad input".into());
        assert_eq!(e.category(), ErrorCategory::Validation);
        assert!(!e.is_retryable());
    }

    #[test]
    fn categorizes_dimension_mismatch_as_conflict() {
        let e: CoreError = StoreError::DimensionMismatch {
            expected: 3,
            actual: 2,
        }
        .into();
        assert_eq!(e.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn provider_errors_are_retryable() {
        let e: CoreError = ProviderError::Timeout.into();
        assert!(e.is_retryable());
        assert_eq!(e.category(), ErrorCategory::ProviderError);
    }

    #[test]
    fn cancelled_is_its_own_category() {
        let e = CoreError::Cancelled;
        assert_eq!(e.category(), ErrorCategory::Cancelled);
        assert!(!e.is_retryable());
    }
}
