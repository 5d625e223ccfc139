//! Typed failures carried through `anyhow` and classified by the orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("provider failure: {0}")]
    ProviderFailure(String),

    #[error("store inconsistency in {scope}: entries remained after {iterations} deletion passes")]
    StoreInconsistency { scope: String, iterations: usize },

    #[error("validation mismatch: expected {expected}, got {actual}")]
    ValidationMismatch { expected: String, actual: String },
}

impl AgentError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn provider(message: impl std::fmt::Display) -> Self {
        Self::ProviderFailure(message.to_string())
    }

    /// Looks through `anyhow` context layers for a typed failure.
    pub fn classify(err: &anyhow::Error) -> Option<&AgentError> {
        err.downcast_ref::<AgentError>()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ProviderFailure(_) => "provider_failure",
            Self::StoreInconsistency { .. } => "store_inconsistency",
            Self::ValidationMismatch { .. } => "validation_mismatch",
        }
    }
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(AgentError::classify(err), Some(AgentError::NotFound { .. }))
}
