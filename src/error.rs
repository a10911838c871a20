//! Adapter-wide error taxonomy (see SPEC_FULL.md §7).
//!
//! Every variant carries enough structured data to build a DAP
//! `{error_code, cause?}` detail pair without parsing a message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("operation denied by policy: {0}")]
    PolicyDenied(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    /// Stable machine-readable code, used as `details.error_code` in DAP error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            AdapterError::Configuration(_) => "configuration_error",
            AdapterError::Transport(_) => "transport_error",
            AdapterError::Framing(_) => "framing_error",
            AdapterError::Protocol(_) => "protocol_error",
            AdapterError::Engine(_) => "engine_error",
            AdapterError::Timeout(_) => "timed_out",
            AdapterError::Evaluation(_) => "evaluation_error",
            AdapterError::PolicyDenied(_) => "policy_denied",
            AdapterError::Internal(_) => "internal_error",
            AdapterError::Json(_) => "json_error",
        }
    }

    /// Whether this error is fatal to the whole session (vs. scoped to one request).
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Transport(_) | AdapterError::Framing(_))
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
