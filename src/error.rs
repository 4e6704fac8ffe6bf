//! Error Taxonomy
//!
//! Typed failures for the optimization engine, plus the HTTP mapping used by
//! the server layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid run or loop parameters. Rejected before any row is written.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A collaborator (generation, judge, embed, patcher) exceeded its deadline.
    #[error("{collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_ms: u64,
    },

    /// A collaborator call failed outright.
    #[error("{collaborator} failed: {message}")]
    CollaboratorFailure {
        collaborator: String,
        message: String,
    },

    /// Durable write failure after retries were exhausted.
    #[error("storage error: {0}")]
    Storage(String),

    /// A recipe promotion collided with an existing promoted recipe.
    #[error("recipe already promoted for variant {variant_id}")]
    PromotionConflict { variant_id: i64 },

    /// Too many runs or code-loops in the current window.
    #[error("rate limited: retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    /// Another code-loop is already active.
    #[error("a code-loop is already in progress")]
    CodeLoopBusy,

    /// Run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,

    #[error("{0} not found")]
    NotFound(String),
}

impl EngineError {
    pub fn collaborator(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::CollaboratorFailure {
            collaborator: name.into(),
            message: err.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CodeLoopBusy | Self::PromotionConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::Storage(other.to_string()),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Self::RateLimited { retry_after_s } = &self {
            body["retry_after_s"] = serde_json::json!(retry_after_s);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EngineError::Config("bad n".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::RateLimited { retry_after_s: 10 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            EngineError::NotFound("run 7".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_anyhow_roundtrip_preserves_kind() {
        let err: anyhow::Error = EngineError::CodeLoopBusy.into();
        let back: EngineError = err.into();
        assert!(matches!(back, EngineError::CodeLoopBusy));
    }
}
