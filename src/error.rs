//! Error taxonomy for the run engine and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Model or evaluator configuration cannot be resolved. Fatal to submission.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A prompt variable could not be resolved. Fatal to one item.
    #[error("template error: {0}")]
    Template(String),

    #[error("model invocation timed out after {0}s")]
    InvokerTimeout(u64),

    #[error("transient model invocation failure: {0}")]
    InvokerTransient(String),

    /// Non-retryable invoker failure (rejected request, malformed response).
    #[error("model invocation failed: {0}")]
    InvokerFatal(String),

    /// Isolated to one evaluator's score.
    #[error("evaluator error: {0}")]
    Evaluator(String),

    #[error("{0}")]
    NotFound(String),

    /// The dataset could not be enumerated. Fatal to the run.
    #[error("dataset enumeration failed: {0}")]
    Enumeration(String),

    #[error("run {0} has not produced any results yet")]
    ResultsNotReady(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("missing or malformed authorization header")]
    Unauthorized,

    #[error("invalid token")]
    Forbidden,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Configuration(_)
            | EngineError::Template(_)
            | EngineError::ResultsNotReady(_)
            | EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EngineError::Configuration("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::NotFound("run".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(EngineError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(EngineError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            EngineError::Enumeration("gone".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EngineError::InvokerTimeout(5).to_string(),
            "model invocation timed out after 5s"
        );
    }
}
