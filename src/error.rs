//! Error taxonomy shared by the session manager, the request bridge and the
//! HTTP surface.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced to callers of the wrapper
#[derive(Debug, Error)]
pub enum WrapperError {
    /// The subprocess or its protocol session could not be established
    #[error("Failed to connect to MCP server: {0}")]
    Connection(String),

    /// A request on an established session failed
    #[error("MCP request failed: {0}")]
    Protocol(String),

    /// Malformed caller input
    #[error("{0}")]
    InvalidRequest(String),

    /// The background operation did not finish within the wait bound.
    /// The operation itself keeps running.
    #[error("Timed out after {}s waiting for the MCP server", .0.as_secs_f64())]
    Timeout(Duration),

    /// The background execution context could not be started or went away
    #[error("Session execution context unavailable: {0}")]
    ContextUnavailable(String),

    /// Releasing session resources failed (state was reset regardless)
    #[error("Failed to release MCP session resources: {0}")]
    Cleanup(String),
}

impl WrapperError {
    /// Build an `InvalidRequest` error from anything displayable
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status this error maps to: 400 for caller mistakes, 500 otherwise
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WrapperError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_is_bad_request() {
        let err = WrapperError::invalid_request("Tool name is required");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Tool name is required");
    }

    #[test]
    fn test_everything_else_is_internal_error() {
        let errors = [
            WrapperError::Connection("spawn failed".into()),
            WrapperError::Protocol("broken pipe".into()),
            WrapperError::Timeout(Duration::from_secs(120)),
            WrapperError::ContextUnavailable("thread died".into()),
            WrapperError::Cleanup("kill failed".into()),
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR, "{err}");
        }
    }

    #[test]
    fn test_timeout_message_mentions_duration() {
        let err = WrapperError::Timeout(Duration::from_secs(120));
        assert_eq!(err.to_string(), "Timed out after 120s waiting for the MCP server");
    }
}
