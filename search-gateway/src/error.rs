//! Error types for the search gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use search_common::ErrorBody;

use crate::pipeline::PipelineError;

/// Message returned whenever admission is refused for lack of capacity.
pub const OVERLOADED_MESSAGE: &str = "Server overloaded, try again later";

/// Errors surfaced by admission, scheduling and delivery.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Request rejected before any resource was consumed.
    #[error("{0}")]
    InvalidInput(String),

    /// Queue full or in-flight cap reached.
    #[error("{}", OVERLOADED_MESSAGE)]
    Overloaded,

    #[error("Request timed out")]
    Timeout,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Pipeline(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::InvalidInput("Missing query or image".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(GatewayError::Overloaded.to_string(), OVERLOADED_MESSAGE);
        assert_eq!(GatewayError::Timeout.to_string(), "Request timed out");
        let err = GatewayError::from(PipelineError::Upstream("HTTP 500".into()));
        assert_eq!(err.to_string(), "Pipeline returned error: HTTP 500");
    }
}
