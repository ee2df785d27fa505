use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Client-visible error kinds, mapped onto OpenAI-style error bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("no tokens available")]
    NoTokens,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NoTokens => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(_) | ApiError::BadRequest(_) => "invalid_request_error",
            _ => "api_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::Auth(_) => Some("invalid_api_key"),
            ApiError::NoTokens => Some("no_tokens_available"),
            ApiError::Upstream(_) => Some("upstream_error"),
            ApiError::UpstreamTimeout => Some("upstream_timeout"),
            ApiError::BadRequest(_) | ApiError::Internal(_) => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": self.code(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
