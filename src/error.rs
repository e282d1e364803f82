//! Client-visible error taxonomy.
//!
//! Every error surfaced to a caller goes through [`to_client_error`] so the
//! response body always matches the OpenAI wire shape
//! `{"error":{"message","type","code"}}` and downstream tooling keeps working.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// The kinds of errors a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    QuotaExceeded,
    UpstreamUnavailable,
    Streaming,
    Internal,
}

impl ErrorKind {
    /// HTTP status this kind maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Permission => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimit | Self::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable | Self::Streaming => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `type` string in the error body.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Authentication => "authentication_error",
            Self::Permission => "permission_error",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Streaming => "streaming_error",
            Self::Internal => "internal_error",
        }
    }
}

/// Error response matching OpenAI's format.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: String,
    code: Option<String>,
}

/// Build the OpenAI-shaped JSON body for an error without the HTTP wrapping.
///
/// Used for the terminal SSE `event: error` frame, where the HTTP status has
/// already been committed.
pub fn client_error_body(kind: ErrorKind, message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": kind.type_str(),
            "code": kind.type_str(),
        }
    })
}

/// Build a complete HTTP response for a client-visible error.
pub fn to_client_error(kind: ErrorKind, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: ErrorBody {
            message: message.into(),
            r#type: kind.type_str().to_string(),
            code: Some(kind.type_str().to_string()),
        },
    };
    (kind.status(), Json(body)).into_response()
}
