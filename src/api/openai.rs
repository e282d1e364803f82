//! OpenAI-compatible endpoints: `POST /v1/chat/completions`, `GET /v1/models`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{to_client_error, ErrorKind};
use crate::router::DispatchError;

use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

const TEXT_EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    pub account: Option<String>,
}

/// Map a dispatch failure onto the client error taxonomy. Upstream 4xx
/// rejections pass through verbatim.
pub(super) fn dispatch_error_response(err: DispatchError) -> Response {
    match err {
        DispatchError::NoEligibleAccount => to_client_error(
            ErrorKind::UpstreamUnavailable,
            "no eligible upstream account is available",
        ),
        DispatchError::UpstreamUnavailable => to_client_error(
            ErrorKind::UpstreamUnavailable,
            "all upstream attempts failed",
        ),
        DispatchError::Validation(msg) => to_client_error(ErrorKind::Validation, msg),
        DispatchError::UpstreamRejected { status, body } => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| {
                to_client_error(ErrorKind::Internal, "failed to build upstream response")
            }),
    }
}

/// Resolve the account pin: header, then query, then body field. The body
/// field is removed before forwarding upstream.
pub(super) fn extract_pinned(
    headers: &HeaderMap,
    query_account: Option<String>,
    body: &mut serde_json::Value,
) -> Option<String> {
    let from_header = headers
        .get("x-qwen-account")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_body = body
        .as_object_mut()
        .and_then(|obj| obj.remove("account"))
        .and_then(|v| v.as_str().map(str::to_string));
    from_header
        .or(query_account)
        .or(from_body)
        .filter(|s| !s.trim().is_empty())
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::ChatCompletions).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let mut payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let resp = to_client_error(ErrorKind::Validation, format!("invalid JSON body: {}", e));
            finish_request(&state, &ctx, "/v1/chat/completions", None, resp.status()).await;
            return resp;
        }
    };

    // Input validation short-circuits before any account is selected.
    let valid_messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|m| !m.is_empty())
        .unwrap_or(false);
    if !valid_messages {
        let resp = to_client_error(
            ErrorKind::Validation,
            "messages must be a non-empty array",
        );
        finish_request(&state, &ctx, "/v1/chat/completions", None, resp.status()).await;
        return resp;
    }

    let model_missing = payload
        .get("model")
        .and_then(|m| m.as_str())
        .map(|m| m.trim().is_empty())
        .unwrap_or(true);
    if model_missing {
        payload["model"] = serde_json::Value::String(state.config.default_model.clone());
    }

    let pinned = extract_pinned(&headers, query.account, &mut payload);

    let wants_stream = payload.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let stream = wants_stream && state.config.streaming_enabled;
    if wants_stream && !stream {
        payload["stream"] = serde_json::Value::Bool(false);
    }

    if stream {
        match state
            .dispatcher
            .chat_completion_stream(payload, pinned.as_deref())
            .await
        {
            Ok(resp) => {
                finish_request(
                    &state,
                    &ctx,
                    "/v1/chat/completions",
                    Some(&resp.account_id),
                    StatusCode::OK,
                )
                .await;
                let mut response_headers = HeaderMap::new();
                response_headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(TEXT_EVENT_STREAM),
                );
                response_headers
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response_headers
                    .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
                (StatusCode::OK, response_headers, Body::from_stream(resp.stream))
                    .into_response()
            }
            Err(err) => {
                let resp = dispatch_error_response(err);
                finish_request(&state, &ctx, "/v1/chat/completions", None, resp.status()).await;
                resp
            }
        }
    } else {
        match state
            .dispatcher
            .chat_completion(payload, pinned.as_deref())
            .await
        {
            Ok(resp) => {
                finish_request(
                    &state,
                    &ctx,
                    "/v1/chat/completions",
                    Some(&resp.account_id),
                    StatusCode::OK,
                )
                .await;
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(resp.body))
                    .unwrap_or_else(|_| {
                        to_client_error(ErrorKind::Internal, "failed to build response")
                    })
            }
            Err(err) => {
                let resp = dispatch_error_response(err);
                finish_request(&state, &ctx, "/v1/chat/completions", None, resp.status()).await;
                resp
            }
        }
    }
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
    headers: HeaderMap,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Models).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let pinned = headers
        .get("x-qwen-account")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.account)
        .filter(|s| !s.trim().is_empty());

    match state.dispatcher.list_models(pinned.as_deref()).await {
        Ok(models) => {
            finish_request(&state, &ctx, "/v1/models", None, StatusCode::OK).await;
            Json(models).into_response()
        }
        Err(err) => {
            let resp = dispatch_error_response(err);
            finish_request(&state, &ctx, "/v1/models", None, resp.status()).await;
            resp
        }
    }
}
