//! Bearer-key validation pipeline.
//!
//! Every forwarded endpoint runs the same stages in order: extract the
//! bearer, check shape, verify against the key store, check the
//! endpoint-permission map, then apply the per-key rate limit. Each stage
//! either forwards or short-circuits with an OpenAI-shaped error response.

use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;

use crate::error::{to_client_error, ErrorKind};
use crate::keys::rate_limit::RateLimitDecision;
use crate::keys::{allows, ApiKeyMetadata, Permission, KEY_PREFIX, KEY_RANDOM_HEX_LEN};
use crate::usage::stats::RequestLogEntry;

use super::routes::AppState;

/// Which permission an endpoint demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Models,
    WebSearch,
    Health,
    /// Key / account administration: only `full_access` qualifies.
    Admin,
}

/// The authenticated caller for the rest of the request.
pub struct KeyContext {
    pub key: ApiKeyMetadata,
    pub started: Instant,
}

/// Run the validation pipeline. `Err` carries the ready-to-send rejection.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    endpoint: Endpoint,
) -> Result<KeyContext, Response> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(auth_header) = auth_header else {
        return Err(to_client_error(
            ErrorKind::Authentication,
            "Missing Authorization header",
        ));
    };
    let Some(raw_key) = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
    else {
        return Err(to_client_error(
            ErrorKind::Authentication,
            "Malformed Authorization header; expected 'Bearer <key>'",
        ));
    };

    if !raw_key.starts_with(KEY_PREFIX) || raw_key.len() < KEY_PREFIX.len() + KEY_RANDOM_HEX_LEN {
        return Err(to_client_error(
            ErrorKind::Authentication,
            "Invalid API key format",
        ));
    }

    let Some(key) = state.api_keys.validate(raw_key).await else {
        return Err(to_client_error(ErrorKind::Authentication, "Invalid API key"));
    };

    let required = match endpoint {
        Endpoint::ChatCompletions | Endpoint::WebSearch => Some(Permission::ChatCompletions),
        Endpoint::Models => Some(Permission::ModelsList),
        Endpoint::Health => None,
        Endpoint::Admin => {
            if !key.permissions.contains(&Permission::FullAccess) {
                return Err(to_client_error(
                    ErrorKind::Permission,
                    "This endpoint requires full_access",
                ));
            }
            None
        }
    };
    if let Some(required) = required {
        if !allows(&key.permissions, required) {
            return Err(to_client_error(
                ErrorKind::Permission,
                "API key does not grant access to this endpoint",
            ));
        }
    }

    if let Some(limit) = key.rate_limit {
        match state.rate_limiter.check(key.id, limit).await {
            RateLimitDecision::Allowed => {}
            RateLimitDecision::Limited { retry_after } => {
                let mut resp = to_client_error(
                    ErrorKind::RateLimit,
                    "API key rate limit exceeded; retry later",
                );
                let secs = retry_after.as_secs().max(1);
                resp.headers_mut()
                    .insert("retry-after", HeaderValue::from(secs));
                return Err(resp);
            }
        }
    }

    Ok(KeyContext {
        key,
        started: Instant::now(),
    })
}

/// Record a finished request against its key: usage counters, response time,
/// error flag, and the optional per-request log line.
pub async fn finish_request(
    state: &AppState,
    ctx: &KeyContext,
    endpoint: &str,
    account_id: Option<&str>,
    status: StatusCode,
) {
    let response_ms = ctx.started.elapsed().as_millis() as u64;
    let is_error = status.is_client_error() || status.is_server_error();
    state
        .api_keys
        .record_completion(ctx.key.id, response_ms, is_error)
        .await;
    state
        .stats
        .log_request(RequestLogEntry {
            timestamp: chrono::Utc::now(),
            key_id: ctx.key.id.to_string(),
            account_id: account_id.map(str::to_string),
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            response_ms,
        })
        .await;
}
