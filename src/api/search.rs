//! `POST /v1/web/search` forwards to the vendor's search plugin with the
//! `query ↔ uq` field rename at the boundary.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{to_client_error, ErrorKind};

use super::openai::{dispatch_error_response, AccountQuery};
use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    account: Option<String>,
}

pub async fn web_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::WebSearch).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let req: SearchRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let resp = to_client_error(ErrorKind::Validation, format!("invalid JSON body: {}", e));
            finish_request(&state, &ctx, "/v1/web/search", None, resp.status()).await;
            return resp;
        }
    };

    let pinned = headers
        .get("x-qwen-account")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.account)
        .or(req.account)
        .filter(|s| !s.trim().is_empty());

    match state
        .dispatcher
        .web_search(&req.query, req.page, req.rows, pinned.as_deref())
        .await
    {
        Ok(resp) => {
            finish_request(
                &state,
                &ctx,
                "/v1/web/search",
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
            finish_request(&state, &ctx, "/v1/web/search", None, resp.status()).await;
            resp
        }
    }
}
