//! Account administration: listing and removal, gated on `full_access`.
//! Listings expose status metadata only, never tokens.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use crate::error::{to_client_error, ErrorKind};

use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

pub async fn list_accounts(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let accounts = state.pool.snapshots().await;
    finish_request(&state, &ctx, "/api/accounts", None, StatusCode::OK).await;
    Json(accounts).into_response()
}

pub async fn remove_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let resp = match state.pool.remove(&id).await {
        Ok(true) => {
            state
                .audit
                .record(&ctx.key.name, Some(addr.ip()), "account.remove", &id)
                .await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => to_client_error(ErrorKind::NotFound, "unknown account"),
        Err(e) => {
            tracing::error!(account_id = %id, error = %e, "Failed to remove account");
            to_client_error(ErrorKind::Internal, "failed to remove account")
        }
    };
    finish_request(&state, &ctx, "/api/accounts", None, resp.status()).await;
    resp
}
