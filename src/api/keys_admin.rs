//! API-key administration: `/api/keys` CRUD, gated on `full_access`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{to_client_error, ErrorKind};
use crate::keys::{KeyUpdate, Permission, RateLimitConfig};

use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Option<Vec<Permission>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

pub async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let keys = state.api_keys.list().await;
    finish_request(&state, &ctx, "/api/keys", None, StatusCode::OK).await;
    Json(keys).into_response()
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let name = req.name.trim().to_string();
    if name.is_empty() {
        let resp = to_client_error(ErrorKind::Validation, "name is required");
        finish_request(&state, &ctx, "/api/keys", None, resp.status()).await;
        return resp;
    }
    let permissions = req
        .permissions
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| vec![Permission::ChatCompletions, Permission::ModelsList]);

    let resp = match state
        .api_keys
        .create(name, req.description, permissions, req.rate_limit)
        .await
    {
        Ok(created) => {
            state
                .audit
                .record(
                    &ctx.key.name,
                    Some(addr.ip()),
                    "key.create",
                    &created.metadata.id.to_string(),
                )
                .await;
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist new API key");
            to_client_error(ErrorKind::Internal, "failed to persist API key")
        }
    };
    finish_request(&state, &ctx, "/api/keys", None, resp.status()).await;
    resp
}

pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<KeyUpdate>,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let resp = match state.api_keys.update(id, update).await {
        Ok(Some(metadata)) => Json(metadata).into_response(),
        Ok(None) => to_client_error(ErrorKind::NotFound, "unknown API key"),
        Err(e) => {
            tracing::error!(key_id = %id, error = %e, "Failed to persist key update");
            to_client_error(ErrorKind::Internal, "failed to persist key update")
        }
    };
    finish_request(&state, &ctx, "/api/keys", None, resp.status()).await;
    resp
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let resp = match state.api_keys.delete(id).await {
        Ok(true) => {
            state
                .audit
                .record(&ctx.key.name, Some(addr.ip()), "key.delete", &id.to_string())
                .await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => to_client_error(ErrorKind::NotFound, "unknown API key"),
        Err(e) => {
            tracing::error!(key_id = %id, error = %e, "Failed to persist key deletion");
            to_client_error(ErrorKind::Internal, "failed to persist key deletion")
        }
    };
    finish_request(&state, &ctx, "/api/keys", None, resp.status()).await;
    resp
}
