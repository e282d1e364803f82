//! Device-flow account authorization endpoints and the force-refresh hook.
//!
//! `POST /auth/initiate` starts a device authorization and hands the caller
//! the user code plus the PKCE verifier; `POST /auth/poll` redeems it and
//! persists the new account before the pending flow is destroyed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::error::{to_client_error, ErrorKind};
use crate::oauth::device::PendingDeviceFlow;
use crate::oauth::{credentials_from_bundle, PollOutcome};

use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

#[derive(Debug, Default, Deserialize)]
pub struct InitiateRequest {
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub device_code: String,
    pub code_verifier: String,
}

fn new_account_id() -> String {
    let id = uuid::Uuid::new_v4().as_simple().to_string();
    format!("acct-{}", &id[..8])
}

pub async fn initiate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<InitiateRequest>>,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let account_id = body
        .and_then(|Json(req)| req.account_id)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_account_id);

    let (authorization, code_verifier) = match state.oauth.initiate_device_flow().await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Device authorization initiation failed");
            let resp = to_client_error(
                ErrorKind::UpstreamUnavailable,
                "device authorization initiation failed",
            );
            finish_request(&state, &ctx, "/auth/initiate", None, resp.status()).await;
            return resp;
        }
    };

    let poll_interval = authorization.interval.unwrap_or(5);
    state
        .device_flows
        .insert(
            authorization.device_code.clone(),
            PendingDeviceFlow {
                target_account_id: account_id.clone(),
                user_code: authorization.user_code.clone(),
                verification_uri: authorization.verification_uri.clone(),
                verification_uri_complete: authorization.verification_uri_complete.clone(),
                code_verifier: code_verifier.clone(),
                expires_at: Utc::now() + Duration::seconds(authorization.expires_in as i64),
                poll_interval,
                created_by: ctx.key.name.clone(),
            },
        )
        .await;

    finish_request(&state, &ctx, "/auth/initiate", None, StatusCode::OK).await;
    Json(serde_json::json!({
        "account_id": account_id,
        "device_code": authorization.device_code,
        "user_code": authorization.user_code,
        "verification_uri": authorization.verification_uri,
        "verification_uri_complete": authorization.verification_uri_complete,
        "expires_in": authorization.expires_in,
        "interval": poll_interval,
        "code_verifier": code_verifier,
    }))
    .into_response()
}

pub async fn poll(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<PollRequest>,
) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let outcome = match state
        .oauth
        .poll_device_token(&req.device_code, &req.code_verifier)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(error = %e, "Device token poll failed");
            let resp =
                to_client_error(ErrorKind::UpstreamUnavailable, "device token poll failed");
            finish_request(&state, &ctx, "/auth/poll", None, resp.status()).await;
            return resp;
        }
    };

    let resp = match outcome {
        PollOutcome::Pending => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "pending",
                "message": "authorization pending; poll again after the interval",
            })),
        )
            .into_response(),
        PollOutcome::SlowDown => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "pending",
                "slow_down": true,
                "message": "authorization pending; increase the poll interval by 5 seconds",
            })),
        )
            .into_response(),
        PollOutcome::Expired => {
            state.device_flows.remove(&req.device_code).await;
            to_client_error(ErrorKind::Validation, "device code expired")
        }
        PollOutcome::Denied => {
            state.device_flows.remove(&req.device_code).await;
            to_client_error(ErrorKind::Authentication, "authorization was denied")
        }
        PollOutcome::Completed(bundle) => {
            let account_id = state
                .device_flows
                .get(&req.device_code)
                .await
                .map(|flow| flow.target_account_id)
                .unwrap_or_else(new_account_id);
            let credentials = credentials_from_bundle(bundle, &req.code_verifier);
            let access_token = credentials.access_token.clone();
            match state.pool.add(&account_id, credentials).await {
                Ok(()) => {
                    // The flow object is destroyed only after persistence.
                    state.device_flows.remove(&req.device_code).await;
                    state
                        .audit
                        .record(&ctx.key.name, Some(addr.ip()), "account.create", &account_id)
                        .await;
                    Json(serde_json::json!({
                        "access_token": access_token,
                        "account_id": account_id,
                        "message": format!("account {} authorized", account_id),
                    }))
                    .into_response()
                }
                Err(e) => {
                    tracing::error!(account_id = %account_id, error = %e, "Failed to persist account");
                    to_client_error(ErrorKind::Internal, "failed to persist account credentials")
                }
            }
        }
    };

    finish_request(&state, &ctx, "/auth/poll", None, resp.status()).await;
    resp
}

/// `POST /auth/refresh` refreshes every account unconditionally.
pub async fn force_refresh(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Admin).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let report = state.scheduler.sweep(true).await;
    finish_request(&state, &ctx, "/auth/refresh", None, StatusCode::OK).await;
    Json(report).into_response()
}
