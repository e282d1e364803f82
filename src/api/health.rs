//! `GET /health`: aggregate and per-account status plus process stats.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use crate::account::AccountHealth;

use super::routes::AppState;
use super::validator::{authenticate, finish_request, Endpoint};

fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

pub async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = match authenticate(&state, &headers, Endpoint::Health).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let accounts = state.pool.snapshots().await;
    let healthy = accounts
        .iter()
        .filter(|a| matches!(a.health, AccountHealth::Healthy | AccountHealth::ExpiringSoon))
        .count();
    let status = if accounts.is_empty() || healthy == 0 {
        "degraded"
    } else {
        "ok"
    };

    let totals = state.counters.totals_today().await;
    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "endpoint": format!("http://{}:{}", state.config.host, state.config.port),
        "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        "process": {
            "memory_bytes": process_memory_bytes(),
        },
        "accounts": accounts,
        "usage_today": totals,
    });

    finish_request(&state, &ctx, "/health", None, StatusCode::OK).await;
    Json(body).into_response()
}
