//! Application state, route assembly, and the server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::account::{AccountPool, AccountStore};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::keys::rate_limit::{RateLimiter, SlidingWindowLimiter};
use crate::keys::ApiKeyStore;
use crate::oauth::device::DeviceFlowStore;
use crate::oauth::scheduler::RefreshScheduler;
use crate::oauth::OauthClient;
use crate::router::Dispatcher;
use crate::usage::stats::StatsCollector;
use crate::usage::UsageCounters;

use super::{accounts_admin, auth_flow, health, keys_admin, openai, search};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub pool: Arc<AccountPool>,
    pub dispatcher: Dispatcher,
    pub oauth: OauthClient,
    pub device_flows: Arc<DeviceFlowStore>,
    pub scheduler: Arc<RefreshScheduler>,
    pub api_keys: Arc<ApiKeyStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub counters: Arc<UsageCounters>,
    pub stats: Arc<StatsCollector>,
    pub audit: Arc<AuditLog>,
    pub started_at: Instant,
}

/// Construct the full application state from configuration, hydrating every
/// store from the data directory.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let http_client = reqwest::Client::new();

    let pool = Arc::new(AccountPool::new(AccountStore::new(&config.data_dir)));
    pool.load_all().await;

    let oauth = OauthClient::new(http_client.clone());

    let audit = Arc::new(AuditLog::new(
        config.data_dir.join("audit.log"),
        config.log_file_limit,
    ));

    let counters = UsageCounters::start(config.data_dir.join("request_counts.json"));

    let api_keys = Arc::new(
        ApiKeyStore::new(
            config.data_dir.join("api_keys.json"),
            config.data_dir.join("key_usage_stats.json"),
        )
        .await,
    );
    api_keys.import_bootstrap(&config.bootstrap_keys).await;

    let stats = Arc::new(StatsCollector::new(
        Arc::clone(&counters),
        Arc::clone(&api_keys),
        config.data_dir.join("stats"),
        config.request_log,
    ));

    let dispatcher = Dispatcher::new(
        Arc::clone(&pool),
        oauth.clone(),
        Arc::clone(&counters),
        http_client,
        config.chat_timeout,
        config.search_timeout,
    );

    let scheduler = Arc::new(RefreshScheduler::new(
        Arc::clone(&pool),
        oauth.clone(),
        Arc::clone(&audit),
    ));

    Ok(Arc::new(AppState {
        config,
        pool,
        dispatcher,
        oauth,
        device_flows: Arc::new(DeviceFlowStore::new()),
        scheduler,
        api_keys,
        rate_limiter: Arc::new(SlidingWindowLimiter::default()),
        counters,
        stats,
        audit,
        started_at: Instant::now(),
    }))
}

/// Assemble the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/web/search", post(search::web_search))
        .route("/health", get(health::health))
        .route("/auth/initiate", post(auth_flow::initiate))
        .route("/auth/poll", post(auth_flow::poll))
        .route("/auth/refresh", post(auth_flow::force_refresh))
        .route(
            "/api/keys",
            get(keys_admin::list_keys).post(keys_admin::create_key),
        )
        .route(
            "/api/keys/:id",
            patch(keys_admin::update_key).delete(keys_admin::delete_key),
        )
        .route("/api/accounts", get(accounts_admin::list_accounts))
        .route("/api/accounts/:id", delete(accounts_admin::remove_account))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn the long-lived background tasks: refresh scheduler, stats collector,
/// and the device-flow janitor.
pub fn start_background(state: &Arc<AppState>, cancel: &CancellationToken) {
    Arc::clone(&state.scheduler).spawn(cancel.clone());
    Arc::clone(&state.stats).spawn(cancel.clone());
    Arc::clone(&state.device_flows).start_janitor(cancel.clone());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Start the HTTP server and run until SIGINT/SIGTERM. In-flight requests
/// get the configured grace period, then remaining connections are aborted;
/// counters and key stats are flushed before returning.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let cancel = CancellationToken::new();
    start_background(&state, &cancel);

    let app = build_router(Arc::clone(&state));
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

    let graceful = cancel.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { graceful.cancelled().await });

    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining in-flight requests");
            cancel.cancel();
            if tokio::time::timeout(state.config.shutdown_grace, &mut server_task)
                .await
                .is_err()
            {
                tracing::warn!("Grace period elapsed, aborting remaining connections");
                server_task.abort();
            }
        }
        result = &mut server_task => {
            cancel.cancel();
            result??;
        }
    }

    state.counters.flush().await;
    state.api_keys.flush_usage().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::OauthCredentials;
    use crate::keys::Permission;
    use crate::router::upstream::api_base;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Json, Response};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock vendor covering chat, models, and the OAuth endpoints.
    #[derive(Default)]
    struct MockVendor {
        chat_calls: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    async fn spawn_vendor(vendor: Arc<MockVendor>) -> String {
        async fn chat(State(vendor): State<Arc<MockVendor>>, headers: HeaderMap) -> Response {
            vendor.chat_calls.fetch_add(1, Ordering::SeqCst);
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if bearer != "Bearer T-ok" {
                return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
            }
            Json(serde_json::json!({
                "id": "c1",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8},
            }))
            .into_response()
        }

        async fn device_code() -> Json<serde_json::Value> {
            Json(serde_json::json!({
                "device_code": "DC1",
                "user_code": "ABCD",
                "verification_uri": "https://chat.qwen.ai/activate",
                "verification_uri_complete": "https://chat.qwen.ai/activate?user_code=ABCD",
                "expires_in": 900,
                "interval": 5,
            }))
        }

        async fn token(State(vendor): State<Arc<MockVendor>>, body: String) -> Response {
            if body.contains("device_code") && !body.contains("refresh_token") {
                let n = vendor.poll_calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({"error": "authorization_pending"})),
                    )
                        .into_response();
                }
                return Json(serde_json::json!({
                    "access_token": "T2",
                    "refresh_token": "R2",
                    "expires_in": 3600,
                    "resource_url": "portal.qwen.ai",
                }))
                .into_response();
            }
            Json(serde_json::json!({
                "access_token": "T-ok",
                "expires_in": 3600,
            }))
            .into_response()
        }

        let router = Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/api/v1/oauth2/device/code", post(device_code))
            .route("/api/v1/oauth2/token", post(token))
            .with_state(vendor);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    struct TestGateway {
        base: String,
        state: Arc<AppState>,
        vendor: Arc<MockVendor>,
        client: reqwest::Client,
        _dir: tempfile::TempDir,
    }

    async fn gateway(accounts: &[(&str, &str)]) -> TestGateway {
        let vendor = Arc::new(MockVendor::default());
        let vendor_base = spawn_vendor(Arc::clone(&vendor)).await;

        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path().to_path_buf());
        let http_client = reqwest::Client::new();

        let pool = Arc::new(AccountPool::new(AccountStore::new(dir.path())));
        for (id, token) in accounts {
            pool.add(
                id,
                OauthCredentials {
                    access_token: token.to_string(),
                    refresh_token: "R1".to_string(),
                    token_type: "Bearer".to_string(),
                    expiry_timestamp: Utc::now().timestamp_millis() + 3_600_000,
                    resource_url: Some(vendor_base.clone()),
                    code_verifier: None,
                },
            )
            .await
            .unwrap();
        }

        let oauth = OauthClient::with_base_url(http_client.clone(), vendor_base.clone());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log"), 1024 * 1024));
        let counters = UsageCounters::start(dir.path().join("request_counts.json"));
        let api_keys = Arc::new(
            ApiKeyStore::new(
                dir.path().join("api_keys.json"),
                dir.path().join("key_usage_stats.json"),
            )
            .await,
        );
        let stats = Arc::new(StatsCollector::new(
            Arc::clone(&counters),
            Arc::clone(&api_keys),
            dir.path().join("stats"),
            false,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            oauth.clone(),
            Arc::clone(&counters),
            http_client.clone(),
            config.chat_timeout,
            config.search_timeout,
        );
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&pool),
            oauth.clone(),
            Arc::clone(&audit),
        ));

        let state = Arc::new(AppState {
            config,
            pool,
            dispatcher,
            oauth,
            device_flows: Arc::new(DeviceFlowStore::new()),
            scheduler,
            api_keys,
            rate_limiter: Arc::new(SlidingWindowLimiter::default()),
            counters,
            stats,
            audit,
            started_at: Instant::now(),
        });

        let app = build_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        TestGateway {
            base: format!("http://{}", addr),
            state,
            vendor,
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    async fn issue_key(gw: &TestGateway, permissions: Vec<Permission>) -> String {
        gw.state
            .api_keys
            .create("test".to_string(), None, permissions, None)
            .await
            .unwrap()
            .key
    }

    fn chat_body() -> serde_json::Value {
        serde_json::json!({
            "model": "qwen3-coder-plus",
            "messages": [{"role": "user", "content": "hi"}],
        })
    }

    #[tokio::test]
    async fn chat_happy_path_end_to_end() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let key = issue_key(&gw, vec![Permission::ChatCompletions]).await;

        let resp = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(&key)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["id"], "c1");
        assert_eq!(v["usage"]["prompt_tokens"], 5);

        gw.state.counters.flush().await;
        let today = gw.state.counters.get_today("acct1").await;
        assert_eq!(today.chat_requests, 1);
        assert_eq!(today.input_tokens, 5);
        assert_eq!(today.output_tokens, 3);
    }

    #[tokio::test]
    async fn missing_and_invalid_keys_are_rejected() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        issue_key(&gw, vec![Permission::ChatCompletions]).await;

        let resp = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["error"]["type"], "authentication_error");

        let resp = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(format!("sk-proj-{}", "0".repeat(48)))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(gw.vendor.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn models_only_key_cannot_use_chat() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let key = issue_key(&gw, vec![Permission::ModelsList]).await;

        let resp = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(&key)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["error"]["type"], "permission_error");

        // No account selected, no upstream call, no counters touched.
        assert_eq!(gw.vendor.chat_calls.load(Ordering::SeqCst), 0);
        gw.state.counters.flush().await;
        assert_eq!(gw.state.counters.totals_today().await.chat_requests, 0);
    }

    #[tokio::test]
    async fn per_key_rate_limit_returns_retry_after() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let created = gw
            .state
            .api_keys
            .create(
                "limited".to_string(),
                None,
                vec![Permission::ChatCompletions],
                Some(crate::keys::RateLimitConfig {
                    max_requests: 1,
                    window_ms: 60_000,
                }),
            )
            .await
            .unwrap();

        let first = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(&created.key)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);

        let second = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(&created.key)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().get("retry-after").is_some());
        let v: serde_json::Value = second.json().await.unwrap();
        assert_eq!(v["error"]["type"], "rate_limit_error");
    }

    #[tokio::test]
    async fn empty_messages_fail_before_account_selection() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let key = issue_key(&gw, vec![Permission::ChatCompletions]).await;

        let resp = gw
            .client
            .post(format!("{}/v1/chat/completions", gw.base))
            .bearer_auth(&key)
            .json(&serde_json::json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["error"]["type"], "validation_error");
        assert_eq!(gw.vendor.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn health_reports_accounts_and_usage() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let key = issue_key(&gw, vec![Permission::ChatCompletions]).await;

        let resp = gw
            .client
            .get(format!("{}/health", gw.base))
            .bearer_auth(&key)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["accounts"][0]["account_id"], "acct1");
        assert_eq!(v["accounts"][0]["health"], "healthy");
        assert!(v["usage_today"]["chat_requests"].is_u64());
    }

    #[tokio::test]
    async fn device_flow_end_to_end_persists_account() {
        let gw = gateway(&[]).await;
        let admin = issue_key(&gw, vec![Permission::FullAccess]).await;

        let initiate: serde_json::Value = gw
            .client
            .post(format!("{}/auth/initiate", gw.base))
            .bearer_auth(&admin)
            .json(&serde_json::json!({"account_id": "acct-new"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(initiate["user_code"], "ABCD");
        assert_eq!(initiate["device_code"], "DC1");
        let verifier = initiate["code_verifier"].as_str().unwrap().to_string();

        // First three polls are pending, the fourth completes.
        for _ in 0..3 {
            let resp = gw
                .client
                .post(format!("{}/auth/poll", gw.base))
                .bearer_auth(&admin)
                .json(&serde_json::json!({"device_code": "DC1", "code_verifier": verifier}))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        }
        let done: serde_json::Value = gw
            .client
            .post(format!("{}/auth/poll", gw.base))
            .bearer_auth(&admin)
            .json(&serde_json::json!({"device_code": "DC1", "code_verifier": verifier}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(done["access_token"], "T2");
        assert_eq!(done["account_id"], "acct-new");

        let creds = gw.state.pool.credentials_for("acct-new").await.unwrap();
        assert_eq!(creds.refresh_token, "R2");
        assert_eq!(
            api_base(creds.resource_url.as_deref()),
            "https://portal.qwen.ai/v1"
        );
        // The pending flow is destroyed on success.
        assert!(gw.state.device_flows.get("DC1").await.is_none());
    }

    #[tokio::test]
    async fn admin_endpoints_require_full_access() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let plain = issue_key(&gw, vec![Permission::ChatCompletions]).await;

        for path in ["/auth/initiate", "/auth/refresh"] {
            let resp = gw
                .client
                .post(format!("{}{}", gw.base, path))
                .bearer_auth(&plain)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN, "{}", path);
        }
        let resp = gw
            .client
            .get(format!("{}/api/keys", gw.base))
            .bearer_auth(&plain)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn key_admin_crud_and_audit() {
        let gw = gateway(&[]).await;
        let admin = issue_key(&gw, vec![Permission::FullAccess]).await;

        let created: serde_json::Value = gw
            .client
            .post(format!("{}/api/keys", gw.base))
            .bearer_auth(&admin)
            .json(&serde_json::json!({"name": "ci", "permissions": ["models.list"]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let raw = created["key"].as_str().unwrap();
        assert!(raw.starts_with("sk-proj-"));
        let id = created["id"].as_str().unwrap().to_string();

        let listed: serde_json::Value = gw
            .client
            .get(format!("{}/api/keys", gw.base))
            .bearer_auth(&admin)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // The raw key never appears in listings.
        assert!(!listed.to_string().contains(raw));

        let resp = gw
            .client
            .delete(format!("{}/api/keys/{}", gw.base, id))
            .bearer_auth(&admin)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);

        let audit = std::fs::read_to_string(gw._dir.path().join("audit.log")).unwrap();
        assert!(audit.contains("key.create"));
        assert!(audit.contains("key.delete"));
    }

    #[tokio::test]
    async fn force_refresh_reports_outcomes() {
        let gw = gateway(&[("acct1", "T-ok")]).await;
        let admin = issue_key(&gw, vec![Permission::FullAccess]).await;

        let report: serde_json::Value = gw
            .client
            .post(format!("{}/auth/refresh", gw.base))
            .bearer_auth(&admin)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["refreshed"], 1);
        let creds = gw.state.pool.credentials_for("acct1").await.unwrap();
        assert_eq!(creds.access_token, "T-ok");
    }
}
