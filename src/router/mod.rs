//! The request router.
//!
//! Translates inbound OpenAI-shaped requests into upstream calls against the
//! selected account, classifies failures, and rotates accounts: quota and
//! server failures move on to the next eligible account, auth failures get a
//! single inline refresh and one retry on the same account first, and any
//! other 4xx is returned to the caller untouched. A caller sees a definitive
//! outcome only after the attempt budget is exhausted.

pub mod sse;
pub mod upstream;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::account::{AccountPool, OauthCredentials, PoolError, Purpose};
use crate::oauth::scheduler::{refresh_account, EXPIRY_SKEW_SECS};
use crate::oauth::OauthClient;
use crate::usage::{RequestKind, UsageCounters};

use sse::{normalize_sse_stream, observe_stream};
use upstream::{api_base, chat_completions_url, models_url, web_search_url};

/// Maximum accounts tried for one inbound request.
const MAX_ATTEMPTS: usize = 3;

/// How long a cached model list stays fresh.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Web search result-count ceiling enforced before account selection.
pub const MAX_SEARCH_ROWS: u32 = 100;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no eligible upstream account is available")]
    NoEligibleAccount,

    #[error("all upstream attempts failed")]
    UpstreamUnavailable,

    #[error("{0}")]
    Validation(String),

    /// A non-auth, non-quota 4xx from upstream: returned to the caller
    /// verbatim, no rotation.
    #[error("upstream rejected the request ({status})")]
    UpstreamRejected { status: StatusCode, body: Bytes },
}

/// A buffered upstream success.
#[derive(Debug)]
pub struct BufferedResponse {
    pub account_id: String,
    pub body: Bytes,
}

/// A streaming upstream success. Counters update from inside the stream once
/// the usage chunk or terminal record is observed.
pub struct StreamResponse {
    pub account_id: String,
    pub stream: BoxStream<'static, Result<Bytes, std::io::Error>>,
}

struct ModelsCache {
    fetched_at: Instant,
    body: serde_json::Value,
}

enum Classified {
    Quota,
    Auth,
    Server,
    Client,
}

fn classify_failure(status: StatusCode, body: &[u8]) -> Classified {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || text.contains("free allocated quota exceeded")
        || text.contains("quota")
    {
        Classified::Quota
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Classified::Auth
    } else if status.is_server_error() {
        Classified::Server
    } else {
        Classified::Client
    }
}

fn usage_tokens(v: &serde_json::Value) -> Option<(u64, u64)> {
    let usage = v.get("usage")?;
    let input = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some((input, output))
}

fn count_search_results(v: &serde_json::Value) -> u64 {
    for candidate in [
        v.get("results"),
        v.get("data").and_then(|d| d.get("results")),
        v.get("data").and_then(|d| d.get("docs")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(arr) = candidate.as_array() {
            return arr.len() as u64;
        }
    }
    0
}

enum SelectFailure {
    NoEligible,
    Validation(String),
    /// Selection worked but the pre-emptive refresh failed; the account id is
    /// returned so the caller can exclude it and spend the attempt.
    RefreshFailed(String),
}

struct UpstreamAttempt {
    status: StatusCode,
    body: Bytes,
}

enum AttemptOutcome {
    Success(Bytes),
    Rotate,
    Reject(StatusCode, Bytes),
}

enum StreamAttempt {
    Success(reqwest::Response),
    Rotate,
    Reject(StatusCode, Bytes),
}

/// The dispatch core shared by every forwarded endpoint.
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    oauth: OauthClient,
    counters: Arc<UsageCounters>,
    http: reqwest::Client,
    chat_timeout: Duration,
    search_timeout: Duration,
    models_cache: RwLock<Option<ModelsCache>>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<AccountPool>,
        oauth: OauthClient,
        counters: Arc<UsageCounters>,
        http: reqwest::Client,
        chat_timeout: Duration,
        search_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            oauth,
            counters,
            http,
            chat_timeout,
            search_timeout,
            models_cache: RwLock::new(None),
        }
    }

    /// Pick an account and make sure its token outlives the clock-skew
    /// window, refreshing pre-emptively when it does not.
    async fn select_account(
        &self,
        purpose: Purpose,
        pinned: Option<&str>,
        tried: &HashSet<String>,
    ) -> Result<(String, OauthCredentials), SelectFailure> {
        let account_id = match pinned {
            Some(id) => {
                if tried.contains(id) {
                    return Err(SelectFailure::NoEligible);
                }
                match self.pool.pick_pinned(id).await {
                    Ok(id) => id,
                    Err(PoolError::UnknownAccount(id)) => {
                        return Err(SelectFailure::Validation(format!(
                            "unknown account: {}",
                            id
                        )))
                    }
                    Err(_) => return Err(SelectFailure::NoEligible),
                }
            }
            None => match self.pool.pick(purpose, tried).await {
                Ok(id) => id,
                Err(_) => return Err(SelectFailure::NoEligible),
            },
        };

        let creds = match self.pool.credentials_for(&account_id).await {
            Ok(creds) => creds,
            Err(_) => return Err(SelectFailure::RefreshFailed(account_id)),
        };
        if creds.expires_within(EXPIRY_SKEW_SECS) {
            tracing::debug!(account_id = %account_id, "Token near expiry, refreshing before use");
            if refresh_account(&self.pool, &self.oauth, &account_id, true, true)
                .await
                .is_err()
            {
                return Err(SelectFailure::RefreshFailed(account_id));
            }
            match self.pool.credentials_for(&account_id).await {
                Ok(fresh) => return Ok((account_id, fresh)),
                Err(_) => return Err(SelectFailure::RefreshFailed(account_id)),
            }
        }
        Ok((account_id, creds))
    }

    async fn send_buffered(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<UpstreamAttempt, reqwest::Error> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Ok(UpstreamAttempt { status, body })
    }

    /// Run one buffered attempt against one account, including the inline
    /// refresh-and-retry on auth failure.
    async fn try_account_buffered<F>(
        &self,
        account_id: &str,
        creds: &OauthCredentials,
        build: F,
    ) -> AttemptOutcome
    where
        F: Fn(&OauthCredentials) -> reqwest::RequestBuilder,
    {
        let attempt = match self.send_buffered(build(creds)).await {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::warn!(account_id = %account_id, error = %e, "Upstream request failed");
                return AttemptOutcome::Rotate;
            }
        };
        if attempt.status.is_success() {
            return AttemptOutcome::Success(attempt.body);
        }

        match classify_failure(attempt.status, &attempt.body) {
            Classified::Quota => {
                let _ = self.pool.mark_quota_exhausted(account_id).await;
                AttemptOutcome::Rotate
            }
            Classified::Server => {
                tracing::warn!(
                    account_id = %account_id,
                    status = %attempt.status,
                    "Upstream server error, rotating"
                );
                AttemptOutcome::Rotate
            }
            Classified::Client => AttemptOutcome::Reject(attempt.status, attempt.body),
            Classified::Auth => {
                let _ = self.pool.mark_auth_error(account_id).await;
                tracing::warn!(
                    account_id = %account_id,
                    status = %attempt.status,
                    "Upstream auth error, refreshing and retrying once"
                );
                if refresh_account(&self.pool, &self.oauth, account_id, true, false)
                    .await
                    .is_err()
                {
                    return AttemptOutcome::Rotate;
                }
                let Ok(fresh) = self.pool.credentials_for(account_id).await else {
                    return AttemptOutcome::Rotate;
                };
                match self.send_buffered(build(&fresh)).await {
                    Ok(retry) if retry.status.is_success() => AttemptOutcome::Success(retry.body),
                    Ok(retry) => match classify_failure(retry.status, &retry.body) {
                        Classified::Client => AttemptOutcome::Reject(retry.status, retry.body),
                        Classified::Quota => {
                            let _ = self.pool.mark_quota_exhausted(account_id).await;
                            AttemptOutcome::Rotate
                        }
                        _ => {
                            let _ = self.pool.mark_auth_error(account_id).await;
                            AttemptOutcome::Rotate
                        }
                    },
                    Err(_) => AttemptOutcome::Rotate,
                }
            }
        }
    }

    /// One streaming attempt against one account. Mirrors the buffered
    /// classification but keeps a successful response unconsumed so its body
    /// can be piped to the client.
    async fn try_account_stream<F>(
        &self,
        account_id: &str,
        creds: &OauthCredentials,
        build: F,
    ) -> StreamAttempt
    where
        F: Fn(&OauthCredentials) -> reqwest::RequestBuilder,
    {
        let resp = match build(creds).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(account_id = %account_id, error = %e, "Upstream stream request failed");
                return StreamAttempt::Rotate;
            }
        };
        if resp.status().is_success() {
            return StreamAttempt::Success(resp);
        }

        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        match classify_failure(status, &body) {
            Classified::Quota => {
                let _ = self.pool.mark_quota_exhausted(account_id).await;
                StreamAttempt::Rotate
            }
            Classified::Server => StreamAttempt::Rotate,
            Classified::Client => StreamAttempt::Reject(status, body),
            Classified::Auth => {
                let _ = self.pool.mark_auth_error(account_id).await;
                if refresh_account(&self.pool, &self.oauth, account_id, true, false)
                    .await
                    .is_err()
                {
                    return StreamAttempt::Rotate;
                }
                let Ok(fresh) = self.pool.credentials_for(account_id).await else {
                    return StreamAttempt::Rotate;
                };
                match build(&fresh).send().await {
                    Ok(retry) if retry.status().is_success() => StreamAttempt::Success(retry),
                    Ok(retry) => {
                        let status = retry.status();
                        let body = retry.bytes().await.unwrap_or_default();
                        match classify_failure(status, &body) {
                            Classified::Client => StreamAttempt::Reject(status, body),
                            _ => {
                                let _ = self.pool.mark_auth_error(account_id).await;
                                StreamAttempt::Rotate
                            }
                        }
                    }
                    Err(_) => StreamAttempt::Rotate,
                }
            }
        }
    }

    /// Normalize the upstream body and register the usage-counting completion
    /// callback.
    fn wrap_stream(&self, account_id: String, resp: reqwest::Response) -> StreamResponse {
        let counters = Arc::clone(&self.counters);
        let account_for_counters = account_id.clone();
        let normalized = normalize_sse_stream(resp.bytes_stream());
        let observed = observe_stream(normalized, move |outcome| {
            // Counters update only once the terminal record or the usage
            // chunk was actually observed; a client disconnect drops the
            // stream and credits nothing.
            if outcome.saw_terminal || outcome.saw_usage {
                counters.incr_request(&account_for_counters, RequestKind::Chat);
                counters.incr_tokens(
                    &account_for_counters,
                    outcome.input_tokens,
                    outcome.output_tokens,
                );
            }
        });
        StreamResponse {
            account_id,
            stream: observed.boxed(),
        }
    }

    /// Buffered chat completion. Returns the upstream JSON verbatim.
    pub async fn chat_completion(
        &self,
        body: serde_json::Value,
        pinned: Option<&str>,
    ) -> Result<BufferedResponse, DispatchError> {
        let mut tried = HashSet::new();
        let attempts_max = MAX_ATTEMPTS.min(self.pool.eligible_count().await.max(1));

        for _ in 0..attempts_max {
            let (account_id, creds) =
                match self.select_account(Purpose::Chat, pinned, &tried).await {
                    Ok(v) => v,
                    Err(SelectFailure::NoEligible) => break,
                    Err(SelectFailure::Validation(msg)) => {
                        return Err(DispatchError::Validation(msg))
                    }
                    Err(SelectFailure::RefreshFailed(id)) => {
                        tried.insert(id);
                        continue;
                    }
                };

            let outcome = self
                .try_account_buffered(&account_id, &creds, |creds| {
                    let base = api_base(creds.resource_url.as_deref());
                    self.http
                        .post(chat_completions_url(&base))
                        .header("Authorization", format!("Bearer {}", creds.access_token))
                        .timeout(self.chat_timeout)
                        .json(&body)
                })
                .await;

            match outcome {
                AttemptOutcome::Success(bytes) => {
                    self.counters.incr_request(&account_id, RequestKind::Chat);
                    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                        if let Some((input, output)) = usage_tokens(&v) {
                            self.counters.incr_tokens(&account_id, input, output);
                        }
                    }
                    return Ok(BufferedResponse {
                        account_id,
                        body: bytes,
                    });
                }
                AttemptOutcome::Rotate => {
                    tried.insert(account_id);
                }
                AttemptOutcome::Reject(status, body) => {
                    return Err(DispatchError::UpstreamRejected { status, body })
                }
            }
        }

        if tried.is_empty() {
            Err(DispatchError::NoEligibleAccount)
        } else {
            Err(DispatchError::UpstreamUnavailable)
        }
    }

    /// Streaming chat completion. The returned byte stream is already
    /// normalized into well-framed SSE records.
    pub async fn chat_completion_stream(
        &self,
        body: serde_json::Value,
        pinned: Option<&str>,
    ) -> Result<StreamResponse, DispatchError> {
        let mut tried = HashSet::new();
        let attempts_max = MAX_ATTEMPTS.min(self.pool.eligible_count().await.max(1));

        for _ in 0..attempts_max {
            let (account_id, creds) =
                match self.select_account(Purpose::Chat, pinned, &tried).await {
                    Ok(v) => v,
                    Err(SelectFailure::NoEligible) => break,
                    Err(SelectFailure::Validation(msg)) => {
                        return Err(DispatchError::Validation(msg))
                    }
                    Err(SelectFailure::RefreshFailed(id)) => {
                        tried.insert(id);
                        continue;
                    }
                };

            // No overall timeout on streaming requests: reqwest applies it to
            // the full body, which would kill long generations.
            let outcome = self
                .try_account_stream(&account_id, &creds, |creds| {
                    let base = api_base(creds.resource_url.as_deref());
                    self.http
                        .post(chat_completions_url(&base))
                        .header("Authorization", format!("Bearer {}", creds.access_token))
                        .json(&body)
                })
                .await;

            match outcome {
                StreamAttempt::Success(resp) => return Ok(self.wrap_stream(account_id, resp)),
                StreamAttempt::Rotate => {
                    tried.insert(account_id);
                }
                StreamAttempt::Reject(status, body) => {
                    return Err(DispatchError::UpstreamRejected { status, body })
                }
            }
        }

        if tried.is_empty() {
            Err(DispatchError::NoEligibleAccount)
        } else {
            Err(DispatchError::UpstreamUnavailable)
        }
    }

    /// Forward `GET /v1/models`, caching the vendor list for five minutes.
    /// A stale cache is served when every upstream attempt fails.
    pub async fn list_models(
        &self,
        pinned: Option<&str>,
    ) -> Result<serde_json::Value, DispatchError> {
        {
            let cache = self.models_cache.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < MODELS_CACHE_TTL {
                    return Ok(entry.body.clone());
                }
            }
        }

        let mut tried = HashSet::new();
        let attempts_max = MAX_ATTEMPTS.min(self.pool.eligible_count().await.max(1));
        for _ in 0..attempts_max {
            let (account_id, creds) =
                match self.select_account(Purpose::Chat, pinned, &tried).await {
                    Ok(v) => v,
                    Err(SelectFailure::NoEligible) => break,
                    Err(SelectFailure::Validation(msg)) => {
                        return Err(DispatchError::Validation(msg))
                    }
                    Err(SelectFailure::RefreshFailed(id)) => {
                        tried.insert(id);
                        continue;
                    }
                };

            let outcome = self
                .try_account_buffered(&account_id, &creds, |creds| {
                    let base = api_base(creds.resource_url.as_deref());
                    self.http
                        .get(models_url(&base))
                        .header("Authorization", format!("Bearer {}", creds.access_token))
                        .timeout(self.search_timeout)
                })
                .await;

            match outcome {
                AttemptOutcome::Success(bytes) => {
                    let parsed: serde_json::Value =
                        serde_json::from_slice(&bytes).map_err(|e| {
                            DispatchError::Validation(format!(
                                "invalid model list from upstream: {}",
                                e
                            ))
                        })?;
                    let mut cache = self.models_cache.write().await;
                    *cache = Some(ModelsCache {
                        fetched_at: Instant::now(),
                        body: parsed.clone(),
                    });
                    return Ok(parsed);
                }
                AttemptOutcome::Rotate => {
                    tried.insert(account_id);
                }
                AttemptOutcome::Reject(status, body) => {
                    return Err(DispatchError::UpstreamRejected { status, body })
                }
            }
        }

        // All attempts failed; a stale list beats no list.
        let cache = self.models_cache.read().await;
        if let Some(entry) = cache.as_ref() {
            tracing::warn!("Serving stale model list; upstream unavailable");
            return Ok(entry.body.clone());
        }
        if tried.is_empty() {
            Err(DispatchError::NoEligibleAccount)
        } else {
            Err(DispatchError::UpstreamUnavailable)
        }
    }

    /// Forward a web search. The inbound `query` becomes the vendor's `uq`
    /// field; the vendor envelope is returned verbatim.
    pub async fn web_search(
        &self,
        query: &str,
        page: Option<u32>,
        rows: Option<u32>,
        pinned: Option<&str>,
    ) -> Result<BufferedResponse, DispatchError> {
        if query.trim().is_empty() {
            return Err(DispatchError::Validation("query is required".to_string()));
        }
        let rows = rows.unwrap_or(10);
        if rows > MAX_SEARCH_ROWS {
            return Err(DispatchError::Validation(format!(
                "rows must be at most {}",
                MAX_SEARCH_ROWS
            )));
        }
        let page = page.unwrap_or(1);
        let upstream_body = serde_json::json!({
            "uq": query,
            "page": page,
            "rows": rows,
        });

        let mut tried = HashSet::new();
        let attempts_max = MAX_ATTEMPTS.min(self.pool.eligible_count().await.max(1));
        for _ in 0..attempts_max {
            let (account_id, creds) = match self
                .select_account(Purpose::Search, pinned, &tried)
                .await
            {
                Ok(v) => v,
                Err(SelectFailure::NoEligible) => break,
                Err(SelectFailure::Validation(msg)) => return Err(DispatchError::Validation(msg)),
                Err(SelectFailure::RefreshFailed(id)) => {
                    tried.insert(id);
                    continue;
                }
            };

            let outcome = self
                .try_account_buffered(&account_id, &creds, |creds| {
                    let base = api_base(creds.resource_url.as_deref());
                    self.http
                        .post(web_search_url(&base))
                        .header("Authorization", format!("Bearer {}", creds.access_token))
                        .timeout(self.search_timeout)
                        .json(&upstream_body)
                })
                .await;

            match outcome {
                AttemptOutcome::Success(bytes) => {
                    self.counters
                        .incr_request(&account_id, RequestKind::WebSearch);
                    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                        self.counters
                            .incr_search_results(&account_id, count_search_results(&v));
                    }
                    return Ok(BufferedResponse {
                        account_id,
                        body: bytes,
                    });
                }
                AttemptOutcome::Rotate => {
                    tried.insert(account_id);
                }
                AttemptOutcome::Reject(status, body) => {
                    return Err(DispatchError::UpstreamRejected { status, body })
                }
            }
        }

        if tried.is_empty() {
            Err(DispatchError::NoEligibleAccount)
        } else {
            Err(DispatchError::UpstreamUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStore;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Shared state for the mock vendor: behavior is keyed by bearer token.
    #[derive(Default)]
    struct MockVendor {
        chat_calls: AtomicUsize,
        models_calls: AtomicUsize,
        search_calls: AtomicUsize,
        token_calls: AtomicUsize,
    }

    async fn chat_handler(
        State(vendor): State<Arc<MockVendor>>,
        headers: HeaderMap,
    ) -> Response {
        vendor.chat_calls.fetch_add(1, Ordering::SeqCst);
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim_start_matches("Bearer ")
            .to_string();
        match bearer.as_str() {
            "T-quota" => (
                StatusCode::TOO_MANY_REQUESTS,
                "Free allocated quota exceeded",
            )
                .into_response(),
            "T-500" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
            "T-401" => (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
            "T-404" => (StatusCode::NOT_FOUND, "model not found").into_response(),
            "T-stream" => {
                let body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
                            data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":3}}\n\n\
                            data: [DONE]\n\n";
                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from(body))
                    .unwrap()
            }
            _ => Json(serde_json::json!({
                "id": "c1",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8},
            }))
            .into_response(),
        }
    }

    async fn models_handler(State(vendor): State<Arc<MockVendor>>) -> Response {
        vendor.models_calls.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({
            "object": "list",
            "data": [{"id": "qwen3-coder-plus", "object": "model"}],
        }))
        .into_response()
    }

    async fn search_handler(
        State(vendor): State<Arc<MockVendor>>,
        body: Bytes,
    ) -> Response {
        vendor.search_calls.fetch_add(1, Ordering::SeqCst);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v.get("uq").is_some(), "query must be renamed to uq");
        assert!(v.get("query").is_none());
        Json(serde_json::json!({
            "results": [
                {"title": "a"}, {"title": "b"}, {"title": "c"}
            ],
            "echo": v,
        }))
        .into_response()
    }

    async fn token_handler(State(vendor): State<Arc<MockVendor>>) -> Response {
        vendor.token_calls.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({
            "access_token": "T-fresh",
            "expires_in": 3600,
        }))
        .into_response()
    }

    struct Harness {
        dispatcher: Dispatcher,
        pool: Arc<AccountPool>,
        counters: Arc<UsageCounters>,
        vendor: Arc<MockVendor>,
        _dir: tempfile::TempDir,
    }

    async fn harness(accounts: &[(&str, &str, i64)]) -> Harness {
        let vendor = Arc::new(MockVendor::default());
        let router = Router::new()
            .route("/v1/chat/completions", post(chat_handler))
            .route("/v1/models", get(models_handler))
            .route("/api/v1/indices/plugin/web_search", post(search_handler))
            .route("/api/v1/oauth2/token", post(token_handler))
            .with_state(Arc::clone(&vendor));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let base = format!("http://{}", addr);

        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AccountPool::new(AccountStore::new(dir.path())));
        for (id, token, expiry_minutes) in accounts {
            pool.add(
                id,
                OauthCredentials {
                    access_token: token.to_string(),
                    refresh_token: "R1".to_string(),
                    token_type: "Bearer".to_string(),
                    expiry_timestamp: Utc::now().timestamp_millis() + expiry_minutes * 60_000,
                    resource_url: Some(base.clone()),
                    code_verifier: None,
                },
            )
            .await
            .unwrap();
        }

        let counters = UsageCounters::start(dir.path().join("request_counts.json"));
        let oauth = OauthClient::with_base_url(reqwest::Client::new(), base);
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            oauth,
            Arc::clone(&counters),
            reqwest::Client::new(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        Harness {
            dispatcher,
            pool,
            counters,
            vendor,
            _dir: dir,
        }
    }

    fn chat_body() -> serde_json::Value {
        serde_json::json!({
            "model": "qwen3-coder-plus",
            "messages": [{"role": "user", "content": "hi"}],
        })
    }

    #[tokio::test]
    async fn buffered_chat_passes_body_through_and_counts_usage() {
        let h = harness(&[("acct1", "T-ok", 60)]).await;
        let resp = h.dispatcher.chat_completion(chat_body(), None).await.unwrap();
        assert_eq!(resp.account_id, "acct1");
        let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(v["id"], "c1");
        assert_eq!(v["usage"]["total_tokens"], 8);

        h.counters.flush().await;
        let today = h.counters.get_today("acct1").await;
        assert_eq!(today.chat_requests, 1);
        assert_eq!(today.input_tokens, 5);
        assert_eq!(today.output_tokens, 3);
    }

    #[tokio::test]
    async fn quota_failure_rotates_to_second_account() {
        let h = harness(&[("acct1", "T-quota", 60), ("acct2", "T-ok", 60)]).await;
        // Force acct1 to go first.
        h.pool.pick_pinned("acct2").await.unwrap();

        let resp = h.dispatcher.chat_completion(chat_body(), None).await.unwrap();
        assert_eq!(resp.account_id, "acct2");

        let snapshots = h.pool.snapshots().await;
        let acct1 = snapshots.iter().find(|s| s.account_id == "acct1").unwrap();
        assert!(acct1.quota_exhausted_until.unwrap() > Utc::now());

        h.counters.flush().await;
        assert_eq!(h.counters.get_today("acct2").await.chat_requests, 1);
        assert_eq!(h.counters.get_today("acct1").await.chat_requests, 0);
    }

    #[tokio::test]
    async fn other_4xx_returns_without_rotation() {
        let h = harness(&[("acct1", "T-404", 60), ("acct2", "T-ok", 60)]).await;
        h.pool.pick_pinned("acct2").await.unwrap();

        let err = h.dispatcher.chat_completion(chat_body(), None).await.unwrap_err();
        match err {
            DispatchError::UpstreamRejected { status, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // Exactly one upstream call: no rotation on a plain 4xx.
        assert_eq!(h.vendor.chat_calls.load(Ordering::SeqCst), 1);
        h.counters.flush().await;
        assert_eq!(h.counters.totals_today().await.chat_requests, 0);
    }

    #[tokio::test]
    async fn auth_error_refreshes_inline_and_retries_same_account() {
        let h = harness(&[("acct1", "T-401", 60)]).await;
        let resp = h.dispatcher.chat_completion(chat_body(), None).await.unwrap();
        assert_eq!(resp.account_id, "acct1");
        // One failed call, one refresh, one retried call with the new token.
        assert_eq!(h.vendor.chat_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.vendor.token_calls.load(Ordering::SeqCst), 1);
        let creds = h.pool.credentials_for("acct1").await.unwrap();
        assert_eq!(creds.access_token, "T-fresh");
    }

    #[tokio::test]
    async fn exhausted_attempts_return_upstream_unavailable() {
        let h = harness(&[("a", "T-500", 60), ("b", "T-500", 60), ("c", "T-500", 60)]).await;
        let err = h.dispatcher.chat_completion(chat_body(), None).await.unwrap_err();
        assert!(matches!(err, DispatchError::UpstreamUnavailable));
        assert_eq!(h.vendor.chat_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_pool_is_no_eligible_account() {
        let h = harness(&[]).await;
        let err = h.dispatcher.chat_completion(chat_body(), None).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoEligibleAccount));
    }

    #[tokio::test]
    async fn pinned_account_is_honored() {
        let h = harness(&[("acct1", "T-ok", 60), ("acct2", "T-ok", 60)]).await;
        for _ in 0..3 {
            let resp = h
                .dispatcher
                .chat_completion(chat_body(), Some("acct2"))
                .await
                .unwrap();
            assert_eq!(resp.account_id, "acct2");
        }
    }

    #[tokio::test]
    async fn pinned_unknown_account_is_a_validation_error() {
        let h = harness(&[("acct1", "T-ok", 60)]).await;
        let err = h
            .dispatcher
            .chat_completion(chat_body(), Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn near_expiry_token_refreshes_before_use() {
        // Expires in ~30 seconds, inside the 60 s skew window.
        let h = harness(&[("acct1", "T-stale", 0)]).await;
        let resp = h.dispatcher.chat_completion(chat_body(), None).await.unwrap();
        assert_eq!(resp.account_id, "acct1");
        assert_eq!(h.vendor.token_calls.load(Ordering::SeqCst), 1);
        // The forwarded call used the refreshed token (mock answers 200 for it).
        let creds = h.pool.credentials_for("acct1").await.unwrap();
        assert_eq!(creds.access_token, "T-fresh");
    }

    #[tokio::test]
    async fn streaming_chat_normalizes_and_counts_after_done() {
        let h = harness(&[("acct1", "T-stream", 60)]).await;
        let resp = h
            .dispatcher
            .chat_completion_stream(chat_body(), None)
            .await
            .unwrap();
        let lines: Vec<String> = resp
            .stream
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await;
        let joined = lines.concat();
        assert!(joined.ends_with("data: [DONE]\n\n"));
        // Every emitted piece is a complete line.
        for line in &lines {
            assert!(line.ends_with('\n'));
        }

        h.counters.flush().await;
        let today = h.counters.get_today("acct1").await;
        assert_eq!(today.chat_requests, 1);
        assert_eq!(today.input_tokens, 5);
        assert_eq!(today.output_tokens, 3);
    }

    #[tokio::test]
    async fn model_list_is_cached() {
        let h = harness(&[("acct1", "T-ok", 60)]).await;
        let first = h.dispatcher.list_models(None).await.unwrap();
        assert_eq!(first["data"][0]["id"], "qwen3-coder-plus");
        let _second = h.dispatcher.list_models(None).await.unwrap();
        assert_eq!(h.vendor.models_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn web_search_renames_query_and_counts_results() {
        let h = harness(&[("acct1", "T-ok", 60)]).await;
        let resp = h
            .dispatcher
            .web_search("rust gateways", Some(1), Some(100), None)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(v["echo"]["uq"], "rust gateways");
        assert_eq!(v["echo"]["rows"], 100);

        h.counters.flush().await;
        let today = h.counters.get_today("acct1").await;
        assert_eq!(today.web_search_requests, 1);
        assert_eq!(today.web_search_results, 3);
    }

    #[tokio::test]
    async fn web_search_rows_over_limit_short_circuits() {
        let h = harness(&[("acct1", "T-ok", 60)]).await;
        let err = h
            .dispatcher
            .web_search("q", None, Some(101), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        // Validation happens before any account is selected or called.
        assert_eq!(h.vendor.search_calls.load(Ordering::SeqCst), 0);
    }
}
