//! OAuth lifecycle for vendor accounts: RFC 8628 device flow for account
//! creation and refresh-token exchange for renewal.

pub mod device;
pub mod pkce;
pub mod scheduler;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

use crate::account::OauthCredentials;

/// Vendor chat host carrying the OAuth endpoints.
pub const CHAT_HOST: &str = "https://chat.qwen.ai";

/// Public OAuth client id of the device-flow client.
pub const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// Scopes requested during device authorization.
pub const SCOPE: &str = "openid profile email model.completion";

/// API base used when an account's credentials carry no `resource_url`.
pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

const DEVICE_CODE_PATH: &str = "/api/v1/oauth2/device/code";
const TOKEN_PATH: &str = "/api/v1/oauth2/token";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Error)]
pub enum OauthError {
    #[error("device authorization failed ({status}): {body}")]
    DeviceAuth { status: u16, body: String },

    #[error("token endpoint error: {0}")]
    TokenEndpoint(String),

    #[error("refresh token no longer valid (invalid_grant)")]
    InvalidGrant,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Vendor response to a device authorization request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Vendor response to a successful token request (device grant or refresh).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub resource_url: Option<String>,
}

/// Outcome of one device-flow poll.
#[derive(Debug)]
pub enum PollOutcome {
    Pending,
    /// The vendor asked us to poll less often; callers add 5 s to the interval.
    SlowDown,
    Completed(TokenBundle),
    Expired,
    Denied,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// HTTP client for the vendor's OAuth endpoints.
#[derive(Debug, Clone)]
pub struct OauthClient {
    http: reqwest::Client,
    base_url: String,
}

impl OauthClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, CHAT_HOST)
    }

    /// Point the client at a different host (tests use an in-process mock).
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Start a device authorization: generates the PKCE pair, calls the
    /// device-code endpoint, and returns the vendor response together with
    /// the verifier the caller must feed back into [`poll_device_token`].
    pub async fn initiate_device_flow(
        &self,
    ) -> Result<(DeviceAuthorization, String), OauthError> {
        let code_verifier = pkce::generate_code_verifier();
        let code_challenge = pkce::compute_code_challenge(&code_verifier);

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, DEVICE_CODE_PATH))
            .form(&[
                ("client_id", CLIENT_ID),
                ("scope", SCOPE),
                ("code_challenge", code_challenge.as_str()),
                ("code_challenge_method", "S256"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(OauthError::DeviceAuth { status, body });
        }

        let authorization: DeviceAuthorization = resp.json().await?;
        Ok((authorization, code_verifier))
    }

    /// Poll the token endpoint for one device-flow attempt.
    pub async fn poll_device_token(
        &self,
        device_code: &str,
        code_verifier: &str,
    ) -> Result<PollOutcome, OauthError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, TOKEN_PATH))
            .form(&[
                ("grant_type", DEVICE_GRANT_TYPE),
                ("client_id", CLIENT_ID),
                ("device_code", device_code),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await?;

        if resp.status().is_success() {
            let bundle: TokenBundle = resp.json().await?;
            return Ok(PollOutcome::Completed(bundle));
        }

        let body = resp.text().await.unwrap_or_default();
        let err: TokenEndpointError = serde_json::from_str(&body).unwrap_or(TokenEndpointError {
            error: String::new(),
            error_description: None,
        });
        match err.error.as_str() {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            "expired_token" => Ok(PollOutcome::Expired),
            "access_denied" => Ok(PollOutcome::Denied),
            _ => Err(OauthError::TokenEndpoint(
                err.error_description.unwrap_or(body),
            )),
        }
    }

    /// Exchange a refresh token for a new credential bundle.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, OauthError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, TOKEN_PATH))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", CLIENT_ID),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        if resp.status().is_success() {
            let bundle: TokenBundle = resp.json().await?;
            return Ok(bundle);
        }

        let body = resp.text().await.unwrap_or_default();
        let err: TokenEndpointError = serde_json::from_str(&body).unwrap_or(TokenEndpointError {
            error: String::new(),
            error_description: None,
        });
        if err.error == "invalid_grant" {
            return Err(OauthError::InvalidGrant);
        }
        Err(OauthError::TokenEndpoint(
            err.error_description.unwrap_or(body),
        ))
    }
}

/// Merge a token response into existing credentials.
///
/// The vendor may omit `refresh_token` and `resource_url` in refresh
/// responses; both are preserved from the previous bundle in that case. The
/// new expiry is `now + expires_in`.
pub fn apply_token_bundle(current: &OauthCredentials, bundle: TokenBundle) -> OauthCredentials {
    OauthCredentials {
        access_token: bundle.access_token,
        refresh_token: bundle
            .refresh_token
            .unwrap_or_else(|| current.refresh_token.clone()),
        token_type: bundle
            .token_type
            .unwrap_or_else(|| current.token_type.clone()),
        expiry_timestamp: Utc::now().timestamp_millis() + bundle.expires_in as i64 * 1000,
        resource_url: bundle.resource_url.or_else(|| current.resource_url.clone()),
        code_verifier: current.code_verifier.clone(),
    }
}

/// Build credentials from a completed device-flow token response.
pub fn credentials_from_bundle(bundle: TokenBundle, code_verifier: &str) -> OauthCredentials {
    OauthCredentials {
        access_token: bundle.access_token,
        refresh_token: bundle.refresh_token.unwrap_or_default(),
        token_type: bundle.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expiry_timestamp: Utc::now().timestamp_millis() + bundle.expires_in as i64 * 1000,
        resource_url: bundle.resource_url,
        code_verifier: Some(code_verifier.to_string()),
    }
}
