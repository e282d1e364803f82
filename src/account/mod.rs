//! Vendor account state: OAuth credential bundles plus the runtime flags the
//! pool uses to decide eligibility.

pub mod pool;
pub mod store;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub use pool::{AccountPool, PoolError, RefreshGuard};
pub use store::AccountStore;

/// The account id used for the legacy single-account credential file.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Persisted OAuth credential bundle for one vendor account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry in epoch milliseconds.
    pub expiry_timestamp: i64,
    /// Vendor-chosen API base, stored raw and normalized on use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    /// PKCE verifier kept across a device-flow initiate/poll pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OauthCredentials {
    /// Expiry as a wall-clock timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.expiry_timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Whether the token expires within `skew_secs` seconds of now.
    pub fn expires_within(&self, skew_secs: i64) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        self.expiry_timestamp <= now_ms + skew_secs * 1000
    }

    /// Minutes until expiry (negative when already expired).
    pub fn minutes_left(&self) -> f64 {
        (self.expiry_timestamp - Utc::now().timestamp_millis()) as f64 / 60_000.0
    }
}

/// How an account will be used; reserved for purpose-specific selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Chat,
    Search,
}

/// Mutable runtime flags for one account. Owned exclusively by the pool.
#[derive(Debug, Clone, Default)]
pub struct AccountRuntime {
    /// Consecutive upstream 401/403 results. At 3 the account is skipped
    /// until a refresh succeeds.
    pub consecutive_auth_errors: u32,
    /// Set when the vendor answered a refresh with `invalid_grant`; cleared
    /// only by removing and re-authorizing the account.
    pub auth_dead: bool,
    /// Account is skipped until this instant (next UTC midnight after a
    /// quota failure).
    pub quota_exhausted_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Threshold at which consecutive auth errors disqualify an account.
pub const AUTH_ERROR_THRESHOLD: u32 = 3;

/// Health classification reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountHealth {
    Healthy,
    ExpiringSoon,
    Expired,
    Failed,
}

/// Read-only view of an account for API responses. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub health: AccountHealth,
    pub expires_at: DateTime<Utc>,
    pub minutes_until_expiry: f64,
    pub consecutive_auth_errors: u32,
    pub auth_dead: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_exhausted_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AccountSnapshot {
    pub(crate) fn classify(creds: &OauthCredentials, runtime: &AccountRuntime) -> AccountHealth {
        if runtime.auth_dead || runtime.consecutive_auth_errors >= AUTH_ERROR_THRESHOLD {
            AccountHealth::Failed
        } else if creds.minutes_left() <= 0.0 {
            AccountHealth::Expired
        } else if creds.minutes_left() < 30.0 {
            AccountHealth::ExpiringSoon
        } else {
            AccountHealth::Healthy
        }
    }
}

/// The UTC midnight that follows `now` (quota counters reset there).
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(naive) => Utc.from_utc_datetime(&naive),
        None => now,
    }
}
