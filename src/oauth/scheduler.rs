//! Background token refresh.
//!
//! Runs once at startup and then on a fixed five-minute tick. Accounts are
//! selected when they are inside the hard ten-minute window, already expired,
//! or inside a per-account random threshold drawn from [10, 30] minutes each
//! tick. The jitter de-synchronizes mass refreshes across a large pool.
//! Selected accounts refresh in parallel batches of at most twenty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::account::{AccountPool, PoolError};
use crate::audit::AuditLog;
use crate::oauth::{apply_token_bundle, OauthClient, OauthError};

/// Hard refresh window: anything expiring within this many minutes refreshes.
const HARD_THRESHOLD_MINUTES: f64 = 10.0;

/// Upper bound of the randomized refresh threshold.
const JITTER_MAX_MINUTES: f64 = 30.0;

/// How many refreshes run concurrently within one sweep.
const BATCH_SIZE: usize = 20;

/// Tokens expiring within this many seconds are treated as already stale.
pub const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// What one `refresh_account` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another refresh held the lock and the caller chose not to wait.
    SkippedLocked,
    /// The token was already fresh once the lock was acquired.
    SkippedFresh,
}

/// Refresh one account's token through the pool's per-account lock.
///
/// With `wait` the caller blocks on a concurrent holder and then re-checks
/// expiry, so a request that raced a scheduler sweep does not refresh twice.
/// `invalid_grant` marks the account dead before the error propagates.
pub async fn refresh_account(
    pool: &AccountPool,
    oauth: &OauthClient,
    account_id: &str,
    wait: bool,
    skip_if_fresh: bool,
) -> Result<RefreshOutcome, RefreshError> {
    let guard = if wait {
        pool.lock_for_refresh(account_id).await?
    } else {
        match pool.try_lock_for_refresh(account_id).await? {
            Some(guard) => guard,
            None => return Ok(RefreshOutcome::SkippedLocked),
        }
    };

    let current = pool.credentials_for(account_id).await?;
    if skip_if_fresh && !current.expires_within(EXPIRY_SKEW_SECS) {
        drop(guard);
        return Ok(RefreshOutcome::SkippedFresh);
    }

    let result = oauth.refresh(&current.refresh_token).await;
    let bundle = match result {
        Ok(bundle) => bundle,
        Err(OauthError::InvalidGrant) => {
            pool.mark_auth_dead(account_id).await?;
            drop(guard);
            return Err(OauthError::InvalidGrant.into());
        }
        Err(e) => {
            drop(guard);
            return Err(e.into());
        }
    };

    let merged = apply_token_bundle(&current, bundle);
    pool.install_credentials(account_id, merged).await?;
    drop(guard);
    tracing::info!(account_id = %account_id, "Access token refreshed");
    Ok(RefreshOutcome::Refreshed)
}

/// Per-account result of one scheduler sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepEntry {
    pub account_id: String,
    pub outcome: String,
}

/// Summary of one scheduler sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub entries: Vec<SweepEntry>,
}

/// The background refresh scheduler.
pub struct RefreshScheduler {
    pool: Arc<AccountPool>,
    oauth: OauthClient,
    audit: Arc<AuditLog>,
    in_progress: AtomicBool,
    tick: Duration,
}

impl RefreshScheduler {
    pub fn new(pool: Arc<AccountPool>, oauth: OauthClient, audit: Arc<AuditLog>) -> Self {
        Self {
            pool,
            oauth,
            audit,
            in_progress: AtomicBool::new(false),
            tick: Duration::from_secs(300),
        }
    }

    /// Spawn the scheduler loop: one sweep immediately, then every tick.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.tick);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.sweep(false).await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Refresh scheduler stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Run one sweep. Overlapping invocations are dropped: if a previous
    /// sweep is still running, this returns an empty report immediately.
    pub async fn sweep(&self, force: bool) -> SweepReport {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Refresh sweep already in progress, skipping tick");
            return SweepReport::default();
        }
        let report = self.sweep_inner(force).await;
        self.in_progress.store(false, Ordering::SeqCst);
        report
    }

    async fn sweep_inner(&self, force: bool) -> SweepReport {
        let mut selected = Vec::new();
        let mut skipped = 0usize;
        for account_id in self.pool.ids().await {
            let Ok(creds) = self.pool.credentials_for(&account_id).await else {
                continue;
            };
            let minutes_left = creds.minutes_left();
            let threshold = rand::thread_rng().gen_range(HARD_THRESHOLD_MINUTES..=JITTER_MAX_MINUTES);
            if force || minutes_left <= HARD_THRESHOLD_MINUTES || minutes_left <= threshold {
                selected.push(account_id);
            } else {
                skipped += 1;
            }
        }

        if selected.is_empty() {
            return SweepReport {
                skipped,
                ..Default::default()
            };
        }
        tracing::info!(selected = selected.len(), force, "Refresh sweep starting");

        let results: Vec<SweepEntry> = stream::iter(selected)
            .map(|account_id| async move {
                let outcome = refresh_account(
                    &self.pool,
                    &self.oauth,
                    &account_id,
                    false,
                    !force,
                )
                .await;
                let outcome_str = match outcome {
                    Ok(RefreshOutcome::Refreshed) => "refreshed".to_string(),
                    Ok(RefreshOutcome::SkippedLocked) => "skipped_locked".to_string(),
                    Ok(RefreshOutcome::SkippedFresh) => "skipped_fresh".to_string(),
                    Err(e) => {
                        tracing::warn!(account_id = %account_id, error = %e, "Scheduled refresh failed");
                        format!("failed: {}", e)
                    }
                };
                self.audit
                    .record("scheduler", None, "refresh", &account_id)
                    .await;
                SweepEntry {
                    account_id,
                    outcome: outcome_str,
                }
            })
            .buffer_unordered(BATCH_SIZE)
            .collect()
            .await;

        let mut report = SweepReport {
            skipped,
            ..Default::default()
        };
        for entry in results {
            if entry.outcome == "refreshed" {
                report.refreshed += 1;
            } else if entry.outcome.starts_with("failed") {
                report.failed += 1;
            } else {
                report.skipped += 1;
            }
            report.entries.push(entry);
        }
        tracing::info!(
            refreshed = report.refreshed,
            failed = report.failed,
            skipped = report.skipped,
            "Refresh sweep finished"
        );
        report
    }
}
