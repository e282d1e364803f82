//! The account pool: owns every loaded account's mutable state, arbitrates
//! concurrent use, and serializes credential swaps.
//!
//! Selection (`pick`) uses a read pass over the pool index so it never blocks
//! behind an in-flight refresh; refreshes and state marks take the per-account
//! critical section. The refresh lock lives here and nowhere else: the
//! scheduler and the router both go through [`AccountPool::try_lock_for_refresh`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::store::AccountStore;
use super::{
    next_utc_midnight, AccountRuntime, AccountSnapshot, OauthCredentials, Purpose,
    AUTH_ERROR_THRESHOLD,
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no eligible upstream account is available")]
    NoEligibleAccount,

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account persistence failed: {0}")]
    Persistence(#[from] std::io::Error),
}

#[derive(Debug)]
struct AccountState {
    credentials: OauthCredentials,
    runtime: AccountRuntime,
}

#[derive(Debug)]
struct AccountEntry {
    state: RwLock<AccountState>,
    refresh_lock: Arc<Mutex<()>>,
    refreshing: AtomicBool,
}

/// Held while a refresh for one account is in flight. At most one exists per
/// account at any instant; dropping it releases the account for selection.
pub struct RefreshGuard {
    _guard: OwnedMutexGuard<()>,
    entry: Arc<AccountEntry>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.entry.refreshing.store(false, Ordering::SeqCst);
    }
}

/// Pool of vendor accounts, backed by one credential file per account.
pub struct AccountPool {
    accounts: RwLock<HashMap<String, Arc<AccountEntry>>>,
    store: AccountStore,
}

impl AccountPool {
    pub fn new(store: AccountStore) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Hydrate the pool from persistent storage. Unreadable account files are
    /// skipped by the store; the pool keeps whatever loaded.
    pub async fn load_all(&self) {
        let loaded = self.store.load_all();
        let mut accounts = self.accounts.write().await;
        for (account_id, credentials) in loaded {
            accounts.insert(
                account_id,
                Arc::new(AccountEntry {
                    state: RwLock::new(AccountState {
                        credentials,
                        runtime: AccountRuntime::default(),
                    }),
                    refresh_lock: Arc::new(Mutex::new(())),
                    refreshing: AtomicBool::new(false),
                }),
            );
        }
        tracing::info!(accounts = accounts.len(), "Account pool hydrated");
    }

    /// Add (or re-authorize) an account. Credentials are persisted before the
    /// in-memory state changes, so a failed write leaves the pool untouched.
    pub async fn add(
        &self,
        account_id: &str,
        credentials: OauthCredentials,
    ) -> Result<(), PoolError> {
        self.store.save(account_id, &credentials)?;
        let mut accounts = self.accounts.write().await;
        accounts.insert(
            account_id.to_string(),
            Arc::new(AccountEntry {
                state: RwLock::new(AccountState {
                    credentials,
                    runtime: AccountRuntime::default(),
                }),
                refresh_lock: Arc::new(Mutex::new(())),
                refreshing: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Remove an account and its credential file. Returns false when the
    /// account was not present.
    pub async fn remove(&self, account_id: &str) -> Result<bool, PoolError> {
        let existed_on_disk = self.store.remove(account_id)?;
        let mut accounts = self.accounts.write().await;
        let existed_in_memory = accounts.remove(account_id).is_some();
        Ok(existed_on_disk || existed_in_memory)
    }

    async fn entry(&self, account_id: &str) -> Result<Arc<AccountEntry>, PoolError> {
        let accounts = self.accounts.read().await;
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownAccount(account_id.to_string()))
    }

    async fn is_eligible(entry: &AccountEntry) -> bool {
        if entry.refreshing.load(Ordering::SeqCst) {
            return false;
        }
        let state = entry.state.read().await;
        let runtime = &state.runtime;
        if runtime.auth_dead || runtime.consecutive_auth_errors >= AUTH_ERROR_THRESHOLD {
            return false;
        }
        match runtime.quota_exhausted_until {
            Some(until) => until <= Utc::now(),
            None => true,
        }
    }

    /// Pick an eligible account for `purpose`, excluding ids already tried in
    /// the current attempt loop. Ties break round-robin: least recently used
    /// first, never-used before everything.
    pub async fn pick(
        &self,
        _purpose: Purpose,
        exclude: &HashSet<String>,
    ) -> Result<String, PoolError> {
        let accounts = self.accounts.read().await;
        let mut best: Option<(String, Arc<AccountEntry>, Option<chrono::DateTime<Utc>>)> = None;
        for (id, entry) in accounts.iter() {
            if exclude.contains(id) {
                continue;
            }
            if !Self::is_eligible(entry).await {
                continue;
            }
            let last_used = entry.state.read().await.runtime.last_used_at;
            let better = match &best {
                None => true,
                Some((_, _, best_last)) => match (last_used, best_last) {
                    (None, None) => false,
                    (None, Some(_)) => true,
                    (Some(_), None) => false,
                    (Some(a), Some(b)) => a < *b,
                },
            };
            if better {
                best = Some((id.clone(), Arc::clone(entry), last_used));
            }
        }
        drop(accounts);

        let (id, entry, _) = best.ok_or(PoolError::NoEligibleAccount)?;
        entry.state.write().await.runtime.last_used_at = Some(Utc::now());
        Ok(id)
    }

    /// Check a caller-pinned account: it must exist and be eligible.
    pub async fn pick_pinned(&self, account_id: &str) -> Result<String, PoolError> {
        let entry = self.entry(account_id).await?;
        if !Self::is_eligible(&entry).await {
            return Err(PoolError::NoEligibleAccount);
        }
        entry.state.write().await.runtime.last_used_at = Some(Utc::now());
        Ok(account_id.to_string())
    }

    /// How many accounts would currently qualify for selection.
    pub async fn eligible_count(&self) -> usize {
        let accounts = self.accounts.read().await;
        let mut count = 0;
        for entry in accounts.values() {
            if Self::is_eligible(entry).await {
                count += 1;
            }
        }
        count
    }

    /// Snapshot the credentials of one account. Never hands out a mutable
    /// reference; the clone stays valid across a concurrent refresh swap.
    pub async fn credentials_for(&self, account_id: &str) -> Result<OauthCredentials, PoolError> {
        let entry = self.entry(account_id).await?;
        let state = entry.state.read().await;
        Ok(state.credentials.clone())
    }

    /// Mark the account quota-exhausted until the next UTC midnight.
    pub async fn mark_quota_exhausted(&self, account_id: &str) -> Result<(), PoolError> {
        let entry = self.entry(account_id).await?;
        let until = next_utc_midnight(Utc::now());
        entry.state.write().await.runtime.quota_exhausted_until = Some(until);
        tracing::warn!(
            account_id = %account_id,
            until = %until,
            "Account quota exhausted, parked until UTC midnight"
        );
        Ok(())
    }

    /// Record an upstream auth failure. Returns the new consecutive count.
    pub async fn mark_auth_error(&self, account_id: &str) -> Result<u32, PoolError> {
        let entry = self.entry(account_id).await?;
        let mut state = entry.state.write().await;
        state.runtime.consecutive_auth_errors =
            state.runtime.consecutive_auth_errors.saturating_add(1);
        let count = state.runtime.consecutive_auth_errors;
        if count >= AUTH_ERROR_THRESHOLD {
            tracing::warn!(
                account_id = %account_id,
                consecutive_auth_errors = count,
                "Account disqualified until a refresh succeeds"
            );
        }
        Ok(count)
    }

    /// Terminally disable an account whose refresh token was rejected with
    /// `invalid_grant`. Only removal + re-authorization revives it.
    pub async fn mark_auth_dead(&self, account_id: &str) -> Result<(), PoolError> {
        let entry = self.entry(account_id).await?;
        entry.state.write().await.runtime.auth_dead = true;
        tracing::warn!(
            account_id = %account_id,
            "Refresh token rejected (invalid_grant); account needs re-authorization"
        );
        Ok(())
    }

    /// Acquire the per-account refresh lock without waiting. Returns `None`
    /// when another refresh already holds it.
    pub async fn try_lock_for_refresh(
        &self,
        account_id: &str,
    ) -> Result<Option<RefreshGuard>, PoolError> {
        let entry = self.entry(account_id).await?;
        let lock = Arc::clone(&entry.refresh_lock);
        match lock.try_lock_owned() {
            Ok(guard) => {
                entry.refreshing.store(true, Ordering::SeqCst);
                Ok(Some(RefreshGuard {
                    _guard: guard,
                    entry,
                }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Acquire the per-account refresh lock, waiting for a concurrent holder.
    pub async fn lock_for_refresh(&self, account_id: &str) -> Result<RefreshGuard, PoolError> {
        let entry = self.entry(account_id).await?;
        let lock = Arc::clone(&entry.refresh_lock);
        let guard = lock.lock_owned().await;
        entry.refreshing.store(true, Ordering::SeqCst);
        Ok(RefreshGuard {
            _guard: guard,
            entry,
        })
    }

    /// Install refreshed credentials: persist first, then swap in memory,
    /// reset the auth-failure state, and keep expiry monotonic.
    ///
    /// Callers must hold the account's [`RefreshGuard`].
    pub async fn install_credentials(
        &self,
        account_id: &str,
        mut credentials: OauthCredentials,
    ) -> Result<(), PoolError> {
        let entry = self.entry(account_id).await?;
        {
            let state = entry.state.read().await;
            if credentials.expiry_timestamp <= state.credentials.expiry_timestamp {
                tracing::warn!(
                    account_id = %account_id,
                    old_expiry = state.credentials.expiry_timestamp,
                    new_expiry = credentials.expiry_timestamp,
                    "Refreshed credentials do not extend expiry; keeping the later timestamp"
                );
                credentials.expiry_timestamp = state.credentials.expiry_timestamp;
            }
        }
        self.store.save(account_id, &credentials)?;
        let mut state = entry.state.write().await;
        state.credentials = credentials;
        state.runtime.consecutive_auth_errors = 0;
        state.runtime.auth_dead = false;
        Ok(())
    }

    pub async fn ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().await;
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    /// Read-only views for `/health` and the account admin endpoints.
    pub async fn snapshots(&self) -> Vec<AccountSnapshot> {
        let accounts = self.accounts.read().await;
        let mut out = Vec::with_capacity(accounts.len());
        for (id, entry) in accounts.iter() {
            let state = entry.state.read().await;
            out.push(AccountSnapshot {
                account_id: id.clone(),
                health: AccountSnapshot::classify(&state.credentials, &state.runtime),
                expires_at: state.credentials.expires_at(),
                minutes_until_expiry: state.credentials.minutes_left(),
                consecutive_auth_errors: state.runtime.consecutive_auth_errors,
                auth_dead: state.runtime.auth_dead,
                quota_exhausted_until: state.runtime.quota_exhausted_until,
                last_used_at: state.runtime.last_used_at,
            });
        }
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }
}
