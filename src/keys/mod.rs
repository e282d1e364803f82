//! Local API-key store.
//!
//! Keys gate every forwarded request. On disk we keep a PBKDF2-HMAC-SHA256
//! hash (260,000 iterations, 32-byte salt, 64-byte derived key) plus display
//! affixes; the raw key exists only in the creation response. Verification
//! compares with constant-time equality and runs on the blocking pool so the
//! request scheduler stays responsive.

pub mod rate_limit;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hmac::Hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Every issued key starts with this prefix.
pub const KEY_PREFIX: &str = "sk-proj-";

/// Hex characters following the prefix in a raw key.
pub const KEY_RANDOM_HEX_LEN: usize = 48;

/// PBKDF2 iteration count for newly created keys.
pub const PBKDF2_ITERATIONS: u32 = 260_000;

const SALT_LEN: usize = 32;
const DERIVED_KEY_LEN: usize = 64;

/// What a key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "chat.completions")]
    ChatCompletions,
    #[serde(rename = "models.list")]
    ModelsList,
    #[serde(rename = "full_access")]
    FullAccess,
}

/// Whether `granted` satisfies a required permission. `full_access` bypasses
/// the endpoint-permission map entirely.
pub fn allows(granted: &[Permission], required: Permission) -> bool {
    granted.contains(&Permission::FullAccess) || granted.contains(&required)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
    Revoked,
}

/// Optional per-key sliding-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

/// A key record as persisted. The raw value is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex PBKDF2-HMAC-SHA256 digest of the raw key.
    pub key_hash: String,
    /// Hex 32-byte salt.
    pub salt: String,
    pub iterations: u32,
    /// Leading characters of the raw key, for display.
    pub key_prefix: String,
    /// Trailing characters of the raw key, for display.
    pub key_suffix: String,
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
}

/// Metadata view handed to callers (list, validate). Carries no hash or salt.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyMetadata {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub key_prefix: String,
    pub key_suffix: String,
    pub permissions: Vec<Permission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

impl From<&ApiKeyRecord> for ApiKeyMetadata {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            description: record.description.clone(),
            key_prefix: record.key_prefix.clone(),
            key_suffix: record.key_suffix.clone(),
            permissions: record.permissions.clone(),
            rate_limit: record.rate_limit,
            status: record.status,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            usage_count: record.usage_count,
        }
    }
}

/// Result of key creation: the one and only time the raw key is visible.
#[derive(Debug, Serialize)]
pub struct CreatedKey {
    pub key: String,
    #[serde(flatten)]
    pub metadata: ApiKeyMetadata,
}

/// Partial update for a key record.
#[derive(Debug, Default, Deserialize)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<Permission>>,
    pub rate_limit: Option<RateLimitConfig>,
    pub status: Option<KeyStatus>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeysFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    keys: HashMap<Uuid, ApiKeyRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyStatTotals {
    total_requests: u64,
    total_errors: u64,
    total_response_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyUsageFile {
    /// date → key id → request count
    #[serde(default)]
    daily: HashMap<String, HashMap<Uuid, u64>>,
    #[serde(default, rename = "keyStats")]
    key_stats: HashMap<Uuid, KeyStatTotals>,
}

/// Store for local API keys plus their usage statistics.
pub struct ApiKeyStore {
    keys: RwLock<HashMap<Uuid, ApiKeyRecord>>,
    usage: RwLock<KeyUsageFile>,
    /// SHA-256(raw key) → key id for keys that already passed PBKDF2 once.
    /// Avoids re-deriving 260k iterations on every request.
    verified_cache: RwLock<HashMap<String, Uuid>>,
    storage_path: PathBuf,
    usage_path: PathBuf,
    usage_dirty: std::sync::atomic::AtomicBool,
}

impl ApiKeyStore {
    pub async fn new(storage_path: PathBuf, usage_path: PathBuf) -> Self {
        let store = Self {
            keys: RwLock::new(HashMap::new()),
            usage: RwLock::new(KeyUsageFile::default()),
            verified_cache: RwLock::new(HashMap::new()),
            storage_path,
            usage_path,
            usage_dirty: std::sync::atomic::AtomicBool::new(false),
        };
        if let Ok(loaded) = store.load_keys() {
            *store.keys.write().await = loaded;
        }
        if let Ok(loaded) = store.load_usage() {
            *store.usage.write().await = loaded;
        }
        store
    }

    fn load_keys(&self) -> Result<HashMap<Uuid, ApiKeyRecord>, std::io::Error> {
        if !self.storage_path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.storage_path)?;
        let file: KeysFile = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(file.keys)
    }

    fn load_usage(&self) -> Result<KeyUsageFile, std::io::Error> {
        if !self.usage_path.exists() {
            return Ok(KeyUsageFile::default());
        }
        let contents = std::fs::read_to_string(&self.usage_path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn save_keys(&self, keys: &HashMap<Uuid, ApiKeyRecord>) -> Result<(), std::io::Error> {
        let file = KeysFile {
            version: 1,
            keys: keys.clone(),
        };
        atomic_write_json(&self.storage_path, &file)
    }

    /// Create a key. The returned raw value is never derivable again.
    pub async fn create(
        &self,
        name: String,
        description: Option<String>,
        permissions: Vec<Permission>,
        rate_limit: Option<RateLimitConfig>,
    ) -> Result<CreatedKey, std::io::Error> {
        let raw_key = generate_raw_key();
        self.insert_record(name, description, permissions, rate_limit, &raw_key)
            .await
    }

    async fn insert_record(
        &self,
        name: String,
        description: Option<String>,
        permissions: Vec<Permission>,
        rate_limit: Option<RateLimitConfig>,
        raw_key: &str,
    ) -> Result<CreatedKey, std::io::Error> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let raw = raw_key.to_string();
        let hash = {
            let raw = raw.clone();
            tokio::task::spawn_blocking(move || derive_key(&raw, &salt, PBKDF2_ITERATIONS))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?
        };

        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            name,
            description,
            key_hash: hex::encode(hash),
            salt: hex::encode(salt),
            iterations: PBKDF2_ITERATIONS,
            key_prefix: raw_key.chars().take(12).collect(),
            key_suffix: raw_key.chars().rev().take(4).collect::<String>().chars().rev().collect(),
            permissions,
            rate_limit,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
        };
        let metadata = ApiKeyMetadata::from(&record);

        let mut keys = self.keys.write().await;
        keys.insert(record.id, record);
        self.save_keys(&keys)?;
        drop(keys);

        Ok(CreatedKey {
            key: raw_key.to_string(),
            metadata,
        })
    }

    /// Import bootstrap keys from the environment. Keys that already validate
    /// are left alone; new ones get full access.
    pub async fn import_bootstrap(&self, raw_keys: &[String]) {
        for (idx, raw) in raw_keys.iter().enumerate() {
            if self.validate(raw).await.is_some() {
                continue;
            }
            match self
                .insert_record(
                    format!("bootstrap-{}", idx + 1),
                    Some("imported from API_KEY".to_string()),
                    vec![Permission::FullAccess],
                    None,
                    raw,
                )
                .await
            {
                Ok(created) => {
                    tracing::info!(key_id = %created.metadata.id, "Imported bootstrap API key")
                }
                Err(e) => tracing::error!(error = %e, "Failed to import bootstrap API key"),
            }
        }
    }

    /// List metadata for all keys. Never exposes hashes or raw values.
    pub async fn list(&self) -> Vec<ApiKeyMetadata> {
        let keys = self.keys.read().await;
        let mut list: Vec<ApiKeyMetadata> = keys.values().map(ApiKeyMetadata::from).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn get(&self, id: Uuid) -> Option<ApiKeyMetadata> {
        let keys = self.keys.read().await;
        keys.get(&id).map(ApiKeyMetadata::from)
    }

    /// Apply a partial update. Returns the new metadata, or None for an
    /// unknown id.
    pub async fn update(&self, id: Uuid, update: KeyUpdate) -> Result<Option<ApiKeyMetadata>, std::io::Error> {
        let mut keys = self.keys.write().await;
        let Some(record) = keys.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(description) = update.description {
            record.description = Some(description);
        }
        if let Some(permissions) = update.permissions {
            record.permissions = permissions;
        }
        if let Some(rate_limit) = update.rate_limit {
            record.rate_limit = Some(rate_limit);
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        let metadata = ApiKeyMetadata::from(&*record);
        self.save_keys(&keys)?;
        drop(keys);

        // Status or permission changes must take effect immediately.
        self.verified_cache.write().await.retain(|_, v| *v != id);
        Ok(Some(metadata))
    }

    /// Delete a key and its usage statistics.
    pub async fn delete(&self, id: Uuid) -> Result<bool, std::io::Error> {
        let mut keys = self.keys.write().await;
        if keys.remove(&id).is_none() {
            return Ok(false);
        }
        self.save_keys(&keys)?;
        drop(keys);

        self.verified_cache.write().await.retain(|_, v| *v != id);
        let mut usage = self.usage.write().await;
        usage.key_stats.remove(&id);
        for day in usage.daily.values_mut() {
            day.remove(&id);
        }
        self.usage_dirty
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(true)
    }

    /// Verify a raw key against the stored hashes.
    ///
    /// Scans every active key and keeps scanning after a match so timing does
    /// not reveal which entry matched. PBKDF2 runs on the blocking pool.
    pub async fn validate(&self, raw_key: &str) -> Option<ApiKeyMetadata> {
        if !raw_key.starts_with(KEY_PREFIX)
            || raw_key.len() < KEY_PREFIX.len() + KEY_RANDOM_HEX_LEN
        {
            return None;
        }

        let lookup = hex_sha256(raw_key);
        if let Some(id) = self.verified_cache.read().await.get(&lookup).copied() {
            let keys = self.keys.read().await;
            let record = keys.get(&id)?;
            if record.status == KeyStatus::Active {
                return Some(ApiKeyMetadata::from(record));
            }
            return None;
        }

        let candidates: Vec<(Uuid, Vec<u8>, u32, Vec<u8>)> = {
            let keys = self.keys.read().await;
            keys.values()
                .filter(|r| r.status == KeyStatus::Active)
                .filter_map(|r| {
                    Some((
                        r.id,
                        hex::decode(&r.salt).ok()?,
                        r.iterations,
                        hex::decode(&r.key_hash).ok()?,
                    ))
                })
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }

        let raw = raw_key.to_string();
        let matched: Option<Uuid> = tokio::task::spawn_blocking(move || {
            let mut matched = None;
            for (id, salt, iterations, expected) in &candidates {
                let derived = derive_key(&raw, salt, *iterations);
                if constant_time_eq(&derived, expected) {
                    matched = Some(*id);
                }
            }
            matched
        })
        .await
        .ok()
        .flatten();

        let id = matched?;
        self.verified_cache.write().await.insert(lookup, id);
        let keys = self.keys.read().await;
        keys.get(&id).map(ApiKeyMetadata::from)
    }

    /// Record a finished request for a key: bumps usage counters and the
    /// response-time/error statistics. Persisted by the next usage flush.
    pub async fn record_completion(&self, id: Uuid, response_ms: u64, is_error: bool) {
        {
            let mut keys = self.keys.write().await;
            if let Some(record) = keys.get_mut(&id) {
                record.last_used_at = Some(Utc::now());
                record.usage_count += 1;
            }
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut usage = self.usage.write().await;
        *usage.daily.entry(today).or_default().entry(id).or_insert(0) += 1;
        let totals = usage.key_stats.entry(id).or_default();
        totals.total_requests += 1;
        totals.total_response_ms += response_ms;
        if is_error {
            totals.total_errors += 1;
        }
        drop(usage);
        self.usage_dirty
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Flush usage statistics and key metadata if anything changed since the
    /// last flush. Called from the stats collector tick and at shutdown.
    pub async fn flush_usage(&self) {
        if !self
            .usage_dirty
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let usage = self.usage.read().await;
        if let Err(e) = atomic_write_json(&self.usage_path, &*usage) {
            tracing::error!(error = %e, "Failed to persist key usage stats");
        }
        drop(usage);
        let keys = self.keys.read().await;
        if let Err(e) = self.save_keys(&keys) {
            tracing::error!(error = %e, "Failed to persist key metadata");
        }
    }
}

fn generate_raw_key() -> String {
    let mut bytes = [0u8; KEY_RANDOM_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", KEY_PREFIX, hex::encode(bytes))
}

fn derive_key(raw: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; DERIVED_KEY_LEN];
    // Only fails on zero-length output, which DERIVED_KEY_LEN rules out.
    let _ = pbkdf2::pbkdf2::<Hmac<Sha256>>(raw.as_bytes(), salt, iterations, &mut out);
    out
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

fn atomic_write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
