//! One-file-per-account credential persistence.
//!
//! Accounts live under the data directory as `oauth_creds_<account_id>.json`;
//! the legacy single-account layout uses a bare `oauth_creds.json`, which maps
//! to the account id `default`. All writes go through write-temp + rename so a
//! crash never leaves a torn file behind.

use std::path::{Path, PathBuf};

use super::{OauthCredentials, DEFAULT_ACCOUNT_ID};

const FILE_PREFIX: &str = "oauth_creds_";
const DEFAULT_FILE: &str = "oauth_creds.json";

/// Credential file storage rooted at the data directory.
#[derive(Debug, Clone)]
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, account_id: &str) -> PathBuf {
        if account_id == DEFAULT_ACCOUNT_ID {
            self.dir.join(DEFAULT_FILE)
        } else {
            self.dir.join(format!("{}{}.json", FILE_PREFIX, account_id))
        }
    }

    fn account_id_for(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        if name == DEFAULT_FILE {
            return Some(DEFAULT_ACCOUNT_ID.to_string());
        }
        let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".json")?;
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    /// Scan the data directory and hydrate every readable credential file.
    ///
    /// A single unreadable or malformed file is skipped with a warning; the
    /// rest of the pool stays usable.
    pub fn load_all(&self) -> Vec<(String, OauthCredentials)> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to scan account storage");
                return Vec::new();
            }
        };

        let mut accounts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(account_id) = Self::account_id_for(&path) else {
                continue;
            };
            match self.load_file(&path) {
                Ok(creds) => accounts.push((account_id, creds)),
                Err(e) => {
                    tracing::warn!(
                        account_id = %account_id,
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable account credential file"
                    );
                }
            }
        }
        accounts
    }

    fn load_file(&self, path: &Path) -> Result<OauthCredentials, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Persist credentials atomically (write to temp file, then rename).
    pub fn save(&self, account_id: &str, creds: &OauthCredentials) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_for(account_id);
        let contents = serde_json::to_string_pretty(creds)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Delete the credential file. Returns false when it did not exist.
    pub fn remove(&self, account_id: &str) -> Result<bool, std::io::Error> {
        let path = self.file_for(account_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
