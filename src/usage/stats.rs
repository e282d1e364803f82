//! Stats collector: periodic daily snapshots plus an optional per-request
//! append-only log, both under `<data_dir>/stats/`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::keys::ApiKeyStore;

use super::UsageCounters;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// One line of the per-request JSONL log.
#[derive(Debug, Serialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub account_id: Option<String>,
    pub endpoint: String,
    pub status: u16,
    pub response_ms: u64,
}

/// Writes `stats/daily-YYYY-MM-DD.json` every 30 seconds and, when enabled,
/// appends one JSONL record per finished request.
pub struct StatsCollector {
    counters: Arc<UsageCounters>,
    api_keys: Arc<ApiKeyStore>,
    stats_dir: PathBuf,
    request_log_enabled: bool,
    append_lock: Mutex<()>,
}

impl StatsCollector {
    pub fn new(
        counters: Arc<UsageCounters>,
        api_keys: Arc<ApiKeyStore>,
        stats_dir: PathBuf,
        request_log_enabled: bool,
    ) -> Self {
        Self {
            counters,
            api_keys,
            stats_dir,
            request_log_enabled,
            append_lock: Mutex::new(()),
        }
    }

    /// Spawn the snapshot loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        let collector = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        collector.write_snapshot().await;
                        collector.api_keys.flush_usage().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Write today's per-account snapshot.
    pub async fn write_snapshot(&self) {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let accounts = self.counters.snapshot_today().await;
        let totals = self.counters.totals_today().await;
        let snapshot = serde_json::json!({
            "date": date,
            "written_at": Utc::now(),
            "accounts": accounts,
            "totals": totals,
        });

        let path = self.stats_dir.join(format!("daily-{}.json", date));
        if let Err(e) = write_atomic(&path, &snapshot) {
            tracing::error!(path = %path.display(), error = %e, "Failed to write daily stats snapshot");
        }
    }

    /// Append one request record to today's JSONL file (no-op when disabled).
    pub async fn log_request(&self, entry: RequestLogEntry) {
        if !self.request_log_enabled {
            return;
        }
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.stats_dir.join(format!("requests-{}.jsonl", date));
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize request log entry");
                return;
            }
        };

        let _guard = self.append_lock.lock().await;
        let result = (|| -> Result<(), std::io::Error> {
            std::fs::create_dir_all(&self.stats_dir)?;
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{}", line)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "Failed to append request log entry");
        }
    }
}

fn write_atomic(path: &PathBuf, value: &serde_json::Value) -> Result<(), std::io::Error> {
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
