//! Append-only audit log.
//!
//! One JSON record per line, recording key creation/deletion, account
//! creation/removal, and refresh outcomes. When the file grows past the
//! configured cap, the oldest half is dropped (whole lines only) so the tail
//! of history is always intact.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    timestamp: DateTime<Utc>,
    actor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<IpAddr>,
    action: &'a str,
    subject: &'a str,
}

/// Size-capped JSONL audit log. Appends are serialized through a mutex so
/// concurrent records never interleave.
pub struct AuditLog {
    path: PathBuf,
    limit: u64,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf, limit: u64) -> Self {
        Self {
            path,
            limit,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one record. Failures are logged, never propagated; auditing
    /// must not take down the request path.
    pub async fn record(&self, actor: &str, ip: Option<IpAddr>, action: &str, subject: &str) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            actor,
            ip,
            action,
            subject,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit record");
                return;
            }
        };

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.append_line(&line) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to append audit record");
        }
    }

    fn append_line(&self, line: &str) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.enforce_limit()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Drop the oldest half of the file once it exceeds the cap.
    fn enforce_limit(&self) -> Result<(), std::io::Error> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if len <= self.limit {
            return Ok(());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let keep_from = contents.len() / 2;
        // Advance to the next line boundary so we never keep a torn record.
        let start = contents[keep_from..]
            .find('\n')
            .map(|i| keep_from + i + 1)
            .unwrap_or(contents.len());
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &contents[start..])?;
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::info!(
            path = %self.path.display(),
            dropped_bytes = start,
            "Audit log truncated to enforce size cap"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"), 1024 * 1024);
        log.record("admin", None, "key.create", "key-1").await;
        log.record("admin", Some("127.0.0.1".parse().unwrap()), "key.delete", "key-1")
            .await;

        let contents = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "key.create");
        assert_eq!(first["subject"], "key-1");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["ip"], "127.0.0.1");
    }

    #[tokio::test]
    async fn oversized_log_keeps_newest_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"), 512);
        for i in 0..50 {
            log.record("admin", None, "refresh.ok", &format!("acct-{}", i))
                .await;
        }
        let contents = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        // Every surviving line still parses and the most recent record is kept.
        for line in contents.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["action"], "refresh.ok");
        }
        assert!(contents.contains("acct-49"));
        assert!(!contents.contains("\"acct-0\""));
    }
}
