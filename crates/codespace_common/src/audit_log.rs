//! Rollback audit log
//!
//! Append-only JSON lines recording every finished rollback execution and every
//! rejected manual invocation. Entries older than the retention window are
//! pruned on append; the live file is rotated into `archive/` past a size cap.

use crate::types::{RollbackExecution, TriggerKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Maximum log size before rotation (10 MB)
pub const MAX_ROLLBACK_LOG_SIZE: u64 = 10_485_760;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    /// A rollback execution reached a terminal state
    Execution,
    /// A manual trigger was rejected before any procedure ran
    ManualRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: AuditEntryType,
    pub trigger: TriggerKind,
    pub result: AuditResult,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<RollbackExecution>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// User from the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl AuditEntry {
    pub fn for_execution(execution: &RollbackExecution, at: DateTime<Utc>) -> Self {
        let result = if execution.any_failed() || execution.is_aborted() {
            AuditResult::Failure
        } else {
            AuditResult::Success
        };
        Self {
            timestamp: at,
            entry_type: AuditEntryType::Execution,
            trigger: execution.trigger_kind,
            result,
            execution: Some(execution.clone()),
            details: None,
            user: std::env::var("USER").ok(),
        }
    }

    pub fn manual_rejected(role: Option<&str>, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at,
            entry_type: AuditEntryType::ManualRejected,
            trigger: TriggerKind::Manual,
            result: AuditResult::Blocked,
            execution: None,
            details: Some(serde_json::json!({
                "role": role,
                "reason": reason,
            })),
            user: std::env::var("USER").ok(),
        }
    }
}

/// File-backed rollback log
#[derive(Debug, Clone)]
pub struct RollbackLog {
    path: PathBuf,
    retention_days: u32,
}

impl RollbackLog {
    pub fn new(path: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            path: path.into(),
            retention_days,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.join("archive"))
            .unwrap_or_else(|| PathBuf::from("archive"))
    }

    /// Append an entry, pruning expired entries first
    pub fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.rotate_if_needed(entry.timestamp)?;
        self.prune(entry.timestamp)?;

        let json = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{}", json)?;
        file.sync_all()?;

        Ok(())
    }

    /// Drop entries older than the retention window. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> std::io::Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let content = fs::read_to_string(&self.path)?;
        let mut kept = Vec::new();
        let mut removed = 0;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) if entry.timestamp < cutoff => removed += 1,
                Ok(_) => kept.push(line),
                Err(e) => {
                    // Unparseable lines are kept so nothing is silently lost
                    warn!("Keeping unparseable rollback log line: {}", e);
                    kept.push(line);
                }
            }
        }

        if removed > 0 {
            let temp_path = self.path.with_extension("jsonl.tmp");
            let mut body = kept.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            fs::write(&temp_path, body)?;
            fs::rename(&temp_path, &self.path)?;
            debug!("Pruned {} expired rollback log entries", removed);
        }

        Ok(removed)
    }

    fn rotate_if_needed(&self, now: DateTime<Utc>) -> std::io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.path)?;
        if metadata.len() < MAX_ROLLBACK_LOG_SIZE {
            return Ok(());
        }

        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)?;
        let archive_path =
            archive_dir.join(format!("rollback_{}.jsonl", now.format("%Y%m%d_%H%M%S")));
        fs::rename(&self.path, archive_path)?;

        Ok(())
    }

    /// Most recent entries, newest last
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let entries: Vec<AuditEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcedureOutcome, ProcedureRecord, RollbackDomain};
    use tempfile::TempDir;

    fn execution(at: DateTime<Utc>, ok: bool) -> RollbackExecution {
        let mut exec = RollbackExecution::new(TriggerKind::HealthCheckFailure, at);
        exec.record(ProcedureRecord {
            domain: RollbackDomain::Database,
            outcome: if ok {
                ProcedureOutcome::Success { retries: 0 }
            } else {
                ProcedureOutcome::Failure {
                    retries: 1,
                    error: "verify failed".to_string(),
                }
            },
            verification: None,
            backup: None,
            started_at: at,
            finished_at: at,
        });
        exec.finish(at);
        exec
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("rollback.jsonl"), 30);
        let now = Utc::now();

        log.append(&AuditEntry::for_execution(&execution(now, true), now))
            .unwrap();
        log.append(&AuditEntry::manual_rejected(Some("guest"), "role not allowed", now))
            .unwrap();

        let entries = log.recent(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].result, AuditResult::Success);
        assert_eq!(entries[1].entry_type, AuditEntryType::ManualRejected);
        assert_eq!(entries[1].result, AuditResult::Blocked);
    }

    #[test]
    fn test_failed_execution_is_failure() {
        let now = Utc::now();
        let entry = AuditEntry::for_execution(&execution(now, false), now);
        assert_eq!(entry.result, AuditResult::Failure);
    }

    #[test]
    fn test_retention_prunes_old_entries() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("rollback.jsonl"), 7);
        let now = Utc::now();
        let old = now - Duration::days(10);

        log.append(&AuditEntry::for_execution(&execution(old, true), old))
            .unwrap();
        log.append(&AuditEntry::for_execution(&execution(now, true), now))
            .unwrap();

        let entries = log.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, now);
    }

    #[test]
    fn test_recent_limit_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("rollback.jsonl"), 30);
        let now = Utc::now();
        for i in 0..5 {
            let at = now + Duration::seconds(i);
            log.append(&AuditEntry::for_execution(&execution(at, true), at))
                .unwrap();
        }

        let entries = log.recent(2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timestamp, now + Duration::seconds(4));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("nope.jsonl"), 30);
        assert!(log.recent(5).is_empty());
        assert_eq!(log.prune(Utc::now()).unwrap(), 0);
    }
}
