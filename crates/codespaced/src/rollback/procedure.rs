//! Per-domain rollback procedure: backup, mutate, verify
//!
//! A backup failure ends the procedure before anything is mutated. Mutation
//! and verification are attempted up to `max_retries` times with exponential
//! backoff between attempts.

use crate::clock::{Clock, Sleeper};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use codespace_common::config::ProcedureConfig;
use codespace_common::{ProcedureOutcome, ProcedureRecord, RollbackDomain, VerificationResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Domain-specific rollback steps
#[async_trait]
pub trait DomainRollback: Send + Sync {
    fn domain(&self) -> RollbackDomain;

    /// Save the current state; returns where it was written
    async fn backup(&self) -> Result<String>;

    /// Restore the known-good state
    async fn rollback(&self) -> Result<()>;

    async fn verify(&self) -> Result<()>;
}

/// Delay before retry number `retry` (1-based): doubles from `base_ms`, capped
pub fn backoff_delay(base_ms: u64, max_ms: u64, retry: u32) -> Duration {
    let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

pub struct ProcedureRunner<'a> {
    pub clock: &'a dyn Clock,
    pub sleeper: &'a dyn Sleeper,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ProcedureRunner<'_> {
    pub async fn run(&self, handler: &dyn DomainRollback, config: &ProcedureConfig) -> ProcedureRecord {
        let domain = handler.domain();
        let started_at = self.clock.now();
        info!(domain = %domain, "Running rollback procedure");

        let mut record = ProcedureRecord {
            domain,
            outcome: ProcedureOutcome::Success { retries: 0 },
            verification: None,
            backup: None,
            started_at,
            finished_at: started_at,
        };

        if config.backup_before_rollback {
            match handler.backup().await {
                Ok(location) => {
                    info!(domain = %domain, "Backup written to {}", location);
                    record.backup = Some(location);
                }
                Err(e) => {
                    warn!(domain = %domain, "Backup failed, skipping rollback: {:#}", e);
                    record.outcome = ProcedureOutcome::Failure {
                        retries: 0,
                        error: format!("backup failed: {:#}", e),
                    };
                    record.finished_at = self.clock.now();
                    return record;
                }
            }
        }

        let attempts = config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.retry_backoff_ms, self.max_backoff_ms, attempt);
                warn!(domain = %domain, "Retry {}/{} in {:?}: {}", attempt, attempts - 1, delay, last_error);
                self.sleeper.sleep(delay).await;
            }

            if let Err(e) = handler.rollback().await {
                last_error = format!("rollback failed: {:#}", e);
                continue;
            }

            if !config.verify_after_rollback {
                record.outcome = ProcedureOutcome::Success { retries: attempt };
                record.finished_at = self.clock.now();
                return record;
            }

            match handler.verify().await {
                Ok(()) => {
                    record.verification = Some(VerificationResult::Passed);
                    record.outcome = ProcedureOutcome::Success { retries: attempt };
                    record.finished_at = self.clock.now();
                    info!(domain = %domain, "Rollback verified");
                    return record;
                }
                Err(e) => {
                    last_error = format!("verification failed: {:#}", e);
                    record.verification = Some(VerificationResult::Failed {
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        warn!(domain = %domain, "Procedure failed after {} attempts: {}", attempts, last_error);
        record.outcome = ProcedureOutcome::Failure {
            retries: attempts - 1,
            error: last_error,
        };
        record.finished_at = self.clock.now();
        record
    }
}

// ============================================================================
// Fake domain for tests
// ============================================================================

/// Scriptable domain recording `<domain>.<step>` calls into a shared log
pub struct FakeDomainRollback {
    domain: RollbackDomain,
    calls: crate::resources::CallLog,
    failures: Mutex<HashMap<&'static str, VecDeque<String>>>,
    always_fail: Mutex<HashMap<&'static str, String>>,
}

impl FakeDomainRollback {
    pub fn new(domain: RollbackDomain, calls: crate::resources::CallLog) -> Self {
        Self {
            domain,
            calls,
            failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next call to `step` (`backup`, `rollback` or `verify`)
    pub fn fail_once(&self, step: &'static str, message: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(step)
            .or_default()
            .push_back(message.to_string());
    }

    /// Fail every call to `step`
    pub fn fail_always(&self, step: &'static str, message: &str) {
        self.always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(step, message.to_string());
    }

    fn step(&self, step: &'static str) -> Result<()> {
        self.calls.record(format!("{}.{}", self.domain, step));

        let once = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(step)
            .and_then(VecDeque::pop_front);
        if let Some(message) = once {
            return Err(anyhow!(message));
        }
        if let Some(message) = self
            .always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(step)
        {
            return Err(anyhow!(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DomainRollback for FakeDomainRollback {
    fn domain(&self) -> RollbackDomain {
        self.domain
    }

    async fn backup(&self) -> Result<String> {
        self.step("backup")?;
        Ok(format!("/tmp/fake-backup/{}", self.domain))
    }

    async fn rollback(&self) -> Result<()> {
        self.step("rollback")
    }

    async fn verify(&self) -> Result<()> {
        self.step("verify")
    }
}
