//! Core data types shared by the daemon and the control CLI

use crate::error::{CodespaceError, CodespaceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Environment lifecycle
// ============================================================================

/// Lifecycle state of one Codespace environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Absent,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Cleaning,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Cleaning => "cleaning",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-entering a transitional state (including `cleaning`) is allowed so an
    /// operation that failed half-way can be retried.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, next) {
            (Cleaning, Absent | Cleaning) => true,
            (Cleaning, _) => false,
            (_, Cleaning) => true,
            (Absent | Stopped | Starting | Running | Degraded | Stopping, Starting) => true,
            (Starting, Running) => true,
            (Running, Degraded) | (Degraded, Running) => true,
            (Running | Degraded | Starting | Stopping | Stopped | Absent, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned Codespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub lifecycle_state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Resource identifiers owned by this environment (e.g. `docker`, `docker:mysql`)
    pub service_refs: BTreeSet<String>,
}

impl Environment {
    /// Longest accepted environment name
    pub const MAX_NAME_LEN: usize = 63;

    /// Names key on-disk records and derived resource names, so only
    /// `[A-Za-z0-9_-]` is accepted.
    pub fn validate_name(name: &str) -> CodespaceResult<()> {
        let valid = !name.is_empty()
            && name.len() <= Self::MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(CodespaceError::InvalidEnvironment(name.to_string()))
        }
    }

    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            lifecycle_state: LifecycleState::Absent,
            created_at: now,
            last_health_check: None,
            service_refs: BTreeSet::new(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: LifecycleState) -> CodespaceResult<()> {
        if !self.lifecycle_state.can_transition_to(next) {
            return Err(CodespaceError::InvalidTransition {
                environment: self.name.clone(),
                from: self.lifecycle_state,
                to: next,
            });
        }
        self.lifecycle_state = next;
        Ok(())
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Resource class handled by one resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Docker,
    Network,
    Volume,
}

impl ResourceKind {
    /// Order used by `status` and by teardown: dependents first.
    pub const TEARDOWN_ORDER: [ResourceKind; 3] =
        [ResourceKind::Docker, ResourceKind::Network, ResourceKind::Volume];

    /// Order used when bringing infrastructure up: dependencies first.
    pub const STARTUP_ORDER: [ResourceKind; 3] =
        [ResourceKind::Volume, ResourceKind::Network, ResourceKind::Docker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Network => "network",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CodespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "network" => Ok(Self::Network),
            "volume" | "volumes" => Ok(Self::Volume),
            _ => Err(CodespaceError::InvalidService(s.to_string())),
        }
    }
}

/// Status line reported by one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component: String,
    pub status: String,
    pub details: String,
}

impl ComponentStatus {
    pub fn new(component: &str, status: &str, details: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            status: status.to_string(),
            details: details.into(),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health snapshot of one service at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub details: String,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
}

impl HealthRecord {
    pub fn healthy(service: &str, at: DateTime<Utc>, details: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            healthy: true,
            last_check: at,
            details: details.into(),
            response_time_ms: None,
        }
    }

    pub fn unhealthy(service: &str, at: DateTime<Utc>, details: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            healthy: false,
            last_check: at,
            details: details.into(),
            response_time_ms: None,
        }
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Rollback
// ============================================================================

/// Kind of condition that can start a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    HealthCheckFailure,
    ErrorRateThreshold,
    ResponseTimeThreshold,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheckFailure => "health_check_failure",
            Self::ErrorRateThreshold => "error_rate_threshold",
            Self::ResponseTimeThreshold => "response_time_threshold",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = CodespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "health_check_failure" => Ok(Self::HealthCheckFailure),
            "error_rate_threshold" => Ok(Self::ErrorRateThreshold),
            "response_time_threshold" => Ok(Self::ResponseTimeThreshold),
            "manual" => Ok(Self::Manual),
            other => Err(CodespaceError::InvalidConfig(format!(
                "unknown trigger kind '{}'",
                other
            ))),
        }
    }
}

/// Rollback domain. Declaration order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackDomain {
    Database,
    Files,
    Configuration,
    Dependencies,
}

impl RollbackDomain {
    pub const EXECUTION_ORDER: [RollbackDomain; 4] = [
        RollbackDomain::Database,
        RollbackDomain::Files,
        RollbackDomain::Configuration,
        RollbackDomain::Dependencies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Files => "files",
            Self::Configuration => "configuration",
            Self::Dependencies => "dependencies",
        }
    }
}

impl fmt::Display for RollbackDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the verification step of a procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationResult {
    Passed,
    Failed { error: String },
}

/// Final outcome of one procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcedureOutcome {
    Success { retries: u32 },
    Failure { retries: u32, error: String },
}

impl ProcedureOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn retries(&self) -> u32 {
        match self {
            Self::Success { retries } | Self::Failure { retries, .. } => *retries,
        }
    }
}

impl fmt::Display for ProcedureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { retries: 0 } => write!(f, "success"),
            Self::Success { retries } => write!(f, "success (retried {} times)", retries),
            Self::Failure { retries, error } => {
                write!(f, "failure after {} retries: {}", retries, error)
            }
        }
    }
}

/// Record of one procedure inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub domain: RollbackDomain,
    pub outcome: ProcedureOutcome,
    /// Present iff verification was configured for this procedure
    pub verification: Option<VerificationResult>,
    pub backup: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Execution state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Triggered,
    RunningProcedures,
    Verifying,
    Notifying,
    Complete,
    Aborted,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

/// One run of rollback procedures started by one fired trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackExecution {
    pub id: String,
    pub trigger_kind: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub procedures_run: Vec<ProcedureRecord>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notified: bool,
    pub state: ExecutionState,
    pub abort_reason: Option<String>,
}

impl RollbackExecution {
    pub fn new(trigger_kind: TriggerKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_kind,
            started_at,
            procedures_run: Vec::new(),
            finished_at: None,
            notified: false,
            state: ExecutionState::Triggered,
            abort_reason: None,
        }
    }

    pub fn record(&mut self, record: ProcedureRecord) {
        self.procedures_run.push(record);
    }

    pub fn any_failed(&self) -> bool {
        self.procedures_run.iter().any(|p| !p.outcome.is_success())
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// `critical` iff a procedure failed or the execution aborted
    pub fn alert_severity(&self) -> Severity {
        if self.any_failed() || self.is_aborted() {
            Severity::Critical
        } else {
            Severity::Info
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.abort_reason = Some(reason.into());
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
        self.state = if self.is_aborted() {
            ExecutionState::Aborted
        } else {
            ExecutionState::Complete
        };
    }

    pub fn status_str(&self) -> &'static str {
        if self.is_aborted() {
            "aborted"
        } else if self.any_failed() {
            "failed"
        } else {
            "succeeded"
        }
    }

    /// One line per procedure, e.g. `database: success`
    pub fn procedure_summary(&self) -> String {
        if self.procedures_run.is_empty() {
            return "no procedures run".to_string();
        }
        self.procedures_run
            .iter()
            .map(|p| format!("{}: {}", p.domain, p.outcome))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
