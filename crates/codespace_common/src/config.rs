//! Codespace configuration
//!
//! Loaded once into an immutable snapshot. Reloading builds a new snapshot;
//! nothing mutates a loaded config in place.
//!
//! Lookup order:
//! 1. Explicit path (`--config`)
//! 2. `$CODESPACE_CONFIG`
//! 3. `~/.config/codespace/config.toml`
//! 4. `/etc/codespace/config.toml`
//! 5. Defaults

use crate::error::{CodespaceError, CodespaceResult};
use crate::types::{Environment, RollbackDomain, Severity, TriggerKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// System config file path
pub const SYSTEM_CONFIG_PATH: &str = "/etc/codespace/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV_VAR: &str = "CODESPACE_CONFIG";

// ============================================================================
// Infrastructure
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureConfig {
    /// Environment targeted when the caller does not name one
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Container CLI binary
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Compose file describing the Codespace containers
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Compose project name (prefix of every container)
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Bridge network shared by the containers
    #[serde(default = "default_network_name")]
    pub network_name: String,

    /// Named volumes owned by the Codespace
    #[serde(default = "default_volumes")]
    pub volumes: Vec<String>,

    /// Timeout for a single resource manager call
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Environment records and lock files, shared by the daemon and the CLI
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_project_name() -> String {
    "codespace".to_string()
}

fn default_network_name() -> String {
    "codespace_network".to_string()
}

fn default_volumes() -> Vec<String> {
    vec!["codespace_database".to_string(), "codespace_storage".to_string()]
}

fn default_command_timeout() -> u64 {
    120
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/codespace/environments")
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            docker_binary: default_docker_binary(),
            compose_file: default_compose_file(),
            project_name: default_project_name(),
            network_name: default_network_name(),
            volumes: default_volumes(),
            command_timeout_secs: default_command_timeout(),
            state_dir: default_state_dir(),
        }
    }
}

impl InfrastructureConfig {
    /// Resource names owned by `environment`.
    ///
    /// The configured environment keeps the names as written; any other
    /// environment gets its own compose project, network and volumes so that
    /// operating on one never touches another.
    pub fn for_environment(&self, environment: &str) -> Self {
        let mut scoped = self.clone();
        if environment == self.environment {
            return scoped;
        }
        scoped.environment = environment.to_string();
        scoped.project_name = format!("{}-{}", self.project_name, environment);
        scoped.network_name = format!("{}_{}", self.network_name, environment);
        scoped.volumes = self
            .volumes
            .iter()
            .map(|volume| format!("{}_{}", volume, environment))
            .collect();
        scoped
    }
}

// ============================================================================
// Health checks
// ============================================================================

/// How a service is probed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// TCP connect to `host:port`
    Tcp { address: String },
    /// HTTP GET; healthy on `expect_status`, or any 2xx when unset
    Http {
        url: String,
        #[serde(default)]
        expect_status: Option<u16>,
    },
    /// Command exiting with status 0
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub probe: ProbeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecksConfig {
    /// Poll interval in seconds
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub services: Vec<ServiceCheckConfig>,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthChecksConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            services: Vec::new(),
        }
    }
}

// ============================================================================
// Rollback triggers
// ============================================================================

/// Threshold trigger (health, error-rate, response-time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures (health) or metric ceiling (error rate %, response time ms)
    pub threshold: f64,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_window_seconds() -> u64 {
    300
}

/// Longest accepted trigger window (30 days)
pub const MAX_WINDOW_SECONDS: u64 = 30 * 24 * 3600;

impl TriggerConfig {
    /// Sliding window length, clamped to [`MAX_WINDOW_SECONDS`]
    pub fn window(&self) -> chrono::Duration {
        let seconds = self.window_seconds.min(MAX_WINDOW_SECONDS);
        chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualTriggerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub require_confirmation: bool,

    #[serde(default = "default_allowed_roles")]
    pub allowed_roles: Vec<String>,
}

fn default_allowed_roles() -> Vec<String> {
    vec!["admin".to_string(), "devops".to_string()]
}

impl Default for ManualTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_confirmation: true,
            allowed_roles: default_allowed_roles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default = "default_health_trigger")]
    pub health_check_failure: TriggerConfig,

    #[serde(default = "default_error_rate_trigger")]
    pub error_rate_threshold: TriggerConfig,

    #[serde(default = "default_response_time_trigger")]
    pub response_time_threshold: TriggerConfig,

    #[serde(default)]
    pub manual: ManualTriggerConfig,
}

fn default_health_trigger() -> TriggerConfig {
    TriggerConfig {
        enabled: true,
        threshold: 3.0,
        window_seconds: 300,
    }
}

fn default_error_rate_trigger() -> TriggerConfig {
    TriggerConfig {
        enabled: true,
        threshold: 5.0,
        window_seconds: 300,
    }
}

fn default_response_time_trigger() -> TriggerConfig {
    TriggerConfig {
        enabled: true,
        threshold: 2000.0,
        window_seconds: 300,
    }
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            health_check_failure: default_health_trigger(),
            error_rate_threshold: default_error_rate_trigger(),
            response_time_threshold: default_response_time_trigger(),
            manual: ManualTriggerConfig::default(),
        }
    }
}

impl TriggersConfig {
    /// Threshold trigger for `kind`; `None` for the manual trigger
    pub fn threshold_trigger(&self, kind: TriggerKind) -> Option<&TriggerConfig> {
        match kind {
            TriggerKind::HealthCheckFailure => Some(&self.health_check_failure),
            TriggerKind::ErrorRateThreshold => Some(&self.error_rate_threshold),
            TriggerKind::ResponseTimeThreshold => Some(&self.response_time_threshold),
            TriggerKind::Manual => None,
        }
    }

    pub fn is_enabled(&self, kind: TriggerKind) -> bool {
        match self.threshold_trigger(kind) {
            Some(trigger) => trigger.enabled,
            None => self.manual.enabled,
        }
    }
}

// ============================================================================
// Rollback procedures
// ============================================================================

/// Shell commands used by command-driven domains (database, dependencies)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default)]
    pub backup: Option<String>,
    #[serde(default)]
    pub rollback: Option<String>,
    #[serde(default)]
    pub verify: Option<String>,
}

/// Directories used by snapshot-driven domains (files, configuration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPaths {
    /// Live tree being rolled back
    pub root: PathBuf,
    /// Known-good copy restored into `root`
    pub snapshot_dir: PathBuf,
    /// Where pre-rollback backups of `root` are written
    pub backup_dir: PathBuf,
}

impl SnapshotPaths {
    /// A snapshot or backup directory inside the live tree (or the reverse)
    /// would be copied into itself on backup and wiped on restore.
    pub fn check_disjoint(&self) -> CodespaceResult<()> {
        for (name, dir) in [("snapshot_dir", &self.snapshot_dir), ("backup_dir", &self.backup_dir)] {
            if dir.starts_with(&self.root) || self.root.starts_with(dir) {
                return Err(invalid(&format!(
                    "{} {} overlaps root {}",
                    name,
                    dir.display(),
                    self.root.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub backup_before_rollback: bool,

    #[serde(default = "default_true")]
    pub verify_after_rollback: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub commands: CommandSet,

    #[serde(default)]
    pub paths: Option<SnapshotPaths>,

    /// Glob patterns (relative to the root) never touched by the rollback
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backup_before_rollback: true,
            verify_after_rollback: true,
            max_retries: default_max_retries(),
            commands: CommandSet::default(),
            paths: None,
            exclude_patterns: Vec::new(),
            timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProceduresConfig {
    #[serde(default)]
    pub database: ProcedureConfig,
    #[serde(default)]
    pub files: ProcedureConfig,
    #[serde(default)]
    pub configuration: ProcedureConfig,
    #[serde(default)]
    pub dependencies: ProcedureConfig,
}

impl ProceduresConfig {
    pub fn get(&self, domain: RollbackDomain) -> &ProcedureConfig {
        match domain {
            RollbackDomain::Database => &self.database,
            RollbackDomain::Files => &self.files,
            RollbackDomain::Configuration => &self.configuration,
            RollbackDomain::Dependencies => &self.dependencies,
        }
    }

    /// Procedures in execution order, independent of how the file declared them
    pub fn in_order(&self) -> impl Iterator<Item = (RollbackDomain, &ProcedureConfig)> {
        RollbackDomain::EXECUTION_ORDER
            .into_iter()
            .map(move |domain| (domain, self.get(domain)))
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Structured log event
    Log {
        #[serde(default)]
        min_severity: Severity,
    },
    /// Desktop notification through notify-send
    Desktop {
        #[serde(default)]
        min_severity: Severity,
    },
    /// JSON POST to a webhook (Slack-compatible payload)
    Webhook {
        url: String,
        #[serde(default)]
        min_severity: Severity,
    },
}

impl ChannelConfig {
    pub fn min_severity(&self) -> Severity {
        match self {
            Self::Log { min_severity }
            | Self::Desktop { min_severity }
            | Self::Webhook { min_severity, .. } => *min_severity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Desktop { .. } => "desktop",
            Self::Webhook { .. } => "webhook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default = "default_success_title")]
    pub success_title: String,

    #[serde(default = "default_failure_title")]
    pub failure_title: String,

    #[serde(default = "default_body")]
    pub body: String,
}

fn default_success_title() -> String {
    "Rollback completed ({trigger})".to_string()
}

fn default_failure_title() -> String {
    "Rollback {status} ({trigger})".to_string()
}

fn default_body() -> String {
    "Rollback triggered by {trigger} at {started_at} {status} at {finished_at}.\n{procedures}"
        .to_string()
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            success_title: default_success_title(),
            failure_title: default_failure_title(),
            body: default_body(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default)]
    pub templates: TemplatesConfig,
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig::Log {
        min_severity: Severity::Info,
    }]
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            recipients: Vec::new(),
            templates: TemplatesConfig::default(),
        }
    }
}

// ============================================================================
// Rollback logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackLoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rollback_log_path")]
    pub path: PathBuf,

    /// Entries older than this are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Also record rejected manual invocations
    #[serde(default = "default_true")]
    pub audit_trail: bool,
}

fn default_rollback_log_path() -> PathBuf {
    PathBuf::from("/var/lib/codespace/rollback.jsonl")
}

fn default_retention_days() -> u32 {
    90
}

impl Default for RollbackLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_rollback_log_path(),
            retention_days: default_retention_days(),
            audit_trail: true,
        }
    }
}

// ============================================================================
// Rollback
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stop the environment before procedures and start it afterwards
    #[serde(default)]
    pub restart_infrastructure: bool,

    /// First retry delay; doubles per retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Executions kept in memory for status reporting
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub triggers: TriggersConfig,

    #[serde(default)]
    pub procedures: ProceduresConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub logging: RollbackLoggingConfig,
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    50
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_infrastructure: false,
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            history_limit: default_history_limit(),
            triggers: TriggersConfig::default(),
            procedures: ProceduresConfig::default(),
            notifications: NotificationsConfig::default(),
            logging: RollbackLoggingConfig::default(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete configuration snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodespaceConfig {
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    #[serde(default)]
    pub health_checks: HealthChecksConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,
}

impl CodespaceConfig {
    /// `codespace/config.toml` under the platform config dir (`~/.config` on Linux)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("codespace").join("config.toml"))
    }

    /// Resolve the config file to load, if any exists
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Some(user_path);
            }
        }
        let system_path = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Some(system_path);
        }
        None
    }

    /// Load and validate configuration
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match Self::locate(explicit) {
            Some(path) => {
                let config = Self::from_file(&path)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> CodespaceResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Enforce the invariants the rest of the system relies on
    pub fn validate(&self) -> CodespaceResult<()> {
        Environment::validate_name(&self.infrastructure.environment)?;
        if self.health_checks.interval == 0 {
            return Err(invalid("health_checks.interval must be > 0"));
        }
        if self.health_checks.timeout == 0 {
            return Err(invalid("health_checks.timeout must be > 0"));
        }
        let mut names = HashSet::new();
        for service in &self.health_checks.services {
            if service.name.trim().is_empty() {
                return Err(CodespaceError::MissingParameter("health_checks.services.name"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(invalid(&format!(
                    "health_checks.services: duplicate name '{}'",
                    service.name
                )));
            }
            match &service.probe {
                ProbeSpec::Tcp { address } if address.trim().is_empty() => {
                    return Err(CodespaceError::MissingParameter("address"));
                }
                ProbeSpec::Http { url, .. } if url.trim().is_empty() => {
                    return Err(CodespaceError::MissingParameter("url"));
                }
                ProbeSpec::Command { program, .. } if program.trim().is_empty() => {
                    return Err(CodespaceError::MissingParameter("program"));
                }
                _ => {}
            }
        }

        let triggers = &self.rollback.triggers;
        for kind in [
            TriggerKind::HealthCheckFailure,
            TriggerKind::ErrorRateThreshold,
            TriggerKind::ResponseTimeThreshold,
        ] {
            if let Some(trigger) = triggers.threshold_trigger(kind) {
                if !(trigger.threshold > 0.0) {
                    return Err(invalid(&format!("{}.threshold must be > 0", kind)));
                }
                if trigger.window_seconds == 0 || trigger.window_seconds > MAX_WINDOW_SECONDS {
                    return Err(invalid(&format!(
                        "{}.window_seconds must be between 1 and {}",
                        kind, MAX_WINDOW_SECONDS
                    )));
                }
            }
        }
        if triggers.manual.require_confirmation && triggers.manual.allowed_roles.is_empty() {
            return Err(invalid(
                "manual.allowed_roles must not be empty when require_confirmation is set",
            ));
        }

        for (domain, procedure) in self.rollback.procedures.in_order() {
            if !procedure.enabled {
                continue;
            }
            match domain {
                RollbackDomain::Database | RollbackDomain::Dependencies => {
                    if procedure.commands.rollback.is_none() {
                        return Err(invalid(&format!(
                            "procedures.{}.commands.rollback is required",
                            domain
                        )));
                    }
                    if procedure.backup_before_rollback && procedure.commands.backup.is_none() {
                        return Err(invalid(&format!(
                            "procedures.{}.commands.backup is required when backup_before_rollback is set",
                            domain
                        )));
                    }
                }
                RollbackDomain::Files | RollbackDomain::Configuration => match &procedure.paths {
                    Some(paths) => paths.check_disjoint()?,
                    None => {
                        return Err(invalid(&format!("procedures.{}.paths is required", domain)));
                    }
                },
            }
        }

        if self.rollback.retry_backoff_ms > self.rollback.max_backoff_ms {
            return Err(invalid("retry_backoff_ms must not exceed max_backoff_ms"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CodespaceError {
    CodespaceError::InvalidConfig(message.to_string())
}
