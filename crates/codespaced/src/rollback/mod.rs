//! Health-triggered rollback
//!
//! Execution state machine:
//! `idle -> triggered -> running_procedures -> verifying -> notifying -> complete`
//! (or `aborted`).
//!
//! Triggers are evaluated independently. Once one trips, every enabled
//! procedure runs in domain order (database, files, configuration,
//! dependencies), then exactly one alert concludes the execution. Executions
//! are serialised; a new trigger always starts a fresh execution.

pub mod domains;
pub mod exclusions;
pub mod procedure;
pub mod trigger;

pub use domains::{build_domains, CommandDomain, SnapshotDomain};
pub use exclusions::ExclusionSet;
pub use procedure::{backoff_delay, DomainRollback, FakeDomainRollback, ProcedureRunner};
pub use trigger::TriggerEvaluator;

use crate::clock::{Clock, Sleeper};
use crate::health::HealthSnapshot;
use crate::notifier::{rollback_alert, AlertDispatcher};
use crate::orchestrator::{Action, InfrastructureOrchestrator, OperationRequest};
use chrono::{DateTime, Utc};
use codespace_common::audit_log::{AuditEntry, RollbackLog};
use codespace_common::config::RollbackConfig;
use codespace_common::{
    CodespaceError, CodespaceResult, ExecutionState, ProcedureOutcome, ProcedureRecord,
    RollbackDomain, RollbackExecution, TriggerKind,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Input accompanying an evaluation request
#[derive(Debug, Clone)]
pub enum TriggerContext {
    /// One monitoring cycle's records
    Health(Arc<HealthSnapshot>),
    /// An externally measured sample (error rate in %, response time in ms)
    Metric {
        value: f64,
        observed_at: Option<DateTime<Utc>>,
    },
    /// Operator invocation
    Manual {
        role: Option<String>,
        reason: String,
    },
}

impl TriggerContext {
    fn name(&self) -> &'static str {
        match self {
            Self::Health(_) => "health",
            Self::Metric { .. } => "metric",
            Self::Manual { .. } => "manual",
        }
    }

    fn fits(&self, kind: TriggerKind) -> bool {
        matches!(
            (kind, self),
            (TriggerKind::HealthCheckFailure, Self::Health(_))
                | (TriggerKind::ErrorRateThreshold, Self::Metric { .. })
                | (TriggerKind::ResponseTimeThreshold, Self::Metric { .. })
                | (TriggerKind::Manual, Self::Manual { .. })
        )
    }
}

struct Infrastructure {
    orchestrator: Arc<InfrastructureOrchestrator>,
    environment: String,
}

pub struct RollbackController {
    config: Arc<RollbackConfig>,
    alerts: Arc<dyn AlertDispatcher>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    domains: BTreeMap<RollbackDomain, Arc<dyn DomainRollback>>,
    infrastructure: Option<Infrastructure>,
    log: Option<RollbackLog>,
    evaluator: Mutex<TriggerEvaluator>,
    running: tokio::sync::Mutex<()>,
    history: Mutex<VecDeque<RollbackExecution>>,
}

impl RollbackController {
    pub fn new(
        config: Arc<RollbackConfig>,
        alerts: Arc<dyn AlertDispatcher>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            alerts,
            clock,
            sleeper,
            domains: BTreeMap::new(),
            infrastructure: None,
            log: None,
            evaluator: Mutex::new(TriggerEvaluator::new()),
            running: tokio::sync::Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the handler for one domain; a later handler replaces an earlier one
    pub fn with_domain(mut self, handler: Arc<dyn DomainRollback>) -> Self {
        self.domains.insert(handler.domain(), handler);
        self
    }

    pub fn with_domains(self, handlers: impl IntoIterator<Item = Arc<dyn DomainRollback>>) -> Self {
        handlers.into_iter().fold(self, Self::with_domain)
    }

    /// Environment stopped and started around procedures when
    /// `restart_infrastructure` is set
    pub fn with_infrastructure(
        mut self,
        orchestrator: Arc<InfrastructureOrchestrator>,
        environment: &str,
    ) -> Self {
        self.infrastructure = Some(Infrastructure {
            orchestrator,
            environment: environment.to_string(),
        });
        self
    }

    pub fn with_log(mut self, log: RollbackLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    /// Whether `kind` would be evaluated at all
    pub fn accepts(&self, kind: TriggerKind) -> bool {
        self.config.enabled && self.config.triggers.is_enabled(kind)
    }

    /// Finished executions, oldest first
    pub fn history(&self) -> Vec<RollbackExecution> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Evaluate `kind` against `context`; runs an execution when it trips
    ///
    /// Returns `Ok(None)` when the trigger did not trip. Disabled triggers,
    /// mismatched context and unauthorised manual invocations are errors and
    /// never run a procedure.
    pub async fn evaluate_and_execute(
        &self,
        kind: TriggerKind,
        context: TriggerContext,
    ) -> CodespaceResult<Option<RollbackExecution>> {
        if !context.fits(kind) {
            return Err(CodespaceError::TriggerMismatch {
                kind,
                context: context.name(),
            });
        }
        if !self.config.enabled {
            return Err(CodespaceError::RollbackDisabled);
        }
        if !self.config.triggers.is_enabled(kind) {
            return Err(CodespaceError::TriggerDisabled(kind));
        }

        let tripped = match &context {
            TriggerContext::Health(snapshot) => {
                let trigger = &self.config.triggers.health_check_failure;
                let services = self
                    .evaluator
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .observe_health(trigger, snapshot);
                services.map(|services| {
                    info!(trigger = %kind, "Tripped by unhealthy services: {}", services.join(", "));
                })
            }
            TriggerContext::Metric { value, observed_at } => {
                let Some(trigger) = self.config.triggers.threshold_trigger(kind) else {
                    return Err(CodespaceError::TriggerMismatch {
                        kind,
                        context: context.name(),
                    });
                };
                let at = observed_at.unwrap_or_else(|| self.clock.now());
                let mean = self
                    .evaluator
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .observe_metric(kind, trigger, *value, at);
                mean.map(|mean| {
                    info!(trigger = %kind, "Tripped: window mean {:.2} > {}", mean, trigger.threshold);
                })
            }
            TriggerContext::Manual { role, reason } => {
                self.authorize(role.as_deref(), reason).await?;
                info!(trigger = %kind, role = ?role, "Manual rollback requested: {}", reason);
                Some(())
            }
        };

        match tripped {
            Some(()) => Ok(Some(self.execute(kind).await)),
            None => {
                debug!(trigger = %kind, "Not tripped");
                Ok(None)
            }
        }
    }

    async fn authorize(&self, role: Option<&str>, reason: &str) -> CodespaceResult<()> {
        let manual = &self.config.triggers.manual;
        if !manual.require_confirmation {
            return Ok(());
        }
        let allowed = role
            .map(|r| manual.allowed_roles.iter().any(|a| a == r))
            .unwrap_or(false);
        if allowed {
            return Ok(());
        }

        warn!(role = ?role, "Manual rollback rejected");
        if self.config.logging.audit_trail {
            self.append_audit(AuditEntry::manual_rejected(role, reason, self.clock.now()))
                .await;
        }
        Err(CodespaceError::Unauthorized(match role {
            Some(role) => format!("role '{}' may not trigger a rollback", role),
            None => "a role is required to trigger a rollback".to_string(),
        }))
    }

    async fn execute(&self, kind: TriggerKind) -> RollbackExecution {
        let _running = self.running.lock().await;
        let mut execution = RollbackExecution::new(kind, self.clock.now());
        info!(execution = %execution.id, trigger = %kind, "Rollback execution started");

        if self.config.restart_infrastructure {
            if let Err(reason) = self.infrastructure_op(Action::Stop).await {
                error!(execution = %execution.id, "Aborting: {}", reason);
                execution.abort(reason);
            }
        }

        if !execution.is_aborted() {
            execution.state = ExecutionState::RunningProcedures;
            self.run_procedures(&mut execution).await;

            execution.state = ExecutionState::Verifying;
            if self.config.restart_infrastructure {
                if let Err(reason) = self.infrastructure_op(Action::Start).await {
                    error!(execution = %execution.id, "{}", reason);
                    execution.abort(reason);
                }
            }
        }

        execution.state = ExecutionState::Notifying;
        let finished_at = self.clock.now();
        execution.finished_at = Some(finished_at);
        let (title, body) = rollback_alert(&self.config.notifications.templates, &execution);
        self.alerts
            .send_alert(&title, &body, execution.alert_severity())
            .await;
        execution.notified = true;
        execution.finish(finished_at);

        info!(
            execution = %execution.id,
            trigger = %kind,
            "Rollback execution {}",
            execution.status_str()
        );

        self.append_audit(AuditEntry::for_execution(&execution, finished_at))
            .await;
        self.remember(&execution);
        execution
    }

    async fn run_procedures(&self, execution: &mut RollbackExecution) {
        let runner = ProcedureRunner {
            clock: self.clock.as_ref(),
            sleeper: self.sleeper.as_ref(),
            retry_backoff_ms: self.config.retry_backoff_ms,
            max_backoff_ms: self.config.max_backoff_ms,
        };

        for (domain, procedure) in self.config.procedures.in_order() {
            if !procedure.enabled {
                continue;
            }
            let record = match self.domains.get(&domain) {
                Some(handler) => runner.run(handler.as_ref(), procedure).await,
                None => {
                    let now = self.clock.now();
                    warn!(domain = %domain, "Procedure enabled but no handler registered");
                    ProcedureRecord {
                        domain,
                        outcome: ProcedureOutcome::Failure {
                            retries: 0,
                            error: "no handler registered".to_string(),
                        },
                        verification: None,
                        backup: None,
                        started_at: now,
                        finished_at: now,
                    }
                }
            };
            execution.record(record);
        }
    }

    async fn infrastructure_op(&self, action: Action) -> Result<(), String> {
        let Some(infra) = &self.infrastructure else {
            return Err(format!(
                "infrastructure {} requested but no orchestrator is attached",
                action
            ));
        };
        let request = OperationRequest::new(action)
            .forced()
            .in_environment(&infra.environment);
        let result = infra.orchestrator.execute(request).await;
        if result.success {
            Ok(())
        } else {
            Err(format!("infrastructure {} failed: {}", action, result.output()))
        }
    }

    async fn append_audit(&self, entry: AuditEntry) {
        if !self.config.logging.enabled {
            return;
        }
        let Some(log) = self.log.clone() else {
            return;
        };
        let path = log.path().display().to_string();
        match tokio::task::spawn_blocking(move || log.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write rollback log {}: {}", path, e),
            Err(e) => warn!("Rollback log task failed: {}", e),
        }
    }

    fn remember(&self, execution: &RollbackExecution) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(execution.clone());
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }
}
