//! Rollback controller: trigger windows, procedure order, retries, alerting

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use codespace_common::audit_log::{AuditEntryType, AuditResult, RollbackLog};
use codespace_common::config::RollbackConfig;
use codespace_common::{
    CodespaceError, ExecutionState, HealthRecord, ProcedureOutcome, ResourceKind, RollbackDomain,
    Severity, TriggerKind, VerificationResult,
};
use codespaced::clock::{Clock, ManualClock, RecordingSleeper};
use codespaced::health::HealthSnapshot;
use codespaced::notifier::FakeAlertDispatcher;
use codespaced::orchestrator::{AutoConfirm, InfrastructureOrchestrator};
use codespaced::resources::{CallLog, FakeResourceManager, FakeResources};
use codespaced::rollback::{DomainRollback, FakeDomainRollback, RollbackController, TriggerContext};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    controller: RollbackController,
    alerts: Arc<FakeAlertDispatcher>,
    clock: Arc<ManualClock>,
    sleeper: Arc<RecordingSleeper>,
    calls: CallLog,
    domains: Vec<Arc<FakeDomainRollback>>,
}

fn all_enabled(mut config: RollbackConfig) -> RollbackConfig {
    for procedure in [
        &mut config.procedures.database,
        &mut config.procedures.files,
        &mut config.procedures.configuration,
        &mut config.procedures.dependencies,
    ] {
        procedure.enabled = true;
    }
    config
}

fn fixture(config: RollbackConfig) -> Fixture {
    let alerts = Arc::new(FakeAlertDispatcher::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
    ));
    let sleeper = Arc::new(RecordingSleeper::new());
    let calls = CallLog::new();

    // registered in reverse so ordering cannot come from registration
    let domains: Vec<Arc<FakeDomainRollback>> = [
        RollbackDomain::Dependencies,
        RollbackDomain::Configuration,
        RollbackDomain::Files,
        RollbackDomain::Database,
    ]
    .into_iter()
    .map(|d| Arc::new(FakeDomainRollback::new(d, calls.clone())))
    .collect();

    let handlers: Vec<Arc<dyn DomainRollback>> = domains
        .iter()
        .map(|d| d.clone() as Arc<dyn DomainRollback>)
        .collect();
    let controller = RollbackController::new(
        Arc::new(config),
        alerts.clone(),
        clock.clone(),
        sleeper.clone(),
    )
    .with_domains(handlers);

    Fixture {
        controller,
        alerts,
        clock,
        sleeper,
        calls,
        domains,
    }
}

impl Fixture {
    fn domain(&self, domain: RollbackDomain) -> &FakeDomainRollback {
        self.domains
            .iter()
            .find(|d| d.domain() == domain)
            .map(|d| d.as_ref())
            .unwrap()
    }

    fn health(&self, service: &str, healthy: bool) -> TriggerContext {
        let now = self.clock.now();
        let record = if healthy {
            HealthRecord::healthy(service, now, "ok")
        } else {
            HealthRecord::unhealthy(service, now, "connection refused")
        };
        TriggerContext::Health(Arc::new(HealthSnapshot::from([(
            service.to_string(),
            record,
        )])))
    }
}

fn admin() -> TriggerContext {
    TriggerContext::Manual {
        role: Some("admin".to_string()),
        reason: "bad release".to_string(),
    }
}

#[tokio::test]
async fn test_procedures_run_in_domain_order() {
    let f = fixture(all_enabled(RollbackConfig::default()));
    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    let order: Vec<RollbackDomain> = execution.procedures_run.iter().map(|p| p.domain).collect();
    assert_eq!(order, RollbackDomain::EXECUTION_ORDER.to_vec());
    assert_eq!(
        f.calls.entries(),
        vec![
            "database.backup",
            "database.rollback",
            "database.verify",
            "files.backup",
            "files.rollback",
            "files.verify",
            "configuration.backup",
            "configuration.rollback",
            "configuration.verify",
            "dependencies.backup",
            "dependencies.rollback",
            "dependencies.verify",
        ]
    );
    for record in &execution.procedures_run {
        assert_eq!(record.verification, Some(VerificationResult::Passed));
        assert!(record.backup.is_some());
    }
}

#[tokio::test]
async fn test_exhausted_verification_fails_procedure_but_next_runs() {
    let mut config = all_enabled(RollbackConfig::default());
    config.procedures.files.max_retries = 3;
    let f = fixture(config);
    f.domain(RollbackDomain::Files)
        .fail_always("verify", "checksum mismatch: app.php");

    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    let files = &execution.procedures_run[1];
    assert_eq!(files.domain, RollbackDomain::Files);
    assert_eq!(
        files.outcome,
        ProcedureOutcome::Failure {
            retries: 2,
            error: "verification failed: checksum mismatch: app.php".to_string()
        }
    );
    assert_eq!(f.calls.count("files.verify"), 3);
    assert!(execution.procedures_run[2].outcome.is_success());
    assert!(execution.procedures_run[3].outcome.is_success());
    assert_eq!(
        f.sleeper.recorded(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test]
async fn test_backup_failure_skips_mutation_and_siblings_continue() {
    let f = fixture(all_enabled(RollbackConfig::default()));
    f.domain(RollbackDomain::Database)
        .fail_always("backup", "pg_dump: connection refused");

    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    assert!(!execution.procedures_run[0].outcome.is_success());
    assert_eq!(f.calls.count("database.rollback"), 0);
    assert_eq!(f.calls.count("files.rollback"), 1);
    assert_eq!(execution.procedures_run.len(), 4);
}

#[tokio::test]
async fn test_exactly_one_alert_and_severity() {
    let f = fixture(all_enabled(RollbackConfig::default()));
    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();
    assert!(execution.notified);
    assert_eq!(execution.state, ExecutionState::Complete);
    assert_eq!(f.alerts.sent().len(), 1);
    assert_eq!(f.alerts.sent()[0].severity, Severity::Info);

    f.domain(RollbackDomain::Dependencies)
        .fail_always("rollback", "composer install failed");
    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();
    assert!(execution.any_failed());
    assert_eq!(f.alerts.sent().len(), 2);
    assert_eq!(f.alerts.sent()[1].severity, Severity::Critical);
    assert!(f.alerts.sent()[1].title.contains("failed"));
}

#[tokio::test]
async fn test_disabled_procedures_are_skipped() {
    let mut config = RollbackConfig::default();
    config.procedures.configuration.enabled = true;
    let f = fixture(config);

    let execution = f
        .controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.procedures_run.len(), 1);
    assert_eq!(execution.procedures_run[0].domain, RollbackDomain::Configuration);
}

#[tokio::test]
async fn test_health_trigger_fires_once_within_window() {
    let mut config = all_enabled(RollbackConfig::default());
    config.triggers.health_check_failure.threshold = 3.0;
    config.triggers.health_check_failure.window_seconds = 60;
    let f = fixture(config);
    let kind = TriggerKind::HealthCheckFailure;

    let mut fired = Vec::new();
    for step in 0..3 {
        if step > 0 {
            f.clock.advance(ChronoDuration::seconds(20));
        }
        let result = f
            .controller
            .evaluate_and_execute(kind, f.health("database", false))
            .await
            .unwrap();
        fired.push(result.is_some());
    }
    assert_eq!(fired, vec![false, false, true]);
    assert_eq!(f.alerts.sent().len(), 1);

    f.clock.advance(ChronoDuration::seconds(90));
    let fourth = f
        .controller
        .evaluate_and_execute(kind, f.health("database", false))
        .await
        .unwrap();
    assert!(fourth.is_none());
    assert_eq!(f.alerts.sent().len(), 1);
    assert_eq!(f.controller.history().len(), 1);
}

#[tokio::test]
async fn test_healthy_record_resets_consecutive_count() {
    let mut config = RollbackConfig::default();
    config.triggers.health_check_failure.threshold = 2.0;
    config.triggers.health_check_failure.window_seconds = 300;
    let f = fixture(config);
    let kind = TriggerKind::HealthCheckFailure;

    for healthy in [false, true, false] {
        let result = f
            .controller
            .evaluate_and_execute(kind, f.health("redis", healthy))
            .await
            .unwrap();
        assert!(result.is_none());
        f.clock.advance(ChronoDuration::seconds(10));
    }
}

#[tokio::test]
async fn test_error_rate_trigger_uses_window_mean() {
    let f = fixture(RollbackConfig::default());
    let kind = TriggerKind::ErrorRateThreshold;
    let sample = |value: f64| TriggerContext::Metric {
        value,
        observed_at: None,
    };

    assert!(f
        .controller
        .evaluate_and_execute(kind, sample(3.0))
        .await
        .unwrap()
        .is_none());
    let execution = f
        .controller
        .evaluate_and_execute(kind, sample(9.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.trigger_kind, kind);
}

#[tokio::test]
async fn test_disabled_trigger_is_error() {
    let mut config = RollbackConfig::default();
    config.triggers.response_time_threshold.enabled = false;
    let f = fixture(config);

    let err = f
        .controller
        .evaluate_and_execute(
            TriggerKind::ResponseTimeThreshold,
            TriggerContext::Metric {
                value: 9000.0,
                observed_at: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CodespaceError::TriggerDisabled(TriggerKind::ResponseTimeThreshold)
    ));
}

#[tokio::test]
async fn test_unauthorized_manual_is_rejected_and_audited() {
    let tmp = TempDir::new().unwrap();
    let log_path = tmp.path().join("rollback.jsonl");
    let f = fixture(all_enabled(RollbackConfig::default()));
    let controller = f.controller.with_log(RollbackLog::new(&log_path, 90));

    let err = controller
        .evaluate_and_execute(
            TriggerKind::Manual,
            TriggerContext::Manual {
                role: Some("intern".to_string()),
                reason: "curious".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_authorization());
    assert!(f.calls.is_empty());
    assert!(f.alerts.sent().is_empty());

    let entries = RollbackLog::new(&log_path, 90).recent(10);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, AuditEntryType::ManualRejected);
    assert_eq!(entries[0].result, AuditResult::Blocked);
}

#[tokio::test]
async fn test_finished_execution_is_audited() {
    let tmp = TempDir::new().unwrap();
    let log_path = tmp.path().join("rollback.jsonl");
    let f = fixture(all_enabled(RollbackConfig::default()));
    let controller = f.controller.with_log(RollbackLog::new(&log_path, 90));

    let execution = controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    let entries = RollbackLog::new(&log_path, 90).recent(10);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, AuditEntryType::Execution);
    assert_eq!(
        entries[0].execution.as_ref().map(|e| e.id.clone()),
        Some(execution.id)
    );
}

fn orchestrator_with(calls: &CallLog) -> (Arc<InfrastructureOrchestrator>, Arc<FakeResourceManager>) {
    let resources = Arc::new(FakeResources::new(calls.clone()));
    let docker = resources.manager("default", ResourceKind::Docker);
    let orchestrator = Arc::new(InfrastructureOrchestrator::new(
        resources,
        Arc::new(AutoConfirm),
        Arc::new(codespaced::clock::SystemClock),
        "default",
    ));
    (orchestrator, docker)
}

#[tokio::test]
async fn test_restart_infrastructure_wraps_procedures() {
    let mut config = RollbackConfig::default();
    config.restart_infrastructure = true;
    config.procedures.database.enabled = true;
    let f = fixture(config);
    let (orchestrator, _docker) = orchestrator_with(&f.calls);
    let controller = f.controller.with_infrastructure(orchestrator.clone(), "default");

    let execution = controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(execution.state, ExecutionState::Complete);
    assert_eq!(
        f.calls.entries(),
        vec![
            "docker.stop",
            "network.stop",
            "volume.stop",
            "database.backup",
            "database.rollback",
            "database.verify",
            "volume.start",
            "network.start",
            "docker.start",
        ]
    );
    assert_eq!(
        orchestrator.lifecycle_state("default").await,
        codespace_common::LifecycleState::Running
    );
}

#[tokio::test]
async fn test_stop_failure_aborts_execution() {
    let mut config = RollbackConfig::default();
    config.restart_infrastructure = true;
    config.procedures.database.enabled = true;
    let f = fixture(config);
    let (orchestrator, docker) = orchestrator_with(&f.calls);
    docker.fail_on("stop", "daemon not responding");
    let controller = f.controller.with_infrastructure(orchestrator, "default");

    let execution = controller
        .evaluate_and_execute(TriggerKind::Manual, admin())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(execution.state, ExecutionState::Aborted);
    assert!(execution.procedures_run.is_empty());
    assert!(execution
        .abort_reason
        .as_deref()
        .unwrap()
        .contains("daemon not responding"));
    assert_eq!(f.calls.count("database."), 0);
    assert_eq!(f.alerts.sent().len(), 1);
    assert_eq!(f.alerts.sent()[0].severity, Severity::Critical);
}
