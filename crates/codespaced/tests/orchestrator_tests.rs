//! Orchestrator behaviour against fake resource managers

use codespace_common::{HealthRecord, LifecycleState, ResourceKind, EXIT_FAILURE, EXIT_SUCCESS};
use codespaced::clock::SystemClock;
use codespaced::health::HealthSnapshot;
use codespaced::orchestrator::{
    AutoConfirm, Confirm, Decline, EnvironmentStore, InfrastructureOrchestrator, ScriptedConfirm,
};
use codespaced::resources::{CallLog, FakeResourceManager, FakeResources};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    orchestrator: Arc<InfrastructureOrchestrator>,
    calls: CallLog,
    resources: Arc<FakeResources>,
    docker: Arc<FakeResourceManager>,
    network: Arc<FakeResourceManager>,
    volume: Arc<FakeResourceManager>,
}

fn build(confirm: Arc<dyn Confirm>, state_dir: Option<&Path>) -> Fixture {
    let calls = CallLog::new();
    let resources = Arc::new(FakeResources::new(calls.clone()));
    let mut orchestrator =
        InfrastructureOrchestrator::new(resources.clone(), confirm, Arc::new(SystemClock), "default");
    if let Some(dir) = state_dir {
        orchestrator = orchestrator.with_store(EnvironmentStore::on_disk(dir));
    }
    Fixture {
        orchestrator: Arc::new(orchestrator),
        calls,
        docker: resources.manager("default", ResourceKind::Docker),
        network: resources.manager("default", ResourceKind::Network),
        volume: resources.manager("default", ResourceKind::Volume),
        resources,
    }
}

fn fixture(confirm: Arc<dyn Confirm>) -> Fixture {
    build(confirm, None)
}

fn unhealthy_snapshot() -> HealthSnapshot {
    HealthSnapshot::from([(
        "database".to_string(),
        HealthRecord::unhealthy("database", chrono::Utc::now(), "connection refused"),
    )])
}

#[tokio::test]
async fn test_invalid_action_touches_nothing() {
    let f = fixture(Arc::new(AutoConfirm));
    let result = f.orchestrator.handle("explode", None, true, None).await;

    assert!(!result.success);
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(result.output(), "Invalid action: explode");
    assert!(f.calls.is_empty());
}

#[tokio::test]
async fn test_invalid_service_touches_nothing() {
    let f = fixture(Arc::new(AutoConfirm));
    let result = f.orchestrator.handle("start", Some("kubernetes"), true, None).await;

    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(result.output(), "Invalid service: kubernetes");
    assert!(f.calls.is_empty());
}

#[tokio::test]
async fn test_declined_confirmation_is_success_without_calls() {
    for action in ["start", "stop", "restart", "cleanup"] {
        let f = fixture(Arc::new(Decline));
        let result = f.orchestrator.handle(action, None, false, None).await;

        assert!(result.success, "{}", action);
        assert!(result.declined);
        assert_eq!(result.exit_code(), EXIT_SUCCESS);
        assert!(f.calls.is_empty(), "{} touched a manager", action);
    }
}

#[tokio::test]
async fn test_start_prompt_text() {
    let confirm = Arc::new(ScriptedConfirm::new([true]));
    let f = fixture(confirm.clone());
    f.orchestrator.handle("start", None, false, None).await;

    assert_eq!(
        confirm.prompts(),
        vec!["Are you sure you want to start the infrastructure?"]
    );
}

#[tokio::test]
async fn test_restart_service_is_stop_then_start_with_one_prompt() {
    let confirm = Arc::new(ScriptedConfirm::new([true]));
    let f = fixture(confirm.clone());
    f.orchestrator.handle("start", None, true, None).await;
    f.calls.clear();
    let result = f
        .orchestrator
        .handle("restart", Some("docker:mysql"), false, None)
        .await;

    assert!(result.success);
    assert_eq!(confirm.prompts().len(), 1);
    assert_eq!(
        f.calls.entries(),
        vec!["docker.stop_service:mysql", "docker.start_service:mysql"]
    );
    assert_eq!(result.lifecycle_state, LifecycleState::Running);
}

#[tokio::test]
async fn test_restart_class_uses_stop_and_start() {
    let f = fixture(Arc::new(AutoConfirm));
    f.orchestrator.handle("restart", Some("network"), true, None).await;
    assert_eq!(f.calls.entries(), vec!["network.stop", "network.start"]);
}

#[tokio::test]
async fn test_cleanup_stops_everything_before_cleaning() {
    let f = fixture(Arc::new(AutoConfirm));
    f.orchestrator.handle("start", None, true, None).await;
    f.calls.clear();

    let result = f.orchestrator.handle("cleanup", None, true, None).await;
    assert!(result.success);
    assert_eq!(
        f.calls.entries(),
        vec![
            "docker.stop",
            "network.stop",
            "volume.stop",
            "docker.cleanup",
            "volume.cleanup"
        ]
    );
    assert_eq!(result.lifecycle_state, LifecycleState::Absent);
    assert!(f.orchestrator.environment("default").await.is_none());
}

#[tokio::test]
async fn test_start_twice_is_idempotent() {
    let f = fixture(Arc::new(AutoConfirm));
    let first = f.orchestrator.handle("start", None, true, None).await;
    let second = f.orchestrator.handle("start", None, true, None).await;

    assert_eq!(first.lifecycle_state, LifecycleState::Running);
    assert_eq!(second.lifecycle_state, LifecycleState::Running);
    assert_eq!(f.calls.count("docker.start"), 2);
    assert_eq!(f.calls.count("network.start"), 2);
    assert_eq!(f.calls.count("volume.start"), 2);
    for manager in [&f.docker, &f.network, &f.volume] {
        assert!(manager.is_running());
        assert_eq!(manager.transitions(), 1);
    }
}

#[tokio::test]
async fn test_status_reports_four_entries() {
    let f = fixture(Arc::new(Decline));
    let result = f.orchestrator.handle("status", None, false, None).await;

    assert!(result.success);
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    let components: Vec<&str> = result.report.iter().map(|s| s.component.as_str()).collect();
    assert_eq!(components, vec!["docker", "network", "volume", "orchestrator"]);
    assert_eq!(
        f.calls.entries(),
        vec!["docker.status", "network.status", "volume.status"]
    );
    assert!(!result.declined);
}

#[tokio::test]
async fn test_docker_failure_aborts_and_reports() {
    let f = fixture(Arc::new(AutoConfirm));
    f.docker.fail_on("start", "Service unavailable");

    let result = f.orchestrator.handle("start", Some("docker"), true, None).await;

    assert!(result.output().contains("Error: Service unavailable"));
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(f.calls.count("network."), 0);
    assert_eq!(f.calls.count("volume."), 0);
    assert_eq!(result.lifecycle_state, LifecycleState::Absent);
}

#[tokio::test]
async fn test_failure_mid_start_all_leaves_partial_state() {
    let f = fixture(Arc::new(AutoConfirm));
    f.network.fail_on("start", "address pool exhausted");

    let result = f.orchestrator.handle("start", None, true, None).await;

    assert_eq!(result.output(), "Error: address pool exhausted");
    assert_eq!(f.calls.entries(), vec!["volume.start", "network.start"]);
    assert!(f.volume.is_running());
    assert!(!f.docker.is_running());
}

#[tokio::test]
async fn test_failure_mid_start_all_stays_starting() {
    let f = fixture(Arc::new(AutoConfirm));
    f.docker.fail_on("start", "Service unavailable");

    let result = f.orchestrator.handle("start", None, true, None).await;
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(result.lifecycle_state, LifecycleState::Starting);
}

#[tokio::test]
async fn test_service_stop_keeps_environment_running() {
    let f = fixture(Arc::new(AutoConfirm));
    f.orchestrator.handle("start", None, true, None).await;

    let result = f.orchestrator.handle("stop", Some("docker"), true, None).await;
    assert!(result.success);
    assert_eq!(result.lifecycle_state, LifecycleState::Running);
    assert!(!f.docker.is_running());
    assert!(f.network.is_running());
    assert!(f.volume.is_running());

    let env = f.orchestrator.environment("default").await.unwrap();
    assert!(!env.service_refs.contains("docker"));
    assert!(env.service_refs.contains("network"));
}

#[tokio::test]
async fn test_environments_are_independent() {
    let f = fixture(Arc::new(AutoConfirm));
    f.orchestrator.handle("start", None, true, Some("alice")).await;
    f.orchestrator.handle("start", None, true, Some("bob")).await;
    f.orchestrator.handle("cleanup", None, true, Some("bob")).await;

    assert_eq!(
        f.orchestrator.lifecycle_state("alice").await,
        LifecycleState::Running
    );
    assert_eq!(
        f.orchestrator.lifecycle_state("bob").await,
        LifecycleState::Absent
    );
    for kind in ResourceKind::STARTUP_ORDER {
        assert!(f.resources.manager("alice", kind).is_running(), "alice {}", kind);
        assert!(!f.resources.manager("bob", kind).is_running(), "bob {}", kind);
        assert_eq!(f.resources.manager("alice", kind).transitions(), 1);
    }
    // nothing of the default environment was touched
    assert_eq!(f.docker.transitions(), 0);
}

#[tokio::test]
async fn test_start_and_cleanup_never_interleave() {
    let f = fixture(Arc::new(AutoConfirm));
    let gate = f.docker.gate("start");

    let start = tokio::spawn({
        let orchestrator = f.orchestrator.clone();
        async move { orchestrator.handle("start", None, true, None).await }
    });
    gate.entered().await;

    let cleanup = tokio::spawn({
        let orchestrator = f.orchestrator.clone();
        async move { orchestrator.handle("cleanup", None, true, None).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cleanup.is_finished());
    assert_eq!(
        f.calls.entries(),
        vec!["volume.start", "network.start", "docker.start"]
    );

    gate.release();
    let started = start.await.unwrap();
    let cleaned = cleanup.await.unwrap();
    assert!(started.success);
    assert_eq!(started.lifecycle_state, LifecycleState::Running);
    assert!(cleaned.success);
    assert_eq!(cleaned.lifecycle_state, LifecycleState::Absent);

    let entries = f.calls.entries();
    let last_start = entries.iter().rposition(|e| e.ends_with(".start")).unwrap();
    let first_teardown = entries
        .iter()
        .position(|e| e.ends_with(".stop") || e.ends_with(".cleanup"))
        .unwrap();
    assert!(last_start < first_teardown, "{:?}", entries);
}

#[tokio::test]
async fn test_state_is_shared_through_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let cli = build(Arc::new(AutoConfirm), Some(dir.path()));
    let daemon = build(Arc::new(AutoConfirm), Some(dir.path()));

    cli.orchestrator.handle("start", None, true, None).await;
    assert_eq!(
        daemon.orchestrator.lifecycle_state("default").await,
        LifecycleState::Running
    );

    let state = daemon
        .orchestrator
        .record_health("default", &unhealthy_snapshot())
        .await;
    assert_eq!(state, LifecycleState::Degraded);
    assert_eq!(
        cli.orchestrator.lifecycle_state("default").await,
        LifecycleState::Degraded
    );

    cli.orchestrator.handle("cleanup", None, true, None).await;
    assert!(daemon.orchestrator.environment("default").await.is_none());
}

#[tokio::test]
async fn test_lock_held_elsewhere_blocks_operations() {
    let dir = tempfile::tempdir().unwrap();
    let f = build(Arc::new(AutoConfirm), Some(dir.path()));
    f.orchestrator.handle("start", None, true, None).await;
    f.calls.clear();

    let other = EnvironmentStore::on_disk(dir.path());
    let held = other.lock("default").await.unwrap();

    let state = f
        .orchestrator
        .record_health("default", &unhealthy_snapshot())
        .await;
    assert_eq!(state, LifecycleState::Running);

    let stop = tokio::spawn({
        let orchestrator = f.orchestrator.clone();
        async move { orchestrator.handle("stop", None, true, None).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stop.is_finished());
    assert!(f.calls.is_empty());

    drop(held);
    let result = tokio::time::timeout(Duration::from_secs(5), stop)
        .await
        .unwrap()
        .unwrap();
    assert!(result.success);
    assert_eq!(result.lifecycle_state, LifecycleState::Stopped);
}
