//! Infrastructure orchestrator
//!
//! Aggregates the three resource managers into environment level operations,
//! owns the per-environment lifecycle record and applies the confirmation
//! policy. Every environment gets its own managers from a [`ResourceProvider`]
//! and its record lives in an [`EnvironmentStore`]. Lifecycle-mutating
//! operations on one environment hold the store lock, which also excludes
//! other processes sharing the state directory; `status` never waits for it.
//!
//! Only whole-stack operations move the lifecycle state. A `--service`
//! operation touches its manager and the environment's service refs.

pub mod action;
pub mod confirm;
pub mod store;

pub use action::{Action, OperationRequest, OperationResult, ServiceTarget};
pub use confirm::{AutoConfirm, Confirm, Decline, ScriptedConfirm};
pub use store::{EnvironmentGuard, EnvironmentStore};

use crate::clock::Clock;
use crate::health::HealthSnapshot;
use crate::resources::{ResourceProvider, ResourceSet};
use anyhow::Result;
use codespace_common::{ComponentStatus, Environment, LifecycleState, ResourceKind};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct InfrastructureOrchestrator {
    resources: Arc<dyn ResourceProvider>,
    confirm: Arc<dyn Confirm>,
    clock: Arc<dyn Clock>,
    default_environment: String,
    store: EnvironmentStore,
}

impl InfrastructureOrchestrator {
    pub fn new(
        resources: Arc<dyn ResourceProvider>,
        confirm: Arc<dyn Confirm>,
        clock: Arc<dyn Clock>,
        default_environment: &str,
    ) -> Self {
        Self {
            resources,
            confirm,
            clock,
            default_environment: default_environment.to_string(),
            store: EnvironmentStore::in_memory(),
        }
    }

    /// Keep environment records in `store` instead of process memory
    pub fn with_store(mut self, store: EnvironmentStore) -> Self {
        self.store = store;
        self
    }

    pub fn default_environment(&self) -> &str {
        &self.default_environment
    }

    pub fn store(&self) -> &EnvironmentStore {
        &self.store
    }

    /// Copy of one environment record
    pub async fn environment(&self, name: &str) -> Option<Environment> {
        match self.store.load(name).await {
            Ok(env) => env,
            Err(e) => {
                warn!(environment = %name, "Cannot read environment record: {:#}", e);
                None
            }
        }
    }

    pub async fn lifecycle_state(&self, name: &str) -> LifecycleState {
        self.environment(name)
            .await
            .map(|env| env.lifecycle_state)
            .unwrap_or(LifecycleState::Absent)
    }

    /// Parse raw input and execute; validation errors become failed results
    /// without touching any manager.
    pub async fn handle(
        &self,
        action: &str,
        service: Option<&str>,
        force: bool,
        environment: Option<&str>,
    ) -> OperationResult {
        match OperationRequest::parse(action, service, force, environment) {
            Ok(request) => self.execute(request).await,
            Err(e) => {
                let name = environment.unwrap_or(&self.default_environment);
                warn!(environment = %name, "Rejected request: {}", e);
                let state = match Environment::validate_name(name) {
                    Ok(()) => self.lifecycle_state(name).await,
                    Err(_) => LifecycleState::Absent,
                };
                OperationResult::rejected(&e, name, state)
            }
        }
    }

    pub async fn execute(&self, request: OperationRequest) -> OperationResult {
        let name = request
            .environment
            .clone()
            .unwrap_or_else(|| self.default_environment.clone());
        let action = request.action;

        if let Err(e) = Environment::validate_name(&name) {
            warn!(environment = %name, "Rejected request: {}", e);
            return OperationResult::rejected(&e, &name, LifecycleState::Absent);
        }

        if action == Action::Status {
            return self.status(&name, request.service.as_ref()).await;
        }

        if !request.force {
            if let Some(prompt) = action.confirmation_prompt() {
                if !self.confirm.confirm(&prompt).await {
                    info!(environment = %name, action = %action, "Operation declined");
                    return OperationResult::declined(action, &name, self.lifecycle_state(&name).await);
                }
            }
        }

        let mut result = OperationResult::ok(action, &name, LifecycleState::Absent);
        let _guard = match self.store.lock(&name).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(environment = %name, "Cannot lock environment: {:#}", e);
                result.fail(format!("{:#}", e));
                result.lifecycle_state = self.lifecycle_state(&name).await;
                return result;
            }
        };
        info!(environment = %name, action = %action, service = ?request.service.as_ref().map(|s| s.to_string()), "Executing");

        let resources = self.resources.resources(&name);
        let target = request.service.as_ref();
        let outcome = match action {
            // answered before locking
            Action::Status => Ok(()),
            Action::Start => self.do_start(&name, &resources, target, &mut result).await,
            Action::Stop => self.do_stop(&name, &resources, target, &mut result).await,
            Action::Restart => match self.do_stop(&name, &resources, target, &mut result).await {
                Ok(()) => self.do_start(&name, &resources, target, &mut result).await,
                Err(e) => Err(e),
            },
            Action::Cleanup => self.do_cleanup(&name, &resources, &mut result).await,
        };

        if let Err(e) = outcome {
            error!(environment = %name, action = %action, "Operation failed: {}", e);
            result.fail(e);
        }
        result.lifecycle_state = self.lifecycle_state(&name).await;
        result
    }

    // ------------------------------------------------------------------------
    // Lifecycle bookkeeping (caller holds the environment lock)
    // ------------------------------------------------------------------------

    async fn load_or_new(&self, name: &str) -> Result<Environment> {
        Ok(match self.store.load(name).await? {
            Some(env) => env,
            None => Environment::new(name, self.clock.now()),
        })
    }

    async fn transition(&self, name: &str, next: LifecycleState) -> Result<()> {
        let mut env = self.load_or_new(name).await?;
        let from = env.lifecycle_state;
        env.transition(next)?;
        self.store.save(&env).await?;
        debug!(environment = %name, "Lifecycle {} -> {}", from, next);
        Ok(())
    }

    async fn update_refs(&self, name: &str, target: Option<&ServiceTarget>, up: bool) -> Result<()> {
        let mut env = self.load_or_new(name).await?;
        match (target, up) {
            (Some(target), true) => {
                env.service_refs.insert(target.to_string());
            }
            (Some(target), false) => {
                env.service_refs.remove(&target.to_string());
            }
            (None, true) => {
                env.service_refs.extend(
                    ResourceKind::STARTUP_ORDER
                        .iter()
                        .map(|kind| kind.as_str().to_string()),
                );
            }
            (None, false) => env.service_refs.clear(),
        }
        self.store.save(&env).await
    }

    // ------------------------------------------------------------------------
    // Manager calls
    // ------------------------------------------------------------------------

    async fn start_target(resources: &ResourceSet, target: &ServiceTarget) -> Result<()> {
        match target {
            ServiceTarget::Class(kind) => resources.get(*kind).start().await,
            ServiceTarget::Named { kind, name } => resources.get(*kind).start_service(name).await,
        }
    }

    async fn stop_target(resources: &ResourceSet, target: &ServiceTarget) -> Result<()> {
        match target {
            ServiceTarget::Class(kind) => resources.get(*kind).stop().await,
            ServiceTarget::Named { kind, name } => resources.get(*kind).stop_service(name).await,
        }
    }

    /// Volume, network, then containers
    async fn start_all(resources: &ResourceSet) -> Result<()> {
        for kind in ResourceKind::STARTUP_ORDER {
            resources.get(kind).start().await?;
        }
        Ok(())
    }

    /// Containers, network, then volumes
    async fn stop_all(resources: &ResourceSet) -> Result<()> {
        for kind in ResourceKind::TEARDOWN_ORDER {
            resources.get(kind).stop().await?;
        }
        Ok(())
    }

    async fn do_start(
        &self,
        name: &str,
        resources: &ResourceSet,
        target: Option<&ServiceTarget>,
        result: &mut OperationResult,
    ) -> Result<()> {
        match target {
            Some(target) => {
                Self::start_target(resources, target).await?;
                self.update_refs(name, Some(target), true).await?;
                result.messages.push(format!("Started {}", target));
            }
            None => {
                self.transition(name, LifecycleState::Starting).await?;
                Self::start_all(resources).await?;
                self.transition(name, LifecycleState::Running).await?;
                self.update_refs(name, None, true).await?;
                result.messages.push("Infrastructure started".to_string());
            }
        }
        Ok(())
    }

    async fn do_stop(
        &self,
        name: &str,
        resources: &ResourceSet,
        target: Option<&ServiceTarget>,
        result: &mut OperationResult,
    ) -> Result<()> {
        match target {
            Some(target) => {
                Self::stop_target(resources, target).await?;
                self.update_refs(name, Some(target), false).await?;
                result.messages.push(format!("Stopped {}", target));
            }
            None => {
                self.transition(name, LifecycleState::Stopping).await?;
                Self::stop_all(resources).await?;
                self.transition(name, LifecycleState::Stopped).await?;
                self.update_refs(name, None, false).await?;
                result.messages.push("Infrastructure stopped".to_string());
            }
        }
        Ok(())
    }

    async fn do_cleanup(
        &self,
        name: &str,
        resources: &ResourceSet,
        result: &mut OperationResult,
    ) -> Result<()> {
        self.transition(name, LifecycleState::Cleaning).await?;
        Self::stop_all(resources).await?;
        resources.get(ResourceKind::Docker).cleanup().await?;
        resources.get(ResourceKind::Volume).cleanup().await?;

        self.transition(name, LifecycleState::Absent).await?;
        self.store.remove(name).await?;
        info!(environment = %name, "Environment destroyed");
        result.messages.push("Infrastructure cleaned up".to_string());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Aggregated report: the targeted managers in teardown order, then the
    /// orchestrator itself. Side-effect free.
    async fn status(&self, name: &str, target: Option<&ServiceTarget>) -> OperationResult {
        let env = self.environment(name).await;
        let state = env
            .as_ref()
            .map(|env| env.lifecycle_state)
            .unwrap_or(LifecycleState::Absent);
        let mut result = OperationResult::ok(Action::Status, name, state);

        let kinds: Vec<ResourceKind> = match target {
            Some(target) => vec![target.kind()],
            None => ResourceKind::TEARDOWN_ORDER.to_vec(),
        };

        let resources = self.resources.resources(name);
        for kind in kinds {
            match resources.get(kind).status().await {
                Ok(status) => result.report.push(status),
                Err(e) => {
                    error!(environment = %name, component = %kind, "Status failed: {}", e);
                    result.fail(e);
                    return result;
                }
            }
        }

        result.report.push(Self::self_status(name, env.as_ref()));
        result
    }

    fn self_status(name: &str, env: Option<&Environment>) -> ComponentStatus {
        match env {
            Some(env) => {
                let last_check = env
                    .last_health_check
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                ComponentStatus::new(
                    "orchestrator",
                    env.lifecycle_state.as_str(),
                    format!("environment {} (last health check: {})", name, last_check),
                )
            }
            None => ComponentStatus::new(
                "orchestrator",
                LifecycleState::Absent.as_str(),
                format!("environment {} not provisioned", name),
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Health feedback
    // ------------------------------------------------------------------------

    /// Apply one monitoring snapshot: `running -> degraded` when any service is
    /// unhealthy, `degraded -> running` once all are healthy again. The record
    /// is left untouched while an operation, here or in another process, holds
    /// the environment lock.
    pub async fn record_health(&self, name: &str, snapshot: &HealthSnapshot) -> LifecycleState {
        let guard = match self.store.try_lock(name) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(environment = %name, "Cannot lock environment: {:#}", e);
                None
            }
        };
        if guard.is_none() {
            debug!(environment = %name, "Operation in progress, skipping health update");
            return self.lifecycle_state(name).await;
        }

        let Some(mut env) = self.environment(name).await else {
            return LifecycleState::Absent;
        };
        let checked_at = snapshot
            .values()
            .map(|record| record.last_check)
            .max()
            .unwrap_or_else(|| self.clock.now());
        let all_healthy = snapshot.values().all(|record| record.healthy);
        env.last_health_check = Some(checked_at);

        let next = match env.lifecycle_state {
            LifecycleState::Running if !all_healthy => Some(LifecycleState::Degraded),
            LifecycleState::Degraded if all_healthy => Some(LifecycleState::Running),
            _ => None,
        };
        if let Some(next) = next {
            match env.transition(next) {
                Ok(()) => info!(environment = %name, "Environment is now {}", next),
                Err(e) => warn!(environment = %name, "Health transition rejected: {}", e),
            }
        }
        if let Err(e) = self.store.save(&env).await {
            warn!(environment = %name, "Cannot save environment record: {:#}", e);
        }
        env.lifecycle_state
    }
}
