//! Runtime wiring
//!
//! Builds every production collaborator from one configuration snapshot.

use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::health::{HealthMonitor, ServiceHealthMonitor};
use crate::monitor::MonitorLoop;
use crate::notifier::{AlertDispatcher, ChannelDispatcher};
use crate::orchestrator::{Confirm, EnvironmentStore, InfrastructureOrchestrator};
use crate::resources::DockerResources;
use crate::rollback::{build_domains, RollbackController};
use anyhow::{Context, Result};
use codespace_common::audit_log::RollbackLog;
use codespace_common::CodespaceConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Runtime {
    pub config: Arc<CodespaceConfig>,
    pub orchestrator: Arc<InfrastructureOrchestrator>,
    pub health: Arc<dyn HealthMonitor>,
    pub alerts: Arc<dyn AlertDispatcher>,
    pub controller: Arc<RollbackController>,
}

impl Runtime {
    pub fn from_config(config: CodespaceConfig, confirm: Arc<dyn Confirm>) -> Result<Self> {
        config.validate().context("Configuration rejected")?;
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let environment = config.infrastructure.environment.clone();

        let orchestrator = Arc::new(
            InfrastructureOrchestrator::new(
                Arc::new(DockerResources::new(&config.infrastructure)),
                confirm,
                clock.clone(),
                &environment,
            )
            .with_store(EnvironmentStore::on_disk(config.infrastructure.state_dir.clone())),
        );
        let health: Arc<dyn HealthMonitor> =
            Arc::new(ServiceHealthMonitor::new(&config.health_checks, clock.clone()));
        let alerts: Arc<dyn AlertDispatcher> =
            Arc::new(ChannelDispatcher::new(&config.rollback.notifications));

        let rollback = Arc::new(config.rollback.clone());
        let domains = build_domains(&rollback.procedures).context("Invalid rollback procedures")?;
        let mut controller = RollbackController::new(rollback.clone(), alerts.clone(), clock, sleeper)
            .with_domains(domains)
            .with_infrastructure(orchestrator.clone(), &environment);
        if rollback.logging.enabled {
            controller = controller.with_log(RollbackLog::new(
                rollback.logging.path.clone(),
                rollback.logging.retention_days,
            ));
        }

        info!(
            environment = %environment,
            services = config.health_checks.services.len(),
            "Runtime ready"
        );

        Ok(Self {
            config,
            orchestrator,
            health,
            alerts,
            controller: Arc::new(controller),
        })
    }

    pub fn environment(&self) -> &str {
        &self.config.infrastructure.environment
    }

    pub fn monitor_loop(&self) -> MonitorLoop {
        MonitorLoop::new(
            self.health.clone(),
            self.alerts.clone(),
            Duration::from_secs(self.config.health_checks.interval),
        )
        .with_orchestrator(self.orchestrator.clone(), self.environment())
        .with_controller(self.controller.clone())
    }
}
