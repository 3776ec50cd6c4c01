//! Monitoring loop
//!
//! Polls the health monitor on a fixed interval and forwards each snapshot to
//! the orchestrator (degraded/running), the alert dispatcher (one summary per
//! cycle) and the rollback controller. An unhealthy cycle fails with exit code
//! 1 but the loop keeps going; only a monitoring failure stops it.

use crate::health::{unhealthy_services, HealthMonitor, HealthSnapshot};
use crate::notifier::{unhealthy_services_message, AlertDispatcher};
use crate::orchestrator::InfrastructureOrchestrator;
use crate::rollback::{RollbackController, TriggerContext};
use anyhow::Result;
use codespace_common::{
    LifecycleState, RollbackExecution, Severity, TriggerKind, EXIT_FAILURE, EXIT_SUCCESS,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const UNHEALTHY_ALERT_TITLE: &str = "Unhealthy services detected";

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub records: Arc<HealthSnapshot>,
    pub unhealthy: Vec<String>,
    /// Environment state after the snapshot was applied
    pub lifecycle_state: Option<LifecycleState>,
    pub rollback: Option<RollbackExecution>,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub cycles: u64,
    pub unhealthy_cycles: u64,
    pub rollbacks: u64,
    pub last_exit_code: i32,
}

pub struct MonitorLoop {
    monitor: Arc<dyn HealthMonitor>,
    alerts: Arc<dyn AlertDispatcher>,
    interval: Duration,
    orchestrator: Option<(Arc<InfrastructureOrchestrator>, String)>,
    controller: Option<Arc<RollbackController>>,
}

impl MonitorLoop {
    pub fn new(monitor: Arc<dyn HealthMonitor>, alerts: Arc<dyn AlertDispatcher>, interval: Duration) -> Self {
        Self {
            monitor,
            alerts,
            interval,
            orchestrator: None,
            controller: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<InfrastructureOrchestrator>, environment: &str) -> Self {
        self.orchestrator = Some((orchestrator, environment.to_string()));
        self
    }

    pub fn with_controller(mut self, controller: Arc<RollbackController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// One poll; `Err` only when the health monitor itself failed
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let records = Arc::new(self.monitor.check_all_services().await?);
        let unhealthy = unhealthy_services(&records);

        let lifecycle_state = match &self.orchestrator {
            Some((orchestrator, environment)) => {
                Some(orchestrator.record_health(environment, &records).await)
            }
            None => None,
        };

        if unhealthy.is_empty() {
            debug!("All {} services healthy", records.len());
        } else {
            warn!("{} of {} services unhealthy", unhealthy.len(), records.len());
            self.alerts
                .send_alert(
                    UNHEALTHY_ALERT_TITLE,
                    &unhealthy_services_message(&unhealthy),
                    Severity::Warning,
                )
                .await;
        }

        let rollback = match &self.controller {
            Some(controller) if controller.accepts(TriggerKind::HealthCheckFailure) => {
                match controller
                    .evaluate_and_execute(
                        TriggerKind::HealthCheckFailure,
                        TriggerContext::Health(records.clone()),
                    )
                    .await
                {
                    Ok(execution) => execution,
                    Err(e) => {
                        warn!("Rollback evaluation failed: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        let exit_code = if unhealthy.is_empty() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        };

        Ok(CycleReport {
            records,
            unhealthy,
            lifecycle_state,
            rollback,
            exit_code,
        })
    }

    /// Run until `shutdown` resolves or `max_cycles` cycles have completed
    pub async fn run<F>(&self, max_cycles: Option<u64>, shutdown: F) -> Result<MonitorSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = MonitorSummary::default();

        info!("Monitoring every {}s", self.interval.as_secs());
        loop {
            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping monitor");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await?;
                    summary.cycles += 1;
                    if report.exit_code != EXIT_SUCCESS {
                        summary.unhealthy_cycles += 1;
                    }
                    if report.rollback.is_some() {
                        summary.rollbacks += 1;
                    }
                    summary.last_exit_code = report.exit_code;
                }
            }
        }

        Ok(summary)
    }
}
