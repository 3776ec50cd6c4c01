//! Health monitoring of dependent services
//!
//! Independent of orchestration: a monitor only produces [`HealthRecord`]s.
//! Unreachable services are unhealthy records, not errors; only a failure of
//! the monitoring machinery itself surfaces as `Err`.

pub mod probes;

pub use probes::{run_probe, ProbeOutcome};

use crate::clock::Clock;
use async_trait::async_trait;
use codespace_common::config::{HealthChecksConfig, ServiceCheckConfig};
use codespace_common::{CodespaceError, CodespaceResult, HealthRecord};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One cycle's records keyed by service name
pub type HealthSnapshot = BTreeMap<String, HealthRecord>;

#[async_trait]
pub trait HealthMonitor: Send + Sync {
    /// Registered service names
    fn services(&self) -> Vec<String>;

    async fn check_all_services(&self) -> CodespaceResult<HealthSnapshot>;

    /// Unregistered names are a validation error
    async fn check_service_health(&self, name: &str) -> CodespaceResult<HealthRecord>;
}

/// Names of unhealthy services in a snapshot, in name order
pub fn unhealthy_services(snapshot: &HealthSnapshot) -> Vec<String> {
    snapshot
        .values()
        .filter(|record| !record.healthy)
        .map(|record| record.service.clone())
        .collect()
}

// ============================================================================
// Probe-backed monitor
// ============================================================================

pub struct ServiceHealthMonitor {
    services: Vec<ServiceCheckConfig>,
    timeout: Duration,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl ServiceHealthMonitor {
    pub fn new(config: &HealthChecksConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            services: config.services.clone(),
            timeout: Duration::from_secs(config.timeout),
            client: reqwest::Client::new(),
            clock,
        }
    }

    fn record(&self, service: &str, outcome: ProbeOutcome) -> HealthRecord {
        let now = self.clock.now();
        let record = if outcome.healthy {
            HealthRecord::healthy(service, now, outcome.details)
        } else {
            HealthRecord::unhealthy(service, now, outcome.details)
        };
        record.with_response_time(outcome.duration_ms)
    }
}

#[async_trait]
impl HealthMonitor for ServiceHealthMonitor {
    fn services(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    async fn check_all_services(&self) -> CodespaceResult<HealthSnapshot> {
        let mut tasks = JoinSet::new();
        for service in &self.services {
            let name = service.name.clone();
            let probe = service.probe.clone();
            let timeout = self.timeout;
            let client = self.client.clone();
            tasks.spawn(async move {
                let outcome = run_probe(&probe, timeout, &client).await;
                (name, outcome)
            });
        }

        let mut snapshot = HealthSnapshot::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = joined
                .map_err(|e| CodespaceError::Monitoring(format!("probe task failed: {}", e)))?;
            if !outcome.healthy {
                warn!(service = %name, "Unhealthy: {}", outcome.details);
            }
            let record = self.record(&name, outcome);
            snapshot.insert(name, record);
        }

        debug!("Checked {} services", snapshot.len());
        Ok(snapshot)
    }

    async fn check_service_health(&self, name: &str) -> CodespaceResult<HealthRecord> {
        let service = self
            .services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CodespaceError::UnknownService(name.to_string()))?;
        let outcome = run_probe(&service.probe, self.timeout, &self.client).await;
        Ok(self.record(name, outcome))
    }
}

// ============================================================================
// Fake monitor for tests
// ============================================================================

/// Scripted monitor
///
/// Each check consumes the next queued snapshot of health flags; once the
/// queue is empty the steady state set with [`FakeHealthMonitor::set`] is
/// reported.
pub struct FakeHealthMonitor {
    clock: Arc<dyn Clock>,
    steady: Mutex<BTreeMap<String, (bool, String)>>,
    script: Mutex<VecDeque<CodespaceResult<Vec<(String, bool)>>>>,
    checks: Mutex<usize>,
}

impl FakeHealthMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            steady: Mutex::new(BTreeMap::new()),
            script: Mutex::new(VecDeque::new()),
            checks: Mutex::new(0),
        }
    }

    pub fn set(&self, service: &str, healthy: bool, details: &str) {
        self.steady
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), (healthy, details.to_string()));
    }

    /// Queue one cycle's results
    pub fn push_cycle(&self, cycle: &[(&str, bool)]) {
        let cycle = cycle
            .iter()
            .map(|(name, healthy)| (name.to_string(), *healthy))
            .collect();
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(cycle));
    }

    /// Queue a total monitoring failure
    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(CodespaceError::Monitoring(message.to_string())));
    }

    pub fn check_count(&self) -> usize {
        *self.checks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn make_record(&self, service: &str, healthy: bool, details: &str) -> HealthRecord {
        let now = self.clock.now();
        if healthy {
            HealthRecord::healthy(service, now, details)
        } else {
            HealthRecord::unhealthy(service, now, details)
        }
    }

    fn steady_snapshot(&self) -> HealthSnapshot {
        self.steady
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, (healthy, details))| {
                (name.clone(), self.make_record(name, *healthy, details))
            })
            .collect()
    }
}

#[async_trait]
impl HealthMonitor for FakeHealthMonitor {
    fn services(&self) -> Vec<String> {
        self.steady
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    async fn check_all_services(&self) -> CodespaceResult<HealthSnapshot> {
        *self.checks.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(cycle)) => Ok(cycle
                .into_iter()
                .map(|(name, healthy)| {
                    let details = if healthy { "ok" } else { "unreachable" };
                    let record = self.make_record(&name, healthy, details);
                    (name, record)
                })
                .collect()),
            Some(Err(e)) => Err(e),
            None => Ok(self.steady_snapshot()),
        }
    }

    async fn check_service_health(&self, name: &str) -> CodespaceResult<HealthRecord> {
        self.steady_snapshot()
            .remove(name)
            .ok_or_else(|| CodespaceError::UnknownService(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use codespace_common::config::ProbeSpec;

    #[tokio::test]
    async fn test_unreachable_service_is_record_not_error() {
        let config = HealthChecksConfig {
            interval: 30,
            timeout: 1,
            services: vec![ServiceCheckConfig {
                name: "ghost".to_string(),
                probe: ProbeSpec::Command {
                    program: "definitely-not-a-real-binary-xyz".to_string(),
                    args: vec![],
                },
            }],
        };
        let monitor = ServiceHealthMonitor::new(&config, Arc::new(SystemClock));
        let snapshot = monitor.check_all_services().await.unwrap();
        assert!(!snapshot["ghost"].healthy);
        assert_eq!(unhealthy_services(&snapshot), vec!["ghost"]);
    }

    #[tokio::test]
    async fn test_unknown_service_is_validation_error() {
        let monitor = ServiceHealthMonitor::new(&HealthChecksConfig::default(), Arc::new(SystemClock));
        let err = monitor.check_service_health("nope").await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_fake_script_then_steady() {
        let monitor = FakeHealthMonitor::new(Arc::new(SystemClock));
        monitor.set("cache", true, "ok");
        monitor.push_cycle(&[("database", false)]);
        monitor.push_failure("probe runtime gone");

        let first = monitor.check_all_services().await.unwrap();
        assert!(!first["database"].healthy);
        assert!(monitor.check_all_services().await.is_err());
        let third = monitor.check_all_services().await.unwrap();
        assert!(third["cache"].healthy);
        assert_eq!(monitor.check_count(), 3);
    }
}
