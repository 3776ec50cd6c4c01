//! In-memory resource manager for tests
//!
//! Records every call as `<kind>.<op>` or `<kind>.<op>:<name>` into a
//! [`CallLog`] that can be shared across the three managers, so tests can
//! assert both per-manager counts and cross-manager ordering.

use super::{ResourceManager, ResourceProvider, ResourceSet};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use codespace_common::{ComponentStatus, ResourceKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Ordered record of manager calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of entries starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[derive(Debug, Default)]
struct FakeState {
    running: bool,
    services: BTreeSet<String>,
    transitions: usize,
}

/// Holds one call open until the test releases it
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Resolves once the gated call has been recorded
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

pub struct FakeResourceManager {
    kind: ResourceKind,
    calls: CallLog,
    failures: Mutex<HashMap<String, String>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    state: Mutex<FakeState>,
}

impl FakeResourceManager {
    pub fn new(kind: ResourceKind, calls: CallLog) -> Self {
        Self {
            kind,
            calls,
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Make `op` (e.g. `start`, `status`, `start_service`) fail with `message`
    pub fn fail_on(&self, op: &str, message: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.to_string(), message.to_string());
    }

    /// Block the next `op` call after it is recorded, until released
    pub fn gate(&self, op: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.to_string(), gate.clone());
        gate
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn running_services(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .clone()
    }

    /// Calls that actually changed state; repeated starts do not count
    pub fn transitions(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).transitions
    }

    async fn enter(&self, op: &str, name: Option<&str>) -> Result<()> {
        let entry = match name {
            Some(name) => format!("{}.{}:{}", self.kind, op, name),
            None => format!("{}.{}", self.kind, op),
        };
        self.calls.record(entry);

        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(op);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get(op) {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn set_running(&self, running: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running != running {
            state.running = running;
            state.transitions += 1;
        }
        if !running {
            state.services.clear();
        }
    }

    fn set_service(&self, name: &str, running: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let changed = if running {
            state.services.insert(name.to_string())
        } else {
            state.services.remove(name)
        };
        if changed {
            state.transitions += 1;
        }
    }
}

#[async_trait]
impl ResourceManager for FakeResourceManager {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn start(&self) -> Result<()> {
        self.enter("start", None).await?;
        self.set_running(true);
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.enter("start_service", Some(name)).await?;
        self.set_service(name, true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.enter("stop", None).await?;
        self.set_running(false);
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.enter("stop_service", Some(name)).await?;
        self.set_service(name, false);
        Ok(())
    }

    async fn status(&self) -> Result<ComponentStatus> {
        self.enter("status", None).await?;
        let running = self.is_running();
        Ok(ComponentStatus::new(
            self.kind.as_str(),
            if running { "running" } else { "stopped" },
            "fake",
        ))
    }

    async fn cleanup(&self) -> Result<()> {
        self.enter("cleanup", None).await?;
        self.set_running(false);
        Ok(())
    }
}

/// One trio of fake managers per environment, all writing to one [`CallLog`]
#[derive(Default)]
pub struct FakeResources {
    calls: CallLog,
    managers: Mutex<HashMap<(String, ResourceKind), Arc<FakeResourceManager>>>,
}

impl FakeResources {
    pub fn new(calls: CallLog) -> Self {
        Self {
            calls,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// The manager `environment` uses for `kind`, created on first use
    pub fn manager(&self, environment: &str, kind: ResourceKind) -> Arc<FakeResourceManager> {
        let mut managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
        managers
            .entry((environment.to_string(), kind))
            .or_insert_with(|| Arc::new(FakeResourceManager::new(kind, self.calls.clone())))
            .clone()
    }
}

impl ResourceProvider for FakeResources {
    fn resources(&self, environment: &str) -> ResourceSet {
        ResourceSet::new(
            self.manager(environment, ResourceKind::Docker),
            self.manager(environment, ResourceKind::Network),
            self.manager(environment, ResourceKind::Volume),
        )
    }
}
