//! Resource managers
//!
//! One adapter per resource class (containers, network, volumes). The
//! orchestrator only sees this trait; it never caches adapter state.
//!
//! Each environment owns its own [`ResourceSet`], handed out by a
//! [`ResourceProvider`]. Production code uses the docker CLI adapters in
//! [`docker`]. Tests use [`FakeResources`], whose managers record every call
//! into a shared [`CallLog`].

pub mod docker;
pub mod fake;

pub use docker::{ContainerManager, NetworkManager, VolumeManager};
pub use fake::{CallLog, FakeResourceManager, FakeResources};

use anyhow::Result;
use async_trait::async_trait;
use codespace_common::config::InfrastructureConfig;
use codespace_common::{ComponentStatus, ResourceKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Uniform lifecycle contract for one resource class
///
/// Every mutating call must be idempotent: starting something already running
/// is not an error.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn start(&self) -> Result<()>;

    async fn start_service(&self, name: &str) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn stop_service(&self, name: &str) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        self.stop_service(name).await?;
        self.start_service(name).await
    }

    async fn status(&self) -> Result<ComponentStatus>;

    async fn cleanup(&self) -> Result<()>;
}

/// The three managers the orchestrator aggregates
#[derive(Clone)]
pub struct ResourceSet {
    docker: Arc<dyn ResourceManager>,
    network: Arc<dyn ResourceManager>,
    volume: Arc<dyn ResourceManager>,
}

impl ResourceSet {
    pub fn new(
        docker: Arc<dyn ResourceManager>,
        network: Arc<dyn ResourceManager>,
        volume: Arc<dyn ResourceManager>,
    ) -> Self {
        Self {
            docker,
            network,
            volume,
        }
    }

    /// Docker CLI backed managers
    pub fn from_config(config: &InfrastructureConfig) -> Self {
        Self::new(
            Arc::new(ContainerManager::new(config)),
            Arc::new(NetworkManager::new(config)),
            Arc::new(VolumeManager::new(config)),
        )
    }

    pub fn get(&self, kind: ResourceKind) -> &Arc<dyn ResourceManager> {
        match kind {
            ResourceKind::Docker => &self.docker,
            ResourceKind::Network => &self.network,
            ResourceKind::Volume => &self.volume,
        }
    }
}

/// Hands out the managers owned by one environment
pub trait ResourceProvider: Send + Sync {
    fn resources(&self, environment: &str) -> ResourceSet;
}

/// Docker CLI managers, one set per environment, with names derived by
/// [`InfrastructureConfig::for_environment`]
pub struct DockerResources {
    config: InfrastructureConfig,
    sets: Mutex<HashMap<String, ResourceSet>>,
}

impl DockerResources {
    pub fn new(config: &InfrastructureConfig) -> Self {
        Self {
            config: config.clone(),
            sets: Mutex::new(HashMap::new()),
        }
    }
}

impl ResourceProvider for DockerResources {
    fn resources(&self, environment: &str) -> ResourceSet {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(environment.to_string())
            .or_insert_with(|| ResourceSet::from_config(&self.config.for_environment(environment)))
            .clone()
    }
}
