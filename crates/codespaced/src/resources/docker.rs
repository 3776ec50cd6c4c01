//! Docker CLI backed resource managers
//!
//! Containers are driven through `docker compose`, the bridge network and the
//! named volumes through `docker network` / `docker volume`. All calls are
//! idempotent: existing networks and volumes are left alone on start, missing
//! ones are ignored on removal.

use super::ResourceManager;
use crate::process;
use anyhow::Result;
use async_trait::async_trait;
use codespace_common::config::InfrastructureConfig;
use codespace_common::{ComponentStatus, ResourceKind};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn is_missing(error: &anyhow::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("no such") || text.contains("not found")
}

// ============================================================================
// Containers
// ============================================================================

/// Containers of the Codespace compose project
pub struct ContainerManager {
    binary: String,
    compose_file: PathBuf,
    project: String,
    timeout: Duration,
}

impl ContainerManager {
    pub fn new(config: &InfrastructureConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            compose_file: config.compose_file.clone(),
            project: config.project_name.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn compose(&self, extra: &[&str]) -> Result<String> {
        let mut command = args(&["compose", "-f"]);
        command.push(self.compose_file.display().to_string());
        command.push("-p".to_string());
        command.push(self.project.clone());
        command.extend(args(extra));
        process::run(&self.binary, &command, self.timeout).await
    }
}

#[async_trait]
impl ResourceManager for ContainerManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Docker
    }

    async fn start(&self) -> Result<()> {
        info!("Starting containers for project {}", self.project);
        self.compose(&["up", "-d", "--remove-orphans"]).await?;
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        info!("Starting container service {}", name);
        self.compose(&["up", "-d", name]).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping containers for project {}", self.project);
        self.compose(&["stop"]).await?;
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        info!("Stopping container service {}", name);
        self.compose(&["stop", name]).await?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.compose(&["restart"]).await?;
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        self.compose(&["restart", name]).await?;
        Ok(())
    }

    async fn status(&self) -> Result<ComponentStatus> {
        let output = self
            .compose(&["ps", "--format", "{{.Service}}:{{.State}}"])
            .await?;
        let services: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let running = services
            .iter()
            .filter(|line| line.ends_with(":running"))
            .count();

        let status = if services.is_empty() {
            "stopped"
        } else if running == services.len() {
            "running"
        } else {
            "partial"
        };

        Ok(ComponentStatus::new(
            "docker",
            status,
            format!("{}/{} containers running", running, services.len()),
        ))
    }

    async fn cleanup(&self) -> Result<()> {
        info!("Removing containers for project {}", self.project);
        self.compose(&["down", "--remove-orphans"]).await?;
        Ok(())
    }
}

// ============================================================================
// Network
// ============================================================================

/// Bridge network shared by the containers
pub struct NetworkManager {
    binary: String,
    network: String,
    timeout: Duration,
}

impl NetworkManager {
    pub fn new(config: &InfrastructureConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            network: config.network_name.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let output = process::capture(
            &self.binary,
            &args(&["network", "inspect", name]),
            self.timeout,
        )
        .await?;
        Ok(output.success())
    }

    async fn create(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            debug!("Network {} already exists", name);
            return Ok(());
        }
        info!("Creating network {}", name);
        process::run(
            &self.binary,
            &args(&["network", "create", "--driver", "bridge", name]),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        info!("Removing network {}", name);
        match process::run(&self.binary, &args(&["network", "rm", name]), self.timeout).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ResourceManager for NetworkManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    async fn start(&self) -> Result<()> {
        self.create(&self.network).await
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.create(name).await
    }

    /// Stopping the infrastructure tears the bridge down; there is no separate
    /// cleanup step for networks.
    async fn stop(&self) -> Result<()> {
        self.remove(&self.network).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.remove(name).await
    }

    async fn status(&self) -> Result<ComponentStatus> {
        let present = self.exists(&self.network).await?;
        Ok(ComponentStatus::new(
            "network",
            if present { "running" } else { "stopped" },
            format!("bridge {}", self.network),
        ))
    }

    async fn cleanup(&self) -> Result<()> {
        self.remove(&self.network).await
    }
}

// ============================================================================
// Volumes
// ============================================================================

/// Named volumes holding Codespace data
pub struct VolumeManager {
    binary: String,
    volumes: Vec<String>,
    timeout: Duration,
}

impl VolumeManager {
    pub fn new(config: &InfrastructureConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            volumes: config.volumes.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn create(&self, name: &str) -> Result<()> {
        // `docker volume create` is idempotent for an existing name
        process::run(&self.binary, &args(&["volume", "create", name]), self.timeout).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match process::run(&self.binary, &args(&["volume", "rm", name]), self.timeout).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ResourceManager for VolumeManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    async fn start(&self) -> Result<()> {
        for volume in &self.volumes {
            info!("Ensuring volume {}", volume);
            self.create(volume).await?;
        }
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.create(name).await
    }

    /// Volumes persist across stop; only cleanup removes data.
    async fn stop(&self) -> Result<()> {
        debug!("Volumes are kept on stop");
        Ok(())
    }

    async fn stop_service(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<ComponentStatus> {
        let mut present = 0;
        for volume in &self.volumes {
            let output = process::capture(
                &self.binary,
                &args(&["volume", "inspect", volume]),
                self.timeout,
            )
            .await?;
            if output.success() {
                present += 1;
            }
        }

        let status = if present == self.volumes.len() {
            "running"
        } else if present == 0 {
            "stopped"
        } else {
            "partial"
        };
        Ok(ComponentStatus::new(
            "volume",
            status,
            format!("{}/{} volumes present", present, self.volumes.len()),
        ))
    }

    async fn cleanup(&self) -> Result<()> {
        for volume in &self.volumes {
            info!("Removing volume {}", volume);
            self.remove(volume).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InfrastructureConfig {
        InfrastructureConfig {
            docker_binary: "definitely-not-docker-xyz".to_string(),
            ..InfrastructureConfig::default()
        }
    }

    #[test]
    fn test_kinds() {
        let config = config();
        assert_eq!(ContainerManager::new(&config).kind(), ResourceKind::Docker);
        assert_eq!(NetworkManager::new(&config).kind(), ResourceKind::Network);
        assert_eq!(VolumeManager::new(&config).kind(), ResourceKind::Volume);
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_error() {
        let manager = ContainerManager::new(&config());
        let err = manager.start().await.unwrap_err();
        assert!(err.to_string().contains("definitely-not-docker-xyz"));
    }

    #[tokio::test]
    async fn test_volume_stop_is_noop() {
        let manager = VolumeManager::new(&config());
        assert!(manager.stop().await.is_ok());
    }

    #[test]
    fn test_missing_detection() {
        assert!(is_missing(&anyhow::anyhow!("Error: No such volume: x")));
        assert!(!is_missing(&anyhow::anyhow!("permission denied")));
    }
}
