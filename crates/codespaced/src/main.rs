//! Codespace daemon - runs the health monitoring loop

use anyhow::Result;
use codespace_common::CodespaceConfig;
use codespaced::orchestrator::AutoConfirm;
use codespaced::Runtime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    codespaced::init_tracing();
    info!("Codespace daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config = CodespaceConfig::load(explicit.as_deref())?;

    // No operator at a terminal; rollback-driven stop/start are always forced
    let runtime = Runtime::from_config(config, Arc::new(AutoConfirm))?;
    let monitor = runtime.monitor_loop();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let summary = monitor.run(None, shutdown).await?;
    info!(
        "Codespace daemon stopped after {} cycles ({} unhealthy, {} rollbacks)",
        summary.cycles, summary.unhealthy_cycles, summary.rollbacks
    );
    Ok(())
}
