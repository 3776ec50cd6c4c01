//! Codespace daemon library - exposes modules for the daemon, the CLI and tests.

pub mod clock;
pub mod health;
pub mod monitor;
pub mod notifier;
pub mod orchestrator;
pub mod process;
pub mod resources;
pub mod rollback;
pub mod runtime;

pub use monitor::{CycleReport, MonitorLoop, MonitorSummary};
pub use orchestrator::InfrastructureOrchestrator;
pub use rollback::{RollbackController, TriggerContext};
pub use runtime::Runtime;

/// Environment variable holding the tracing filter
pub const LOG_ENV_VAR: &str = "CODESPACE_LOG";

/// Install the fmt subscriber, filtered by `CODESPACE_LOG` (default `info`)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
