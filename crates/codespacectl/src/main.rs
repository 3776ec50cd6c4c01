//! Codespace Control - CLI for infrastructure lifecycle, health and rollback

mod cli;
mod commands;
mod confirm;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use codespace_common::CodespaceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    codespaced::init_tracing();
    let cli = Cli::parse();
    let config = CodespaceConfig::load(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Infra {
            action,
            service,
            force,
            environment,
            json,
        } => {
            commands::infra(
                config,
                &action,
                service.as_deref(),
                force,
                environment.as_deref(),
                json,
            )
            .await?
        }
        Commands::Health { service, json } => {
            commands::health(config, service.as_deref(), json).await?
        }
        Commands::Monitor { cycles } => commands::monitor(config, cycles).await?,
        Commands::Rollback {
            role,
            reason,
            force,
        } => commands::rollback(config, role, reason, force).await?,
        Commands::History { limit, json } => commands::history(&config, limit, json)?,
        Commands::Config { validate } => commands::config(&config, validate)?,
    };

    std::process::exit(code);
}
