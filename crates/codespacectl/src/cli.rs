//! CLI - Command-line argument parsing
//!
//! Defines the CLI structure using clap. Execution lives in `commands`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Codespace infrastructure control
#[derive(Parser, Debug)]
#[command(name = "codespacectl")]
#[command(about = "Codespace - infrastructure lifecycle and health-triggered rollback", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file (overrides $CODESPACE_CONFIG and defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage infrastructure: status, start, stop, restart, cleanup
    Infra {
        /// Action to perform
        action: String,

        /// `docker`, `network`, `volume`, or `<class>:<name>`
        #[arg(long)]
        service: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        /// Environment to act on (defaults to infrastructure.environment)
        #[arg(long)]
        environment: Option<String>,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Check service health once
    Health {
        /// Check a single service
        #[arg(long)]
        service: Option<String>,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Run the monitoring loop in the foreground
    Monitor {
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Trigger a manual rollback
    Rollback {
        /// Role of the operator
        #[arg(long)]
        role: Option<String>,

        /// Why the rollback is needed
        #[arg(long, default_value = "manual rollback")]
        reason: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show recent rollback executions
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Show or validate the loaded configuration
    Config {
        /// Only validate; print nothing on success
        #[arg(long)]
        validate: bool,
    },
}
