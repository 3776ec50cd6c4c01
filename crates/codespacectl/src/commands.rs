//! Command implementations. Each returns the process exit code.

use crate::confirm::StdinConfirm;
use crate::output;
use anyhow::{Context, Result};
use codespace_common::audit_log::RollbackLog;
use codespace_common::{CodespaceConfig, CodespaceError, TriggerKind, EXIT_FAILURE, EXIT_SUCCESS};
use codespaced::health::unhealthy_services;
use codespaced::orchestrator::{AutoConfirm, Confirm};
use codespaced::{Runtime, TriggerContext};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tracing::{info, warn};

fn confirmer(force: bool) -> Arc<dyn Confirm> {
    if force {
        Arc::new(AutoConfirm)
    } else {
        Arc::new(StdinConfirm)
    }
}

pub async fn infra(
    config: CodespaceConfig,
    action: &str,
    service: Option<&str>,
    force: bool,
    environment: Option<&str>,
    json: bool,
) -> Result<i32> {
    let runtime = Runtime::from_config(config, confirmer(force))?;
    let result = runtime
        .orchestrator
        .handle(action, service, force, environment)
        .await;

    if json {
        output::print_json(&result)?;
    } else {
        output::print_operation(&result);
    }
    Ok(result.exit_code())
}

pub async fn health(config: CodespaceConfig, service: Option<&str>, json: bool) -> Result<i32> {
    let runtime = Runtime::from_config(config, Arc::new(AutoConfirm))?;

    if let Some(name) = service {
        return match runtime.health.check_service_health(name).await {
            Ok(record) => {
                if json {
                    output::print_json(&record)?;
                } else {
                    output::print_health_record(&record);
                }
                Ok(if record.healthy { EXIT_SUCCESS } else { EXIT_FAILURE })
            }
            Err(e) => {
                eprintln!("{} {}", "Error:".bright_red(), e);
                Ok(EXIT_FAILURE)
            }
        };
    }

    let snapshot = runtime.health.check_all_services().await?;
    if json {
        output::print_json(&snapshot)?;
    } else {
        output::print_health(&snapshot);
    }
    let unhealthy = unhealthy_services(&snapshot);
    if unhealthy.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        if !json {
            println!(
                "{} {}",
                "Unhealthy:".bright_red(),
                unhealthy.join(", ")
            );
        }
        Ok(EXIT_FAILURE)
    }
}

pub async fn monitor(config: CodespaceConfig, cycles: Option<u64>) -> Result<i32> {
    // Rollback-driven stop/start must not block on a prompt mid-loop
    let runtime = Runtime::from_config(config, Arc::new(AutoConfirm))?;
    let monitor = runtime.monitor_loop();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let summary = monitor.run(cycles, shutdown).await?;
    println!(
        "{} cycles, {} unhealthy, {} rollbacks",
        summary.cycles, summary.unhealthy_cycles, summary.rollbacks
    );
    Ok(summary.last_exit_code)
}

pub async fn rollback(
    config: CodespaceConfig,
    role: Option<String>,
    reason: String,
    force: bool,
) -> Result<i32> {
    if !force && !StdinConfirm.confirm("Run every enabled rollback procedure?").await {
        println!("Rollback cancelled");
        return Ok(EXIT_SUCCESS);
    }

    let runtime = Runtime::from_config(config, Arc::new(AutoConfirm))?;
    let context = TriggerContext::Manual { role, reason };
    match runtime
        .controller
        .evaluate_and_execute(TriggerKind::Manual, context)
        .await
    {
        Ok(Some(execution)) => {
            output::print_execution(&execution);
            Ok(if execution.alert_severity() == codespace_common::Severity::Info {
                EXIT_SUCCESS
            } else {
                EXIT_FAILURE
            })
        }
        Ok(None) => Ok(EXIT_SUCCESS),
        Err(e @ CodespaceError::Unauthorized(_)) => {
            eprintln!("{} {}", "Denied:".bright_red(), e);
            Ok(EXIT_FAILURE)
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".bright_red(), e);
            Ok(EXIT_FAILURE)
        }
    }
}

pub fn history(config: &CodespaceConfig, limit: usize, json: bool) -> Result<i32> {
    let logging = &config.rollback.logging;
    let log = RollbackLog::new(logging.path.clone(), logging.retention_days);
    let entries = log.recent(limit);
    if json {
        output::print_json(&entries)?;
    } else {
        output::print_history(&entries);
    }
    Ok(EXIT_SUCCESS)
}

pub fn config(config: &CodespaceConfig, validate: bool) -> Result<i32> {
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "Invalid:".bright_red(), e);
        return Ok(EXIT_FAILURE);
    }
    if validate {
        info!("Configuration is valid");
        return Ok(EXIT_SUCCESS);
    }
    let rendered = config.to_toml_string().context("Cannot render configuration")?;
    print!("{}", rendered);
    Ok(EXIT_SUCCESS)
}
