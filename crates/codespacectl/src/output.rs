//! Output formatting - plain ASCII, colour for status words only

use codespace_common::audit_log::AuditEntry;
use codespace_common::{ComponentStatus, HealthRecord, RollbackExecution};
use codespaced::health::HealthSnapshot;
use codespaced::orchestrator::OperationResult;
use owo_colors::OwoColorize;

fn status_word(status: &str) -> String {
    match status {
        "running" | "healthy" | "succeeded" | "success" => status.bright_green().to_string(),
        "partial" | "degraded" | "starting" | "stopping" | "cleaning" => {
            status.yellow().to_string()
        }
        _ => status.bright_red().to_string(),
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_operation(result: &OperationResult) {
    if !result.report.is_empty() {
        print_report(&result.report);
    }
    for message in &result.messages {
        if message.starts_with("Error:") || !result.success {
            eprintln!("{}", message.bright_red());
        } else {
            println!("{}", message);
        }
    }
    if result.action.is_some() && !result.declined {
        println!(
            "Environment {}: {}",
            result.environment.bold(),
            status_word(result.lifecycle_state.as_str())
        );
    }
}

fn print_report(report: &[ComponentStatus]) {
    let width = report.iter().map(|s| s.component.len()).max().unwrap_or(0);
    for status in report {
        println!(
            "  {:<width$}  {}  {}",
            status.component,
            status_word(&status.status),
            status.details.dimmed(),
            width = width
        );
    }
}

pub fn print_health(snapshot: &HealthSnapshot) {
    if snapshot.is_empty() {
        println!("No services configured");
        return;
    }
    for record in snapshot.values() {
        print_health_record(record);
    }
}

pub fn print_health_record(record: &HealthRecord) {
    let state = if record.healthy { "healthy" } else { "unhealthy" };
    let latency = record
        .response_time_ms
        .map(|ms| format!(" ({}ms)", ms))
        .unwrap_or_default();
    println!(
        "  {}  {}{}  {}",
        record.service.bold(),
        status_word(state),
        latency,
        record.details.dimmed()
    );
}

pub fn print_execution(execution: &RollbackExecution) {
    println!(
        "Rollback {} [{}] triggered by {}",
        execution.id,
        status_word(execution.status_str()),
        execution.trigger_kind
    );
    for record in &execution.procedures_run {
        let outcome = if record.outcome.is_success() {
            record.outcome.to_string().bright_green().to_string()
        } else {
            record.outcome.to_string().bright_red().to_string()
        };
        println!("  {:<14} {}", record.domain.to_string(), outcome);
        if let Some(backup) = &record.backup {
            println!("  {:<14} backup: {}", "", backup.dimmed());
        }
    }
    if let Some(reason) = &execution.abort_reason {
        println!("  aborted: {}", reason.bright_red());
    }
}

pub fn print_history(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No rollback history");
        return;
    }
    for entry in entries {
        let when = entry.timestamp.format("%Y-%m-%d %H:%M:%S");
        match &entry.execution {
            Some(execution) => println!(
                "{}  {:<24} {}  {} procedures",
                when,
                entry.trigger.to_string(),
                status_word(execution.status_str()),
                execution.procedures_run.len()
            ),
            None => println!(
                "{}  {:<24} {}",
                when,
                entry.trigger.to_string(),
                "rejected".bright_red()
            ),
        }
    }
}
