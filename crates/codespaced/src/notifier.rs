//! Alert dispatch
//!
//! Fire-and-forget: `send_alert` never fails. Channel errors are logged at
//! `warn` and the remaining channels still run. Each delivery is bounded by
//! [`DELIVERY_TIMEOUT`] so a hung channel cannot stall the monitoring loop.
//!
//! Channels:
//! - log (structured tracing event)
//! - desktop (notify-send)
//! - webhook (JSON POST)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use codespace_common::config::{ChannelConfig, NotificationsConfig, TemplatesConfig};
use codespace_common::{RollbackExecution, Severity};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Upper bound for one channel delivery
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send_alert(&self, title: &str, message: &str, severity: Severity);
}

/// Summary line for one monitoring cycle
pub fn unhealthy_services_message(names: &[String]) -> String {
    format!("The following services are unhealthy: {}", names.join(", "))
}

/// Fill `{trigger}`, `{status}`, `{procedures}`, `{started_at}`, `{finished_at}`
///
/// Single pass over the template: substituted values are never rescanned and
/// unknown placeholders are kept verbatim.
pub fn render_template(template: &str, execution: &RollbackExecution) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let substituted = tail
            .find('}')
            .and_then(|close| placeholder(&tail[1..close], execution).map(|value| (close, value)));
        match substituted {
            Some((close, value)) => {
                out.push_str(&value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholder(name: &str, execution: &RollbackExecution) -> Option<String> {
    let value = match name {
        "trigger" => execution.trigger_kind.as_str().to_string(),
        "status" => execution.status_str().to_string(),
        "procedures" => execution.procedure_summary(),
        "started_at" => execution.started_at.to_rfc3339(),
        "finished_at" => execution
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        _ => return None,
    };
    Some(value)
}

/// Title and body for the alert concluding a rollback execution
pub fn rollback_alert(templates: &TemplatesConfig, execution: &RollbackExecution) -> (String, String) {
    let title = if execution.alert_severity() == Severity::Critical {
        &templates.failure_title
    } else {
        &templates.success_title
    };
    let mut body = render_template(&templates.body, execution);
    if let Some(reason) = &execution.abort_reason {
        body.push_str(&format!("\nAborted: {}", reason));
    }
    (render_template(title, execution), body)
}

// ============================================================================
// Configured channels
// ============================================================================

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    severity: Severity,
    recipients: &'a [String],
}

pub struct ChannelDispatcher {
    channels: Vec<ChannelConfig>,
    recipients: Vec<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ChannelDispatcher {
    pub fn new(config: &NotificationsConfig) -> Self {
        Self {
            channels: config.channels.clone(),
            recipients: config.recipients.clone(),
            client: reqwest::Client::new(),
            timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Channels whose `min_severity` admits `severity`
    fn channels_for(&self, severity: Severity) -> impl Iterator<Item = &ChannelConfig> {
        self.channels
            .iter()
            .filter(move |channel| severity >= channel.min_severity())
    }

    async fn deliver(&self, channel: &ChannelConfig, title: &str, message: &str, severity: Severity) -> Result<()> {
        match channel {
            ChannelConfig::Log { .. } => {
                match severity {
                    Severity::Critical => error!(severity = %severity, title, "{}", message),
                    Severity::Warning => warn!(severity = %severity, title, "{}", message),
                    Severity::Info => info!(severity = %severity, title, "{}", message),
                }
                Ok(())
            }
            ChannelConfig::Desktop { .. } => send_desktop(title, message, severity).await,
            ChannelConfig::Webhook { url, .. } => {
                let payload = WebhookPayload {
                    title,
                    message,
                    severity,
                    recipients: &self.recipients,
                };
                let response = self
                    .client
                    .post(url)
                    .timeout(self.timeout)
                    .json(&payload)
                    .send()
                    .await
                    .with_context(|| format!("POST {} failed", url))?;
                if !response.status().is_success() {
                    bail!("POST {} returned {}", url, response.status());
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AlertDispatcher for ChannelDispatcher {
    async fn send_alert(&self, title: &str, message: &str, severity: Severity) {
        for channel in self.channels_for(severity) {
            let delivery = self.deliver(channel, title, message, severity);
            match tokio::time::timeout(self.timeout, delivery).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(channel = channel.name(), "Alert delivery failed: {:#}", e),
                Err(_) => warn!(
                    channel = channel.name(),
                    "Alert delivery timed out after {:?}", self.timeout
                ),
            }
        }
    }
}

async fn send_desktop(title: &str, message: &str, severity: Severity) -> Result<()> {
    let urgency = match severity {
        Severity::Info => "low",
        Severity::Warning => "normal",
        Severity::Critical => "critical",
    };

    let output = Command::new("notify-send")
        .args([
            "--urgency",
            urgency,
            "--app-name",
            "Codespace",
            title,
            message,
        ])
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run notify-send")?;

    if !output.status.success() {
        bail!(
            "notify-send exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

// ============================================================================
// Recording dispatcher for tests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAlert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Default)]
pub struct FakeAlertDispatcher {
    sent: Mutex<Vec<SentAlert>>,
}

impl FakeAlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AlertDispatcher for FakeAlertDispatcher {
    async fn send_alert(&self, title: &str, message: &str, severity: Severity) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentAlert {
                title: title.to_string(),
                message: message.to_string(),
                severity,
            });
    }
}
