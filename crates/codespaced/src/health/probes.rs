//! Service probes
//!
//! A probe never fails: unreachable services become an unhealthy outcome with
//! a descriptive message.

use crate::process;
use codespace_common::config::ProbeSpec;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub details: String,
    pub duration_ms: u64,
}

impl ProbeOutcome {
    fn new(healthy: bool, details: impl Into<String>, started: Instant) -> Self {
        Self {
            healthy,
            details: details.into(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Run one probe bounded by `timeout`
pub async fn run_probe(
    spec: &ProbeSpec,
    timeout: Duration,
    client: &reqwest::Client,
) -> ProbeOutcome {
    let started = Instant::now();
    let outcome = match spec {
        ProbeSpec::Tcp { address } => tcp_probe(address, timeout, started).await,
        ProbeSpec::Http { url, expect_status } => {
            http_probe(client, url, *expect_status, timeout, started).await
        }
        ProbeSpec::Command { program, args } => {
            command_probe(program, args, timeout, started).await
        }
    };
    debug!(
        "Probe finished: healthy={} in {}ms ({})",
        outcome.healthy, outcome.duration_ms, outcome.details
    );
    outcome
}

async fn tcp_probe(address: &str, timeout: Duration, started: Instant) -> ProbeOutcome {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeOutcome::new(true, format!("Accepting connections on {}", address), started),
        Ok(Err(e)) => ProbeOutcome::new(false, format!("Cannot connect to {}: {}", address, e), started),
        Err(_) => ProbeOutcome::new(
            false,
            format!("Connection to {} timed out after {}s", address, timeout.as_secs()),
            started,
        ),
    }
}

async fn http_probe(
    client: &reqwest::Client,
    url: &str,
    expect_status: Option<u16>,
    timeout: Duration,
    started: Instant,
) -> ProbeOutcome {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return ProbeOutcome::new(
                false,
                format!("GET {} timed out after {}s", url, timeout.as_secs()),
                started,
            )
        }
        Err(e) => return ProbeOutcome::new(false, format!("GET {} failed: {}", url, e), started),
    };

    let status = response.status();
    let healthy = match expect_status {
        Some(expected) => status.as_u16() == expected,
        None => status.is_success(),
    };
    ProbeOutcome::new(healthy, format!("GET {} returned {}", url, status.as_u16()), started)
}

async fn command_probe(
    program: &str,
    args: &[String],
    timeout: Duration,
    started: Instant,
) -> ProbeOutcome {
    match process::capture(program, args, timeout).await {
        Ok(output) if output.success() => {
            ProbeOutcome::new(true, format!("{} exited 0", program), started)
        }
        Ok(output) => {
            let reason = if output.stderr.is_empty() {
                format!("exit status {:?}", output.status_code)
            } else {
                output.stderr
            };
            ProbeOutcome::new(false, format!("{} failed: {}", program, reason), started)
        }
        Err(e) => ProbeOutcome::new(false, e.to_string(), started),
    }
}
