//! Subprocess execution with timeouts
//!
//! Errors carry the command's own stderr as their message so callers can
//! surface it verbatim (`Error: <stderr>`).

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Run `program args...` and capture its output, whatever the exit status
pub async fn capture(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
    debug!("Running {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to execute {}", program))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("{} timed out after {}s", program, timeout.as_secs()))?
        .with_context(|| format!("Failed to wait for {}", program))?;

    Ok(CommandOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a command and fail unless it exits with status 0
pub async fn run(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let output = capture(program, args, timeout).await?;
    if output.success() {
        return Ok(output.stdout);
    }

    let message = if !output.stderr.is_empty() {
        output.stderr
    } else if !output.stdout.is_empty() {
        output.stdout
    } else {
        format!(
            "{} exited with status {}",
            program,
            output
                .status_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        )
    };
    Err(anyhow!(message))
}

/// Run a shell snippet through `sh -c`
pub async fn run_shell(script: &str, timeout: Duration) -> Result<String> {
    run("sh", &["-c".to_string(), script.to_string()], timeout).await
}
