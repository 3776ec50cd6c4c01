//! Interactive confirmation on the terminal

use async_trait::async_trait;
use codespaced::orchestrator::Confirm;
use std::io::{self, BufRead, Write};
use tracing::warn;

/// Reads a yes/no answer from stdin; anything but `y`/`yes` is a no
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        let prompt = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            ask(&prompt, io::stdin().lock(), io::stdout())
        })
        .await;
        match answer {
            Ok(yes) => yes,
            Err(e) => {
                warn!("Confirmation prompt failed: {}", e);
                false
            }
        }
    }
}

fn ask(prompt: &str, mut input: impl BufRead, mut output: impl Write) -> bool {
    if write!(output, "{} [y/N] ", prompt)
        .and_then(|_| output.flush())
        .is_err()
    {
        return false;
    }
    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(_) => false,
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
