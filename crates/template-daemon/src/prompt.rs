//! Confirmation of destructive template edits on the terminal.

use async_trait::async_trait;
use clap::ValueEnum;
use std::io::{BufRead, Write};
use template_core::Confirm;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How destructive template edits are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfirmMode {
    /// Prompt on stderr and read the answer from stdin
    Ask,
    /// Accept every destructive edit
    Yes,
    /// Decline every destructive edit, reverting the template
    No,
}

pub struct StdinConfirm {
    mode: ConfirmMode,
    /// One prompt on the terminal at a time
    prompt_lock: Mutex<()>,
}

impl StdinConfirm {
    pub fn new(mode: ConfirmMode) -> Self {
        Self {
            mode,
            prompt_lock: Mutex::new(()),
        }
    }
}

/// `y` or `yes`, case-insensitive.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm_destructive_change(&self, message: &str) -> bool {
        match self.mode {
            ConfirmMode::Yes => {
                info!("Accepting: {}", message);
                true
            }
            ConfirmMode::No => {
                info!("Declining: {}", message);
                false
            }
            ConfirmMode::Ask => {
                let _held = self.prompt_lock.lock().await;
                let message = message.to_string();
                let answer = tokio::task::spawn_blocking(move || {
                    let mut stderr = std::io::stderr();
                    let _ = write!(stderr, "{} [y/N] ", message);
                    let _ = stderr.flush();
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line).map(|_| line)
                })
                .await;

                match answer {
                    Ok(Ok(line)) => is_yes(&line),
                    Ok(Err(e)) => {
                        warn!("Could not read confirmation, declining: {}", e);
                        false
                    }
                    Err(e) => {
                        warn!("Confirmation prompt failed, declining: {}", e);
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
        assert!(!is_yes("yeah"));
    }

    #[tokio::test]
    async fn fixed_modes_do_not_prompt() {
        assert!(StdinConfirm::new(ConfirmMode::Yes).confirm_destructive_change("x").await);
        assert!(!StdinConfirm::new(ConfirmMode::No).confirm_destructive_change("x").await);
    }
}
