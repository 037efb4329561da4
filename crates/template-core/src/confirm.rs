//! Confirmation of destructive template edits.

use async_trait::async_trait;

/// Asks the user whether a template edit that deletes properties from bound
/// documents should go ahead.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm_destructive_change(&self, message: &str) -> bool;
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm_destructive_change(&self, _message: &str) -> bool {
        self.0
    }
}
