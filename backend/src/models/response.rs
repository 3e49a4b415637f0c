//! Response envelopes returned by handlers and batch operations.

use serde::{Deserialize, Serialize};

/// Messages and errors produced by a single unit of work.
///
/// Expected domain failures travel here rather than as `Err`, so a caller can
/// tell a partial success apart from a total failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub messages: Vec<String>,
    pub errors: Vec<String>,
}

impl RefreshResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            errors: Vec::new(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            errors: vec![error.into()],
        }
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn merge(&mut self, other: RefreshResponse) {
        self.messages.extend(other.messages);
        self.errors.extend(other.errors);
    }
}

/// Totals for one pass over the notification queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BatchResponse {
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}
