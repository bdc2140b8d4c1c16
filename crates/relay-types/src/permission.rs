use serde::{Deserialize, Serialize};

/// Outcome of the permission gate for one tool invocation. Denial is a
/// value handed back to the model as ordinary tool output, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PermissionDecision {
    Authorized,
    Denied { message: String },
}

impl PermissionDecision {
    pub fn denied(message: impl Into<String>) -> Self {
        PermissionDecision::Denied {
            message: message.into(),
        }
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, PermissionDecision::Authorized)
    }
}

/// Classification of one literal shell command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPrefixResult {
    /// The command's structure could cause something other than its
    /// apparent prefix to execute. Only exact-match grants apply.
    InjectionDetected,
    /// `None` means no safe prefix could be identified; exact-match
    /// grants are still honored.
    Prefix { prefix: Option<String> },
}

impl CommandPrefixResult {
    pub fn none() -> Self {
        CommandPrefixResult::Prefix { prefix: None }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        CommandPrefixResult::Prefix {
            prefix: Some(prefix.into()),
        }
    }
}
