use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::UserContent;

/// Declared shape of a tool, advertised to the model and used to validate
/// tool-use input before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One event produced by a running tool: zero or more `Progress` events
/// followed by exactly one `Result`. Streams are finite and not
/// restartable.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Progress {
        payload: Value,
    },
    Result {
        /// Raw result payload, kept opaque by the core.
        data: Value,
        /// Assistant-facing rendering of the payload.
        rendered: Vec<UserContent>,
    },
}

impl ToolEvent {
    pub fn result_text(text: impl Into<String>, tool_use_id: &str) -> Self {
        let text = text.into();
        ToolEvent::Result {
            data: Value::String(text.clone()),
            rendered: vec![UserContent::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: Value::String(text),
                is_error: false,
            }],
        }
    }
}

/// Rejection from a tool's semantic `validate_input` hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRejection {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl InputRejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            meta: None,
        }
    }
}
