use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Text used for the synthetic assistant message emitted when the user
/// aborts before a model response arrives.
pub const INTERRUPT_MESSAGE: &str = "[Request interrupted by user]";

/// Text used for the synthetic assistant message emitted when the abort
/// signal fires while tool invocations are still in flight.
pub const INTERRUPT_MESSAGE_FOR_TOOL_USE: &str =
    "[Request interrupted by user during tool use]";

/// One content block of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

impl ContentBlock {
    pub fn is_thinking(&self) -> bool {
        matches!(
            self,
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. }
        )
    }
}

/// One content block of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub content: Vec<ContentBlock>,
    /// Marks a transport-error response (the model call itself failed and
    /// was surfaced as a message). Dual sampling disprefers these.
    #[serde(default)]
    pub is_api_error: bool,
}

impl AssistantMessage {
    pub fn new(content: Vec<ContentBlock>, cost_usd: f64, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cost_usd,
            duration_ms,
            content,
            is_api_error: false,
        }
    }

    /// Synthetic message used for both interrupt variants.
    pub fn synthetic(text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cost_usd: 0.0,
            duration_ms: 0,
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            is_api_error: false,
        }
    }

    pub fn tool_uses(&self) -> Vec<ToolUseRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUseRequest {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub content: Vec<UserContent>,
    /// Raw tool result payload, kept alongside the assistant-facing
    /// rendering in `content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
}

impl UserMessage {
    pub fn new(content: Vec<UserContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            tool_use_result: None,
        }
    }

    pub fn tool_result(rendered: Vec<UserContent>, raw: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: rendered,
            tool_use_result: Some(raw),
        }
    }

    /// Id of the tool use this message resolves, if it is a tool result.
    pub fn resolved_tool_use_id(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            UserContent::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }

    pub fn is_tool_result_only(&self) -> bool {
        !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|block| matches!(block, UserContent::ToolResult { .. }))
    }
}

/// Interim status report for a tool use still executing. Superseded by
/// later progress or by the final result, never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub id: String,
    pub tool_use_id: String,
    /// Tool use ids requested in the same assistant turn.
    pub sibling_tool_use_ids: Vec<String>,
    pub content: Box<AssistantMessage>,
    /// Snapshot of the conversation at the point this progress was emitted.
    pub conversation: Vec<Message>,
}

impl ProgressMessage {
    pub fn new(
        tool_use_id: &str,
        sibling_tool_use_ids: Vec<String>,
        content: AssistantMessage,
        conversation: Vec<Message>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_use_id: tool_use_id.to_string(),
            sibling_tool_use_ids,
            content: Box::new(content),
            conversation,
        }
    }
}

/// A conversation message. Immutable once created; conversation lists are
/// extended with new values, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    Assistant(AssistantMessage),
    User(UserMessage),
    Progress(ProgressMessage),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Assistant(m) => &m.id,
            Message::User(m) => &m.id,
            Message::Progress(m) => &m.id,
        }
    }
}

/// A model-issued request to invoke a named local tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}
