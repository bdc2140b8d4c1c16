use std::collections::HashSet;

use relay_types::{AssistantMessage, ContentBlock, Message, UserContent, UserMessage};

/// Pure, idempotent transformations over conversation lists. Nothing here
/// mutates its input or performs I/O.

/// Expand every message carrying multiple content blocks into one message
/// per block. Assistant cost is divided evenly across the expanded blocks
/// so the total is preserved.
pub fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::Assistant(m) if m.content.len() > 1 => {
                let share = m.cost_usd / m.content.len() as f64;
                for block in &m.content {
                    out.push(Message::Assistant(AssistantMessage {
                        id: m.id.clone(),
                        cost_usd: share,
                        duration_ms: m.duration_ms,
                        content: vec![block.clone()],
                        is_api_error: m.is_api_error,
                    }));
                }
            }
            Message::User(m) if m.content.len() > 1 => {
                for block in &m.content {
                    let tool_use_result = match block {
                        UserContent::ToolResult { .. } => m.tool_use_result.clone(),
                        UserContent::Text { .. } => None,
                    };
                    out.push(Message::User(UserMessage {
                        id: m.id.clone(),
                        content: vec![block.clone()],
                        tool_use_result,
                    }));
                }
            }
            other => out.push(other.clone()),
        }
    }
    out
}

/// Move each progress/result message so it sits immediately after the
/// tool-use request it answers. A later progress message for the same
/// tool use replaces the earlier one; progress reports supersede, they do
/// not accumulate.
pub fn reorder_messages(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for message in messages {
        let Some(target_id) = answered_tool_use_id(message) else {
            out.push(message.clone());
            continue;
        };

        if matches!(message, Message::Progress(_)) {
            out.retain(|existing| match existing {
                Message::Progress(p) => p.tool_use_id != target_id,
                _ => true,
            });
        }

        match insertion_index(&out, &target_id) {
            Some(index) => out.insert(index, message.clone()),
            None => out.push(message.clone()),
        }
    }
    out
}

fn answered_tool_use_id(message: &Message) -> Option<String> {
    match message {
        Message::Progress(p) => Some(p.tool_use_id.clone()),
        Message::User(u) => u.resolved_tool_use_id().map(str::to_string),
        Message::Assistant(_) => None,
    }
}

/// Position right after the requesting tool-use block and any messages
/// already attached to it.
fn insertion_index(messages: &[Message], tool_use_id: &str) -> Option<usize> {
    let request_index = messages.iter().position(|m| match m {
        Message::Assistant(a) => a
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { id, .. } if id == tool_use_id)),
        _ => false,
    })?;

    let mut index = request_index + 1;
    while index < messages.len() {
        match answered_tool_use_id(&messages[index]) {
            Some(id) if id == tool_use_id => index += 1,
            _ => break,
        }
    }
    Some(index)
}

/// Tool-use requests with no result message yet.
pub fn unresolved_tool_use_ids(messages: &[Message]) -> HashSet<String> {
    let mut requested: Vec<String> = Vec::new();
    let mut resolved: HashSet<String> = HashSet::new();
    for message in messages {
        match message {
            Message::Assistant(a) => {
                for block in &a.content {
                    if let ContentBlock::ToolUse { id, .. } = block {
                        requested.push(id.clone());
                    }
                }
            }
            Message::User(u) => {
                if let Some(id) = u.resolved_tool_use_id() {
                    resolved.insert(id.to_string());
                }
            }
            Message::Progress(_) => {}
        }
    }
    requested
        .into_iter()
        .filter(|id| !resolved.contains(id))
        .collect()
}

/// The earliest unresolved tool use plus any other unresolved one that is
/// already reporting progress.
pub fn in_progress_tool_use_ids(messages: &[Message]) -> HashSet<String> {
    let unresolved = unresolved_tool_use_ids(messages);
    let mut in_progress = HashSet::new();

    for message in messages {
        if let Message::Assistant(a) = message {
            for block in &a.content {
                if let ContentBlock::ToolUse { id, .. } = block {
                    if unresolved.contains(id) {
                        in_progress.insert(id.clone());
                        break;
                    }
                }
            }
        }
        if !in_progress.is_empty() {
            break;
        }
    }

    for message in messages {
        if let Message::Progress(p) = message {
            if unresolved.contains(&p.tool_use_id) {
                in_progress.insert(p.tool_use_id.clone());
            }
        }
    }
    in_progress
}

/// Tool-use requests whose result message is flagged as an error.
pub fn errored_tool_use_ids(messages: &[Message]) -> HashSet<String> {
    let mut errored = HashSet::new();
    for message in messages {
        if let Message::User(u) = message {
            for block in &u.content {
                if let UserContent::ToolResult {
                    tool_use_id,
                    is_error: true,
                    ..
                } = block
                {
                    errored.insert(tool_use_id.clone());
                }
            }
        }
    }
    errored
}

/// Collapse consecutive tool-result-only user messages into one. The
/// model transport accepts at most one user turn between assistant turns.
pub fn normalize_for_api(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for message in messages {
        let merge = match (&message, out.last()) {
            (Message::User(current), Some(Message::User(previous))) => {
                current.is_tool_result_only() && previous.is_tool_result_only()
            }
            _ => false,
        };
        if merge {
            let Some(Message::User(previous)) = out.last_mut() else {
                unreachable!("guarded by the match above");
            };
            if let Message::User(current) = message {
                let mut merged = previous.clone();
                merged.content.extend(current.content.iter().cloned());
                merged.tool_use_result = None;
                *previous = merged;
            }
        } else {
            out.push(message.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ProgressMessage;
    use serde_json::json;

    fn assistant_with(blocks: Vec<ContentBlock>, cost: f64) -> Message {
        Message::Assistant(AssistantMessage::new(blocks, cost, 100))
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "read".to_string(),
            input: json!({"path": "a.rs"}),
        }
    }

    fn result_for(id: &str, is_error: bool) -> Message {
        Message::User(UserMessage::tool_result(
            vec![UserContent::ToolResult {
                tool_use_id: id.to_string(),
                content: json!("out"),
                is_error,
            }],
            json!("out"),
        ))
    }

    fn progress_for(id: &str) -> Message {
        Message::Progress(ProgressMessage::new(
            id,
            vec![id.to_string()],
            AssistantMessage::synthetic("working"),
            Vec::new(),
        ))
    }

    #[test]
    fn normalize_splits_blocks_and_preserves_total_cost() {
        let message = assistant_with(
            vec![
                ContentBlock::Text {
                    text: "Let me look".to_string(),
                },
                tool_use("tu_1"),
                tool_use("tu_2"),
            ],
            0.09,
        );
        let normalized = normalize_messages(&[message]);
        assert_eq!(normalized.len(), 3);
        let total: f64 = normalized
            .iter()
            .map(|m| match m {
                Message::Assistant(a) => a.cost_usd,
                _ => 0.0,
            })
            .sum();
        assert!((total - 0.09).abs() < 1e-12);
    }

    #[test]
    fn normalize_is_idempotent() {
        let messages = vec![
            assistant_with(
                vec![
                    ContentBlock::Text {
                        text: "hi".to_string(),
                    },
                    tool_use("tu_1"),
                ],
                0.04,
            ),
            result_for("tu_1", false),
        ];
        let once = normalize_messages(&messages);
        let twice = normalize_messages(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn reorder_places_results_after_their_requests() {
        let messages = vec![
            assistant_with(vec![tool_use("a")], 0.01),
            assistant_with(vec![tool_use("b")], 0.01),
            result_for("b", false),
            result_for("a", false),
        ];
        let reordered = reorder_messages(&messages);
        let positions: Vec<Option<String>> = reordered
            .iter()
            .map(|m| answered_tool_use_id(m))
            .collect();
        // a's result follows a's request, b's follows b's.
        assert_eq!(positions[1].as_deref(), Some("a"));
        assert_eq!(positions[3].as_deref(), Some("b"));
    }

    #[test]
    fn later_progress_replaces_earlier_progress() {
        let messages = vec![
            assistant_with(vec![tool_use("a")], 0.01),
            progress_for("a"),
            progress_for("a"),
        ];
        let reordered = reorder_messages(&messages);
        let progress_count = reordered
            .iter()
            .filter(|m| matches!(m, Message::Progress(_)))
            .count();
        assert_eq!(progress_count, 1);
    }

    #[test]
    fn derived_sets_follow_resolution_state() {
        let messages = vec![
            assistant_with(vec![tool_use("a")], 0.01),
            assistant_with(vec![tool_use("b")], 0.01),
            assistant_with(vec![tool_use("c")], 0.01),
            result_for("a", true),
            progress_for("c"),
        ];
        let unresolved = unresolved_tool_use_ids(&messages);
        assert_eq!(
            unresolved,
            HashSet::from(["b".to_string(), "c".to_string()])
        );

        // b is first in queue; c has progress.
        let in_progress = in_progress_tool_use_ids(&messages);
        assert_eq!(
            in_progress,
            HashSet::from(["b".to_string(), "c".to_string()])
        );

        assert_eq!(errored_tool_use_ids(&messages), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn api_normalize_collapses_adjacent_tool_result_messages() {
        let messages = vec![
            assistant_with(vec![tool_use("a"), tool_use("b")], 0.02),
            result_for("a", false),
            result_for("b", false),
        ];
        let collapsed = normalize_for_api(&messages);
        assert_eq!(collapsed.len(), 2);
        match &collapsed[1] {
            Message::User(u) => assert_eq!(u.content.len(), 2),
            other => panic!("expected merged user message, got {other:?}"),
        }
    }

    #[test]
    fn api_normalize_does_not_merge_across_plain_text() {
        let messages = vec![
            result_for("a", false),
            Message::User(UserMessage::new(vec![UserContent::Text {
                text: "also this".to_string(),
            }])),
            result_for("b", false),
        ];
        let collapsed = normalize_for_api(&messages);
        assert_eq!(collapsed.len(), 3);
    }
}
