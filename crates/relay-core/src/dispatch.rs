use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use relay_tools::{validate_input_against_schema, Tool, ToolExecutionError};
use relay_types::{
    AssistantMessage, Message, PermissionDecision, ProgressMessage, ToolEvent, ToolUseRequest,
    UserContent, UserMessage,
};

use crate::context::QueryContext;
use crate::permissions::{PermissionGate, QueryCancelled};

/// Text of the error tool result produced when the abort signal fires
/// before or during a tool invocation.
pub const TOOL_CANCELLED_MESSAGE: &str = "Tool execution was interrupted by the user.";

/// Formatted execution errors are clipped to this many characters,
/// keeping the head and the tail.
const ERROR_TRUNCATION_LIMIT: usize = 10_000;

/// Dispatch one tool-use request through the full gate sequence and hand
/// back its message stream: any number of progress messages followed by
/// exactly one tool-result user message.
///
/// The returned stream is lazy. Nothing runs, including the permission
/// check, until the first poll, so callers can line up several of these
/// and execute them strictly one after another.
///
/// Every failure mode resolves to an error tool result inside the stream;
/// the stream itself never fails.
pub fn run_tool_use(
    request: ToolUseRequest,
    sibling_tool_use_ids: Vec<String>,
    requesting_message: AssistantMessage,
    conversation: Vec<Message>,
    skip_permission_gate: bool,
    ctx: QueryContext,
    gate: Arc<dyn PermissionGate>,
) -> BoxStream<'static, Message> {
    Box::pin(
        futures::stream::once(async move {
            dispatch(
                request,
                sibling_tool_use_ids,
                requesting_message,
                conversation,
                skip_permission_gate,
                ctx,
                gate,
            )
            .await
        })
        .flatten(),
    )
}

async fn dispatch(
    request: ToolUseRequest,
    sibling_tool_use_ids: Vec<String>,
    requesting_message: AssistantMessage,
    conversation: Vec<Message>,
    skip_permission_gate: bool,
    ctx: QueryContext,
    gate: Arc<dyn PermissionGate>,
) -> BoxStream<'static, Message> {
    let Some(tool) = ctx.exec.registry.get(&request.name).await else {
        return single(error_result(
            &request.id,
            &format!("No tool named `{}` is available.", request.name),
        ));
    };

    if ctx.is_cancelled() {
        return single(cancelled_result(&request.id));
    }

    if let Err(violation) = validate_input_against_schema(&tool.schema().input_schema, &request.input)
    {
        return single(error_result(
            &request.id,
            &format!(
                "InputValidationError: input for `{}` does not match its schema: {violation}",
                request.name
            ),
        ));
    }

    let input = tool.normalize_input(request.input.clone(), &ctx.exec);

    if let Err(rejection) = tool.validate_input(&input, &ctx.exec).await {
        return single(error_result(&request.id, &rejection.message));
    }

    if !skip_permission_gate {
        match gate.check(tool.as_ref(), &input, &ctx, &requesting_message).await {
            Ok(PermissionDecision::Authorized) => {}
            Ok(PermissionDecision::Denied { message }) => {
                return single(error_result(&request.id, &message));
            }
            Err(err) if err.downcast_ref::<QueryCancelled>().is_some() => {
                return single(cancelled_result(&request.id));
            }
            Err(err) => {
                return single(error_result(
                    &request.id,
                    &format!("Permission check failed: {err}"),
                ));
            }
        }
    }

    emit_event(
        Level::INFO,
        ProcessKind::Agent,
        ObservabilityEvent {
            event: "tool.started",
            component: "dispatch",
            query_id: Some(&ctx.query_id),
            tool: Some(&request.name),
            tool_use_id: Some(&request.id),
            status: Some("running"),
            error_code: None,
            detail: None,
        },
    );

    let mut events = tool.execute(input, ctx.exec.clone());
    let query_id = ctx.query_id.clone();
    let tool_name = request.name.clone();
    let request_id = request.id.clone();
    let cancel = ctx.cancel_token().clone();
    let (tx, rx) = mpsc::channel::<Message>(1);

    tokio::spawn(async move {
        let mut terminated = false;
        while let Some(event) = events.next().await {
            match event {
                Ok(ToolEvent::Progress { payload }) => {
                    let progress = ProgressMessage::new(
                        &request_id,
                        sibling_tool_use_ids.clone(),
                        progress_content(payload),
                        conversation.clone(),
                    );
                    if tx.send(Message::Progress(progress)).await.is_err() {
                        return;
                    }
                }
                Ok(ToolEvent::Result { data, rendered }) => {
                    let rendered = rewrite_tool_use_ids(rendered, &request_id);
                    let message = Message::User(UserMessage::tool_result(rendered, data));
                    emit_tool_finished(&query_id, &tool_name, &request_id, None);
                    let _ = tx.send(message).await;
                    terminated = true;
                    break;
                }
                Err(err) => {
                    // A fault while the abort signal is up is the abort.
                    let text = if cancel.is_cancelled() {
                        TOOL_CANCELLED_MESSAGE.to_string()
                    } else {
                        format_execution_error(&err)
                    };
                    emit_tool_finished(&query_id, &tool_name, &request_id, Some(&text));
                    let _ = tx.send(error_result(&request_id, &text)).await;
                    terminated = true;
                    break;
                }
            }
        }
        // A stream that dries up without a result is a tool defect; the
        // model still needs a resolving message.
        if !terminated {
            let text = if cancel.is_cancelled() {
                TOOL_CANCELLED_MESSAGE.to_string()
            } else {
                format!("Tool `{tool_name}` ended without producing a result.")
            };
            emit_tool_finished(&query_id, &tool_name, &request_id, Some(&text));
            let _ = tx.send(error_result(&request_id, &text)).await;
        }
    });

    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    }))
}

fn single(message: Message) -> BoxStream<'static, Message> {
    Box::pin(futures::stream::iter(vec![message]))
}

fn error_result(tool_use_id: &str, text: &str) -> Message {
    Message::User(UserMessage::tool_result(
        vec![UserContent::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: json!(text),
            is_error: true,
        }],
        json!(text),
    ))
}

fn cancelled_result(tool_use_id: &str) -> Message {
    error_result(tool_use_id, TOOL_CANCELLED_MESSAGE)
}

/// Progress payloads that deserialize as a full assistant message pass
/// through; anything else is wrapped as synthetic text.
fn progress_content(payload: Value) -> AssistantMessage {
    match serde_json::from_value::<AssistantMessage>(payload.clone()) {
        Ok(message) => message,
        Err(_) => {
            let text = match payload {
                Value::String(s) => s,
                other => other.to_string(),
            };
            AssistantMessage::synthetic(&text)
        }
    }
}

/// The tool rendered its result against a placeholder id; stamp the real
/// request id so the sequencer can pair request and result.
fn rewrite_tool_use_ids(rendered: Vec<UserContent>, request_id: &str) -> Vec<UserContent> {
    rendered
        .into_iter()
        .map(|block| match block {
            UserContent::ToolResult {
                content, is_error, ..
            } => UserContent::ToolResult {
                tool_use_id: request_id.to_string(),
                content,
                is_error,
            },
            text => text,
        })
        .collect()
}

fn format_execution_error(err: &anyhow::Error) -> String {
    let mut text = match err.downcast_ref::<ToolExecutionError>() {
        Some(exec) => {
            let mut parts = vec![format!("Error: {}", exec.message)];
            if let Some(stdout) = exec.stdout.as_deref() {
                if !stdout.is_empty() {
                    parts.push(format!("stdout:\n{stdout}"));
                }
            }
            if let Some(stderr) = exec.stderr.as_deref() {
                if !stderr.is_empty() {
                    parts.push(format!("stderr:\n{stderr}"));
                }
            }
            parts.join("\n\n")
        }
        None => format!("Error: {err:#}"),
    };
    if text.chars().count() > ERROR_TRUNCATION_LIMIT {
        text = truncate_middle(&text, ERROR_TRUNCATION_LIMIT);
    }
    text
}

/// Keep the head and tail of an overlong text, eliding the middle.
pub fn truncate_middle(text: &str, limit: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return text.to_string();
    }
    let head: String = chars[..limit / 2].iter().collect();
    let tail: String = chars[chars.len() - limit / 2..].iter().collect();
    format!("{head}\n\n... [{} characters elided] ...\n\n{tail}", chars.len() - limit)
}

fn emit_tool_finished(query_id: &str, tool: &str, tool_use_id: &str, error: Option<&str>) {
    emit_event(
        if error.is_some() {
            Level::WARN
        } else {
            Level::INFO
        },
        ProcessKind::Agent,
        ObservabilityEvent {
            event: "tool.finished",
            component: "dispatch",
            query_id: Some(query_id),
            tool: Some(tool),
            tool_use_id: Some(tool_use_id),
            status: Some(if error.is_some() { "error" } else { "ok" }),
            error_code: None,
            detail: error,
        },
    );
}
