use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use relay_types::{
    AssistantMessage, Message, INTERRUPT_MESSAGE, INTERRUPT_MESSAGE_FOR_TOOL_USE,
};

use crate::context::QueryContext;
use crate::dispatch::run_tool_use;
use crate::merge::merge_bounded;
use crate::model::{
    responses_equivalent, ArbiterVerdict, FeedbackPolicy, FirstSampleArbiter, ModelClient,
    SampleArbiter,
};
use crate::permissions::PermissionGate;
use crate::TOOL_CONCURRENCY_CAP;

/// Caller-supplied parameters that stay fixed for the lifetime of one
/// query.
#[derive(Clone)]
pub struct QueryParams {
    pub system_prompt: String,
    pub context_notes: String,
    pub options: Value,
}

impl QueryParams {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            context_notes: String::new(),
            options: Value::Null,
        }
    }
}

/// Drives the full agentic turn loop: model call (optionally dual
/// sampled), tool extraction, gated dispatch, result accumulation, then
/// the next model call — until a turn produces no tool uses or the abort
/// signal fires.
pub struct QueryOrchestrator {
    model: Arc<dyn ModelClient>,
    gate: Arc<dyn PermissionGate>,
    arbiter: Arc<dyn SampleArbiter>,
    policy: FeedbackPolicy,
}

impl QueryOrchestrator {
    pub fn new(model: Arc<dyn ModelClient>, gate: Arc<dyn PermissionGate>) -> Self {
        Self {
            model,
            gate,
            arbiter: Arc::new(FirstSampleArbiter),
            policy: FeedbackPolicy::disabled(),
        }
    }

    pub fn with_sampling(mut self, arbiter: Arc<dyn SampleArbiter>, policy: FeedbackPolicy) -> Self {
        self.arbiter = arbiter;
        self.policy = policy;
        self
    }

    /// Start the query and hand back its message stream. The loop runs on
    /// its own task; dropping the stream stops it at the next yield
    /// point.
    pub fn run_query(
        &self,
        conversation: Vec<Message>,
        params: QueryParams,
        ctx: QueryContext,
    ) -> BoxStream<'static, Message> {
        let model = self.model.clone();
        let gate = self.gate.clone();
        let arbiter = self.arbiter.clone();
        let policy = self.policy.clone();
        let (tx, rx) = mpsc::channel::<Message>(16);

        tokio::spawn(async move {
            emit_query_status(&ctx.query_id, "query.started", "running");
            query_loop(model, gate, arbiter, policy, conversation, params, ctx.clone(), tx).await;
            emit_query_status(&ctx.query_id, "query.finished", "done");
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        }))
    }
}

#[allow(clippy::too_many_arguments)]
async fn query_loop(
    model: Arc<dyn ModelClient>,
    gate: Arc<dyn PermissionGate>,
    arbiter: Arc<dyn SampleArbiter>,
    policy: FeedbackPolicy,
    mut conversation: Vec<Message>,
    params: QueryParams,
    ctx: QueryContext,
    tx: mpsc::Sender<Message>,
) {
    loop {
        if ctx.is_cancelled() {
            let _ = tx
                .send(Message::Assistant(AssistantMessage::synthetic(
                    INTERRUPT_MESSAGE,
                )))
                .await;
            return;
        }

        let sampled = sample_response(
            &*model,
            &*arbiter,
            &policy,
            &conversation,
            &params,
            ctx.cancel_token(),
        )
        .await;
        let (assistant, skip_permission_gate) = match sampled {
            Sampled::Interrupted => {
                let _ = tx
                    .send(Message::Assistant(AssistantMessage::synthetic(
                        INTERRUPT_MESSAGE,
                    )))
                    .await;
                return;
            }
            Sampled::Response {
                message,
                skip_permission_gate,
            } => (message, skip_permission_gate),
        };

        if tx.send(Message::Assistant(assistant.clone())).await.is_err() {
            return;
        }

        let requests = assistant.tool_uses();
        if requests.is_empty() {
            return;
        }
        conversation.push(Message::Assistant(assistant.clone()));

        // Concurrent only when every requested tool is known and
        // read-only; an unknown name forces the conservative path.
        let mut all_read_only = true;
        for request in &requests {
            match ctx.exec.registry.get(&request.name).await {
                Some(tool) if tool.is_read_only() => {}
                _ => {
                    all_read_only = false;
                    break;
                }
            }
        }

        let sibling_ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
        let streams: Vec<BoxStream<'static, Message>> = requests
            .iter()
            .map(|request| {
                run_tool_use(
                    request.clone(),
                    sibling_ids.clone(),
                    assistant.clone(),
                    conversation.clone(),
                    skip_permission_gate,
                    ctx.clone(),
                    gate.clone(),
                )
            })
            .collect();

        let mut merged: BoxStream<'static, Message> = if all_read_only {
            merge_bounded(streams, TOOL_CONCURRENCY_CAP)
        } else {
            Box::pin(futures::stream::iter(streams).flatten())
        };

        let mut results: HashMap<String, Message> = HashMap::new();
        while let Some(message) = merged.next().await {
            if let Message::User(user) = &message {
                if let Some(id) = user.resolved_tool_use_id() {
                    results.insert(id.to_string(), message.clone());
                }
            }
            if tx.send(message).await.is_err() {
                return;
            }
        }

        if ctx.is_cancelled() {
            let _ = tx
                .send(Message::Assistant(AssistantMessage::synthetic(
                    INTERRUPT_MESSAGE_FOR_TOOL_USE,
                )))
                .await;
            return;
        }

        // Results joined the stream in completion order; the continuing
        // conversation records them in request order.
        for request in &requests {
            if let Some(result) = results.remove(&request.id) {
                conversation.push(result);
            }
        }
    }
}

enum Sampled {
    Interrupted,
    Response {
        message: AssistantMessage,
        skip_permission_gate: bool,
    },
}

async fn sample_response(
    model: &dyn ModelClient,
    arbiter: &dyn SampleArbiter,
    policy: &FeedbackPolicy,
    conversation: &[Message],
    params: &QueryParams,
    cancel: &CancellationToken,
) -> Sampled {
    if !policy.should_sample() {
        return match fold_outcome(
            model
                .complete(
                    conversation,
                    &params.system_prompt,
                    &params.context_notes,
                    &params.options,
                    cancel,
                )
                .await,
        ) {
            None => Sampled::Interrupted,
            Some(message) => Sampled::Response {
                message,
                skip_permission_gate: false,
            },
        };
    }

    let (first, second) = tokio::join!(
        model.complete(
            conversation,
            &params.system_prompt,
            &params.context_notes,
            &params.options,
            cancel,
        ),
        model.complete(
            conversation,
            &params.system_prompt,
            &params.context_notes,
            &params.options,
            cancel,
        ),
    );

    let (Some(first), Some(second)) = (fold_outcome(first), fold_outcome(second)) else {
        return Sampled::Interrupted;
    };

    // A transport error on one side settles it without the arbiter.
    if first.is_api_error != second.is_api_error {
        let message = if first.is_api_error { second } else { first };
        return Sampled::Response {
            message,
            skip_permission_gate: false,
        };
    }

    if responses_equivalent(&first, &second) {
        return Sampled::Response {
            message: first,
            skip_permission_gate: false,
        };
    }

    match arbiter.choose(&first, &second).await {
        ArbiterVerdict::Choose {
            index,
            skip_permission_gate,
        } => Sampled::Response {
            message: if index == 0 { first } else { second },
            skip_permission_gate,
        },
        ArbiterVerdict::Neither => Sampled::Interrupted,
    }
}

/// `Err` becomes an error-flagged assistant message; `Ok(None)` (cancelled
/// before a response) becomes `None`.
fn fold_outcome(outcome: anyhow::Result<Option<AssistantMessage>>) -> Option<AssistantMessage> {
    match outcome {
        Ok(response) => response,
        Err(err) => {
            let mut message = AssistantMessage::synthetic(&format!("API Error: {err:#}"));
            message.is_api_error = true;
            Some(message)
        }
    }
}

fn emit_query_status(query_id: &str, event: &str, status: &str) {
    emit_event(
        Level::INFO,
        ProcessKind::Agent,
        ObservabilityEvent {
            event,
            component: "orchestrator",
            query_id: Some(query_id),
            tool: None,
            tool_use_id: None,
            status: Some(status),
            error_code: None,
            detail: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use relay_tools::{event_channel, Tool, ToolEventStream, ToolExecContext, ToolRegistry};
    use relay_types::{ContentBlock, PermissionDecision, ToolEvent, ToolSchema, UserContent};
    use serde_json::json;

    use crate::grants::GrantStore;

    struct AllowGate;

    #[async_trait]
    impl PermissionGate for AllowGate {
        async fn check(
            &self,
            _tool: &dyn Tool,
            _input: &Value,
            _ctx: &QueryContext,
            _requesting_message: &AssistantMessage,
        ) -> anyhow::Result<PermissionDecision> {
            Ok(PermissionDecision::Authorized)
        }
    }

    /// Model scripted with a queue of outcomes; records every conversation
    /// it was handed.
    struct ScriptedModel {
        turns: Mutex<VecDeque<anyhow::Result<Option<AssistantMessage>>>>,
        conversations: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<anyhow::Result<Option<AssistantMessage>>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                conversations: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.conversations.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(
            &self,
            conversation: &[Message],
            _system_prompt: &str,
            _context_notes: &str,
            _options: &Value,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Option<AssistantMessage>> {
            self.conversations
                .lock()
                .unwrap()
                .push(conversation.to_vec());
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some(AssistantMessage::synthetic("script exhausted"))))
        }
    }

    /// Read-only tool that sleeps for a scripted delay, so completion
    /// order can be forced to differ from request order.
    struct DelayTool {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for DelayTool {
        fn name(&self) -> &str {
            "delay"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "delay".to_string(),
                description: "Sleeps then answers".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "millis": {"type": "number"}
                    },
                    "required": ["label", "millis"]
                }),
            }
        }
        fn is_read_only(&self) -> bool {
            true
        }
        fn needs_permission(&self, _input: &Value) -> bool {
            false
        }
        fn execute(&self, input: Value, _ctx: ToolExecContext) -> ToolEventStream {
            let label = input["label"].as_str().unwrap_or_default().to_string();
            let millis = input["millis"].as_u64().unwrap_or(0);
            let active = self.active.clone();
            let peak = self.peak.clone();
            let (tx, stream) = event_channel(1);
            tokio::spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(Ok(ToolEvent::result_text(label, ""))).await;
            });
            stream
        }
    }

    /// Same contract but non-read-only, forcing serial dispatch.
    struct MutatingDelayTool(DelayTool);

    #[async_trait]
    impl Tool for MutatingDelayTool {
        fn name(&self) -> &str {
            "mutate"
        }
        fn schema(&self) -> ToolSchema {
            let mut schema = self.0.schema();
            schema.name = "mutate".to_string();
            schema
        }
        fn is_read_only(&self) -> bool {
            false
        }
        fn needs_permission(&self, _input: &Value) -> bool {
            false
        }
        fn execute(&self, input: Value, ctx: ToolExecContext) -> ToolEventStream {
            self.0.execute(input, ctx)
        }
    }

    /// Fires the shared abort signal mid-execution, then resolves.
    struct AbortingTool;

    #[async_trait]
    impl Tool for AbortingTool {
        fn name(&self) -> &str {
            "aborting"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "aborting".to_string(),
                description: "Cancels the turn".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            }
        }
        fn is_read_only(&self) -> bool {
            true
        }
        fn needs_permission(&self, _input: &Value) -> bool {
            false
        }
        fn execute(&self, _input: Value, ctx: ToolExecContext) -> ToolEventStream {
            let (tx, stream) = event_channel(1);
            tokio::spawn(async move {
                ctx.cancel.cancel();
                let _ = tx.send(Ok(ToolEvent::result_text("stopped", ""))).await;
            });
            stream
        }
    }

    fn text_response(text: &str) -> anyhow::Result<Option<AssistantMessage>> {
        Ok(Some(AssistantMessage::synthetic(text)))
    }

    fn tool_response(uses: Vec<(&str, &str, Value)>) -> anyhow::Result<Option<AssistantMessage>> {
        let blocks = uses
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect();
        Ok(Some(AssistantMessage::new(blocks, 0.01, 50)))
    }

    async fn ctx_with(tools: Vec<Arc<dyn Tool>>) -> QueryContext {
        let registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).await;
        }
        QueryContext::new(registry, "/work", GrantStore::in_memory())
    }

    fn assistant_text(message: &Message) -> Option<&str> {
        match message {
            Message::Assistant(a) => a.content.iter().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }

    fn result_label(message: &Message) -> Option<&str> {
        match message {
            Message::User(u) => u.content.iter().find_map(|b| match b {
                UserContent::ToolResult { content, .. } => content.as_str(),
                _ => None,
            }),
            _ => None,
        }
    }

    #[tokio::test]
    async fn text_only_response_ends_the_query() {
        let model = Arc::new(ScriptedModel::new(vec![text_response("all done")]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate));
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(assistant_text(&messages[0]), Some("all done"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn tool_turn_feeds_results_into_the_next_model_call() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response(vec![(
                "tu_a",
                "delay",
                json!({"label": "a", "millis": 1}),
            )]),
            text_response("done"),
        ]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate));
        let ctx = ctx_with(vec![Arc::new(DelayTool {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })])
        .await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        // Assistant turn, tool result, closing assistant turn.
        assert_eq!(messages.len(), 3);
        assert_eq!(result_label(&messages[1]), Some("a"));
        assert_eq!(assistant_text(&messages[2]), Some("done"));

        // The second call saw the request and its result appended.
        let second = &model.conversations.lock().unwrap()[1];
        assert_eq!(second.len(), 2);
        assert_eq!(result_label(&second[1]), Some("a"));
    }

    #[tokio::test]
    async fn results_stream_in_completion_order_but_continue_in_request_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response(vec![
                ("tu_a", "delay", json!({"label": "a", "millis": 60})),
                ("tu_b", "delay", json!({"label": "b", "millis": 30})),
                ("tu_c", "delay", json!({"label": "c", "millis": 5})),
            ]),
            text_response("done"),
        ]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate));
        let ctx = ctx_with(vec![Arc::new(DelayTool {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })])
        .await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;

        let streamed: Vec<&str> = messages.iter().filter_map(result_label).collect();
        assert_eq!(streamed, vec!["c", "b", "a"], "completion order on the stream");

        let second = &model.conversations.lock().unwrap()[1];
        let recorded: Vec<&str> = second.iter().filter_map(result_label).collect();
        assert_eq!(recorded, vec!["a", "b", "c"], "request order in the conversation");
    }

    #[tokio::test]
    async fn read_only_turns_run_concurrently_and_mutating_turns_do_not() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response(vec![
                ("tu_a", "delay", json!({"label": "a", "millis": 20})),
                ("tu_b", "delay", json!({"label": "b", "millis": 20})),
            ]),
            text_response("done"),
        ]));
        let orchestrator = QueryOrchestrator::new(model, Arc::new(AllowGate));
        let ctx = ctx_with(vec![Arc::new(DelayTool {
            active: active.clone(),
            peak: peak.clone(),
        })])
        .await;
        let _: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert!(peak.load(Ordering::SeqCst) >= 2, "read-only turn should overlap");

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response(vec![
                ("tu_a", "mutate", json!({"label": "a", "millis": 20})),
                ("tu_b", "mutate", json!({"label": "b", "millis": 20})),
            ]),
            text_response("done"),
        ]));
        let orchestrator = QueryOrchestrator::new(model, Arc::new(AllowGate));
        let ctx = ctx_with(vec![Arc::new(MutatingDelayTool(DelayTool {
            active: active.clone(),
            peak: peak.clone(),
        }))])
        .await;
        let _: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1, "mutating turn must be serial");
    }

    #[tokio::test]
    async fn cancelled_model_call_yields_one_interrupt_message() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(None)]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate));
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(assistant_text(&messages[0]), Some(INTERRUPT_MESSAGE));
    }

    #[tokio::test]
    async fn abort_during_tool_use_stops_the_loop_with_one_interrupt() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response(vec![("tu_a", "aborting", json!({}))]),
            text_response("must never be produced"),
        ]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate));
        let ctx = ctx_with(vec![Arc::new(AbortingTool)]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        let last = messages.last().expect("interrupt message");
        assert_eq!(assistant_text(last), Some(INTERRUPT_MESSAGE_FOR_TOOL_USE));
        assert_eq!(model.calls(), 1, "no further model call after the abort");
        let interrupts = messages
            .iter()
            .filter(|m| assistant_text(m) == Some(INTERRUPT_MESSAGE_FOR_TOOL_USE))
            .count();
        assert_eq!(interrupts, 1);
    }

    #[tokio::test]
    async fn transport_error_surfaces_as_an_api_error_message() {
        let model = Arc::new(ScriptedModel::new(vec![Err(anyhow::anyhow!(
            "overloaded"
        ))]));
        let orchestrator = QueryOrchestrator::new(model, Arc::new(AllowGate));
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Assistant(a) => {
                assert!(a.is_api_error);
                assert!(assistant_text(&messages[0]).unwrap().contains("overloaded"));
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    struct ChooseSecond;

    #[async_trait]
    impl SampleArbiter for ChooseSecond {
        async fn choose(
            &self,
            _first: &AssistantMessage,
            _second: &AssistantMessage,
        ) -> ArbiterVerdict {
            ArbiterVerdict::Choose {
                index: 1,
                skip_permission_gate: false,
            }
        }
    }

    struct RefuseBoth;

    #[async_trait]
    impl SampleArbiter for RefuseBoth {
        async fn choose(
            &self,
            _first: &AssistantMessage,
            _second: &AssistantMessage,
        ) -> ArbiterVerdict {
            ArbiterVerdict::Neither
        }
    }

    fn forced_sampling() -> FeedbackPolicy {
        FeedbackPolicy {
            force_on: true,
            force_off: false,
            eligible_user: true,
            sample_rate_permille: 1000,
        }
    }

    #[tokio::test]
    async fn divergent_samples_defer_to_the_arbiter() {
        let model = Arc::new(ScriptedModel::new(vec![
            text_response("first draft"),
            text_response("second draft"),
        ]));
        let orchestrator = QueryOrchestrator::new(model.clone(), Arc::new(AllowGate))
            .with_sampling(Arc::new(ChooseSecond), forced_sampling());
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(assistant_text(&messages[0]), Some("second draft"));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn arbiter_refusal_interrupts_the_query() {
        let model = Arc::new(ScriptedModel::new(vec![
            text_response("first draft"),
            text_response("second draft"),
        ]));
        let orchestrator = QueryOrchestrator::new(model, Arc::new(AllowGate))
            .with_sampling(Arc::new(RefuseBoth), forced_sampling());
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(assistant_text(&messages[0]), Some(INTERRUPT_MESSAGE));
    }

    #[tokio::test]
    async fn equivalent_samples_skip_the_arbiter() {
        let same = AssistantMessage::synthetic("identical");
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(Some(same.clone())),
            Ok(Some(same)),
        ]));
        // RefuseBoth would interrupt if it were consulted.
        let orchestrator = QueryOrchestrator::new(model, Arc::new(AllowGate))
            .with_sampling(Arc::new(RefuseBoth), forced_sampling());
        let ctx = ctx_with(vec![]).await;

        let messages: Vec<Message> = orchestrator
            .run_query(vec![], QueryParams::new("system"), ctx)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(assistant_text(&messages[0]), Some("identical"));
    }
}
