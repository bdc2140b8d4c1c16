use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use relay_types::{InputRejection, ToolEvent, ToolSchema};

pub mod schema;

pub use schema::{validate_input_against_schema, validate_tool_schemas};

/// Lazy, finite, non-restartable sequence of tool events: zero or more
/// `Progress` events terminated by exactly one `Result`. An `Err` item is
/// an execution fault; the dispatch pipeline formats it into an error
/// tool result.
pub type ToolEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<ToolEvent>> + Send>>;

/// Fault raised by a tool during execution. Captured process output, when
/// present, is folded into the formatted error the model sees.
#[derive(Debug)]
pub struct ToolExecutionError {
    pub message: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ToolExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stdout: None,
            stderr: None,
        }
    }
}

impl std::fmt::Display for ToolExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ToolExecutionError {}

/// Everything a tool may observe while executing: the shared abort signal
/// for the turn, the registry it was dispatched from, per-file last-read
/// timestamps (owned by the caller, used by file tools to detect stale
/// writes), and opaque model/config parameters.
#[derive(Clone)]
pub struct ToolExecContext {
    pub cancel: CancellationToken,
    pub registry: ToolRegistry,
    pub read_timestamps: Arc<RwLock<HashMap<PathBuf, SystemTime>>>,
    pub options: Value,
    pub cwd: PathBuf,
}

impl ToolExecContext {
    pub fn new(registry: ToolRegistry, cwd: impl Into<PathBuf>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            registry,
            read_timestamps: Arc::new(RwLock::new(HashMap::new())),
            options: Value::Null,
            cwd: cwd.into(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Capability contract every local tool implements. Concrete tools live
/// with the caller; the core only schedules, authorizes and executes them
/// through this trait.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    /// Read-only tools from the same turn may run concurrently; anything
    /// else forces serial execution.
    fn is_read_only(&self) -> bool;

    /// Whether this input requires the permission gate at all.
    fn needs_permission(&self, input: &Value) -> bool;

    /// Tool-specific input canonicalization. Pure; identity by default.
    fn normalize_input(&self, input: Value, _ctx: &ToolExecContext) -> Value {
        input
    }

    /// Semantic validation beyond shape (file existence, stale reads).
    async fn validate_input(
        &self,
        _input: &Value,
        _ctx: &ToolExecContext,
    ) -> Result<(), InputRejection> {
        Ok(())
    }

    /// Start execution and hand back the event stream. Implementations
    /// must observe `ctx.cancel` at their suspension points and terminate
    /// with exactly one `Result` event.
    fn execute(&self, input: Value, ctx: ToolExecContext) -> ToolEventStream;
}

/// Caller-owned registry, keyed by tool name.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .await
            .insert(tool.name().to_string(), tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-backed event stream: the producer half is handed to the tool's
/// driving task, the consumer pulls lazily.
pub fn event_channel(
    buffer: usize,
) -> (mpsc::Sender<anyhow::Result<ToolEvent>>, ToolEventStream) {
    let (tx, rx) = mpsc::channel(buffer);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });
    (tx, Box::pin(stream))
}

/// Eager stream over already-known events. Used for short-circuit paths
/// (lookup failure, denial) and in tests.
pub fn events_from(events: Vec<ToolEvent>) -> ToolEventStream {
    Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
}
