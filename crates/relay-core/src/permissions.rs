use async_trait::async_trait;
use serde_json::Value;
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use relay_tools::Tool;
use relay_types::{AssistantMessage, CommandPrefixResult, PermissionDecision};

use crate::context::{PermissionMode, QueryContext};
use crate::grants::{permission_key, shell_exact_key, shell_prefix_key};
use crate::safety::{split_command, CommandSafetyAnalyzer, PrefixLookup};

pub const SHELL_TOOL_NAME: &str = "bash";

/// Read-only commands that never need a grant. Matched per sub-command as
/// a token prefix, so `git diff src/` qualifies and `git push` does not.
const SAFE_SHELL_COMMANDS: [&str; 8] = [
    "git status",
    "git diff",
    "git log",
    "git branch",
    "pwd",
    "tree",
    "date",
    "which",
];

/// Marker error for "the authorization check was aborted". The only
/// failure the gate is allowed to propagate; everything else resolves to
/// a `PermissionDecision` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCancelled;

impl std::fmt::Display for QueryCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query cancelled")
    }
}

impl std::error::Error for QueryCancelled {}

/// Authorization callback consumed by the dispatch pipeline. Callers may
/// substitute their own (a sub-agent with a reduced tool set, a test
/// double) as long as denial stays a value.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(
        &self,
        tool: &dyn Tool,
        input: &Value,
        ctx: &QueryContext,
        requesting_message: &AssistantMessage,
    ) -> anyhow::Result<PermissionDecision>;
}

/// The default gate: durable/session grant lookup plus shell command
/// decomposition and prefix classification. Fails closed — when a
/// determination cannot be made the answer is denial, never a fault.
pub struct PermissionEngine {
    analyzer: CommandSafetyAnalyzer,
}

impl PermissionEngine {
    pub fn new(analyzer: CommandSafetyAnalyzer) -> Self {
        Self { analyzer }
    }

    async fn check_shell(
        &self,
        command: &str,
        ctx: &QueryContext,
    ) -> anyhow::Result<PermissionDecision> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(PermissionDecision::denied(
                "Shell tool invoked with an empty command.",
            ));
        }

        let split = split_command(command, Some(&ctx.exec.cwd));

        if split.commands.iter().all(|sub| is_safe_command(sub)) && !split.is_unsafe {
            return Ok(PermissionDecision::Authorized);
        }

        if ctx.grants.has(&shell_exact_key(command)).await {
            return Ok(PermissionDecision::Authorized);
        }

        // Injection-prone compound commands never generalize: exact match
        // was the only way in.
        if split.is_unsafe {
            return Ok(PermissionDecision::denied(format!(
                "Command `{command}` contains shell operators that cannot be safely \
                 pre-approved; ask the user to approve this exact command."
            )));
        }

        // Top-level prefix grant covers the whole command in one step.
        match self.analyzer.prefix_for(command, ctx.cancel_token()).await {
            PrefixLookup::Cancelled => return Err(QueryCancelled.into()),
            PrefixLookup::Unavailable => {
                return Ok(PermissionDecision::denied(
                    "Unable to determine whether this command is safe to run; \
                     ask the user to approve it.",
                ))
            }
            PrefixLookup::Known(CommandPrefixResult::InjectionDetected) => {
                return Ok(PermissionDecision::denied(format!(
                    "Command `{command}` looks like it may execute something other \
                     than its apparent prefix; ask the user to approve this exact command."
                )));
            }
            PrefixLookup::Known(CommandPrefixResult::Prefix { prefix }) => {
                if let Some(prefix) = prefix {
                    if ctx.grants.has(&shell_prefix_key(&prefix)).await {
                        return Ok(PermissionDecision::Authorized);
                    }
                }
                // A null top-level prefix does not block sub-command
                // grants below; the two signals are independent.
            }
        }

        // Every sub-command must be individually covered by an exact or
        // prefix grant.
        let mut all_covered = !split.commands.is_empty();
        for sub in &split.commands {
            if is_safe_command(sub) || ctx.grants.has(&shell_exact_key(sub)).await {
                continue;
            }
            match self.analyzer.prefix_for(sub, ctx.cancel_token()).await {
                PrefixLookup::Cancelled => return Err(QueryCancelled.into()),
                PrefixLookup::Unavailable => {
                    all_covered = false;
                    break;
                }
                PrefixLookup::Known(CommandPrefixResult::InjectionDetected) => {
                    // Exact match already failed above; nothing else can
                    // satisfy an injection-flagged sub-command.
                    all_covered = false;
                    break;
                }
                PrefixLookup::Known(CommandPrefixResult::Prefix { prefix }) => {
                    let covered = match prefix {
                        Some(prefix) => ctx.grants.has(&shell_prefix_key(&prefix)).await,
                        None => false,
                    };
                    if !covered {
                        all_covered = false;
                        break;
                    }
                }
            }
        }

        if all_covered {
            return Ok(PermissionDecision::Authorized);
        }

        Ok(PermissionDecision::denied(format!(
            "Permission to run `{command}` has not yet been granted; \
             ask the user to approve it."
        )))
    }
}

#[async_trait]
impl PermissionGate for PermissionEngine {
    async fn check(
        &self,
        tool: &dyn Tool,
        input: &Value,
        ctx: &QueryContext,
        _requesting_message: &AssistantMessage,
    ) -> anyhow::Result<PermissionDecision> {
        if ctx.is_cancelled() {
            return Err(QueryCancelled.into());
        }

        if ctx.permission_mode == PermissionMode::BypassPermissions {
            return Ok(PermissionDecision::Authorized);
        }

        if !tool.needs_permission(input) {
            return Ok(PermissionDecision::Authorized);
        }

        let decision = if tool.name() == SHELL_TOOL_NAME {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            self.check_shell(command, ctx).await?
        } else if !tool.is_read_only() {
            // File-mutation tools are session-scoped only; a grant here
            // must never outlive the process.
            let key = permission_key(tool.name(), input);
            if ctx.grants.has_session(&key).await {
                PermissionDecision::Authorized
            } else {
                PermissionDecision::denied(format!(
                    "Permission to use {} has not yet been granted for this session; \
                     ask the user to approve it.",
                    tool.name()
                ))
            }
        } else {
            let key = permission_key(tool.name(), input);
            if ctx.grants.has(&key).await {
                PermissionDecision::Authorized
            } else {
                PermissionDecision::denied(format!(
                    "Permission to use {} has not yet been granted; \
                     ask the user to approve it.",
                    tool.name()
                ))
            }
        };

        emit_event(
            Level::INFO,
            ProcessKind::Agent,
            ObservabilityEvent {
                event: "permission.decided",
                component: "permission.engine",
                query_id: Some(&ctx.query_id),
                tool: Some(tool.name()),
                tool_use_id: None,
                status: Some(if decision.is_authorized() {
                    "authorized"
                } else {
                    "denied"
                }),
                error_code: None,
                detail: None,
            },
        );
        Ok(decision)
    }
}

fn is_safe_command(sub_command: &str) -> bool {
    let tokens: Vec<&str> = sub_command.split_whitespace().collect();
    SAFE_SHELL_COMMANDS.iter().any(|entry| {
        let entry_tokens: Vec<&str> = entry.split_whitespace().collect();
        tokens.len() >= entry_tokens.len() && tokens[..entry_tokens.len()] == entry_tokens[..]
    })
}
