use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_types::{AssistantMessage, ContentBlock, Message};

/// Opaque model transport. `Ok(None)` means the query was cancelled
/// before a response arrived; transport failures are returned as `Err`
/// and folded into an error-flagged assistant message by the
/// orchestrator.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        conversation: &[Message],
        system_prompt: &str,
        context_notes: &str,
        options: &Value,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<AssistantMessage>>;
}

/// Verdict from the external arbiter when two sampled responses differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterVerdict {
    Choose {
        index: usize,
        /// Set when a human already approved the chosen message's tool
        /// uses by selecting it; the normal permission gate is skipped.
        skip_permission_gate: bool,
    },
    /// The arbiter picked neither; treated as an interrupt.
    Neither,
}

/// Selects between two sampled responses. Interactive in production,
/// scripted in tests.
#[async_trait]
pub trait SampleArbiter: Send + Sync {
    async fn choose(
        &self,
        first: &AssistantMessage,
        second: &AssistantMessage,
    ) -> ArbiterVerdict;
}

/// Arbiter used when sampling is off; it should never be consulted.
pub struct FirstSampleArbiter;

#[async_trait]
impl SampleArbiter for FirstSampleArbiter {
    async fn choose(&self, _first: &AssistantMessage, _second: &AssistantMessage) -> ArbiterVerdict {
        ArbiterVerdict::Choose {
            index: 0,
            skip_permission_gate: false,
        }
    }
}

/// Environment-gated dual-sampling ("binary feedback") policy.
#[derive(Debug, Clone)]
pub struct FeedbackPolicy {
    pub force_on: bool,
    pub force_off: bool,
    pub eligible_user: bool,
    /// Per-mille probability of sampling a turn when not forced.
    pub sample_rate_permille: u32,
}

impl FeedbackPolicy {
    pub fn disabled() -> Self {
        Self {
            force_on: false,
            force_off: true,
            eligible_user: false,
            sample_rate_permille: 0,
        }
    }

    pub fn from_env() -> Self {
        let test_mode = env_flag("RELAY_TEST_MODE");
        Self {
            force_on: env_flag("RELAY_FEEDBACK_FORCE_ON"),
            // Test mode disables sampling deterministically.
            force_off: env_flag("RELAY_FEEDBACK_FORCE_OFF") || test_mode,
            eligible_user: env_flag("RELAY_FEEDBACK_ELIGIBLE"),
            sample_rate_permille: std::env::var("RELAY_FEEDBACK_RATE_PERMILLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    pub fn should_sample(&self) -> bool {
        if self.force_off {
            return false;
        }
        if self.force_on {
            return true;
        }
        if !self.eligible_user || self.sample_rate_permille == 0 {
            return false;
        }
        let draw = (Uuid::new_v4().as_u128() % 1000) as u32;
        draw < self.sample_rate_permille
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Behavioral equivalence of two sampled responses: same sequence of
/// non-thinking block types; tool uses equal by name and input; text
/// compared only when the response carries no tool use at all.
pub fn responses_equivalent(first: &AssistantMessage, second: &AssistantMessage) -> bool {
    let a: Vec<&ContentBlock> = first
        .content
        .iter()
        .filter(|b| !b.is_thinking())
        .collect();
    let b: Vec<&ContentBlock> = second
        .content
        .iter()
        .filter(|b| !b.is_thinking())
        .collect();
    if a.len() != b.len() {
        return false;
    }

    let any_tool_use = a
        .iter()
        .chain(b.iter())
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));

    a.iter().zip(b.iter()).all(|(x, y)| match (x, y) {
        (
            ContentBlock::ToolUse {
                name: n1, input: i1, ..
            },
            ContentBlock::ToolUse {
                name: n2, input: i2, ..
            },
        ) => n1 == n2 && i1 == i2,
        (ContentBlock::Text { text: t1 }, ContentBlock::Text { text: t2 }) => {
            any_tool_use || t1 == t2
        }
        _ => false,
    })
}
