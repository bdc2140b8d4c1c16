use std::path::Path;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_tools::{ToolExecContext, ToolRegistry};

use crate::grants::GrantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Normal gating: every non-exempt tool use goes through the engine.
    Default,
    /// Caller opted out of all permission checks for this query.
    BypassPermissions,
}

/// Per-query execution context threaded through the orchestrator, the
/// dispatch pipeline and the permission engine. The grant store rides
/// here explicitly so tests can swap it and teardown is visible.
#[derive(Clone)]
pub struct QueryContext {
    pub query_id: String,
    pub exec: ToolExecContext,
    pub grants: GrantStore,
    pub permission_mode: PermissionMode,
}

impl QueryContext {
    pub fn new(registry: ToolRegistry, cwd: impl AsRef<Path>, grants: GrantStore) -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
            exec: ToolExecContext::new(registry, cwd.as_ref().to_path_buf()),
            grants,
            permission_mode: PermissionMode::Default,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.exec = self.exec.with_cancel(cancel);
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.exec.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.exec.cancel.is_cancelled()
    }
}
