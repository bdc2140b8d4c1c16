use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

/// On-disk shape of the project grant file. Owned by the configuration
/// subsystem; this store only appends to `allowed_tools`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GrantFile {
    #[serde(default)]
    allowed_tools: Vec<String>,
}

/// Durable and session-scoped permission grants, keyed by strings derived
/// from (tool identity, canonicalized input or command prefix).
///
/// Session grants live in volatile memory and die with the process.
/// Project grants are loaded at session start and appended to on "don't
/// ask again" actions; appends merge with whatever is on disk so a
/// concurrently-added grant is never lost.
#[derive(Clone)]
pub struct GrantStore {
    session: Arc<RwLock<HashSet<String>>>,
    project: Arc<RwLock<Vec<String>>>,
    project_path: Option<PathBuf>,
}

impl GrantStore {
    /// Store with no persistence. Used by tests and one-shot callers.
    pub fn in_memory() -> Self {
        Self {
            session: Arc::new(RwLock::new(HashSet::new())),
            project: Arc::new(RwLock::new(Vec::new())),
            project_path: None,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let grants = match fs::read_to_string(&path).await {
            Ok(raw) => {
                let file: GrantFile = serde_json::from_str(&raw).unwrap_or_default();
                dedupe_preserving_order(file.allowed_tools)
            }
            Err(_) => Vec::new(),
        };
        Ok(Self {
            session: Arc::new(RwLock::new(HashSet::new())),
            project: Arc::new(RwLock::new(grants)),
            project_path: Some(path),
        })
    }

    /// Exact-match lookup across both durability classes.
    pub async fn has(&self, key: &str) -> bool {
        if self.session.read().await.contains(key) {
            return true;
        }
        self.project.read().await.iter().any(|k| k == key)
    }

    /// Session grants only. File-mutation tools are never authorized from
    /// the persisted list.
    pub async fn has_session(&self, key: &str) -> bool {
        self.session.read().await.contains(key)
    }

    pub async fn grant_session(&self, key: &str) {
        self.session.write().await.insert(key.to_string());
    }

    /// Persist a "don't ask again" grant: append, de-duplicate, save.
    pub async fn grant_project(&self, key: &str) -> anyhow::Result<()> {
        {
            let mut project = self.project.write().await;
            if !project.iter().any(|k| k == key) {
                project.push(key.to_string());
            }
        }
        self.save().await
    }

    pub async fn project_grants(&self) -> Vec<String> {
        self.project.read().await.clone()
    }

    async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.project_path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Merge with the file as it is now so grants added by another
        // process are kept.
        let on_disk: Vec<String> = match fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str::<GrantFile>(&raw)
                .unwrap_or_default()
                .allowed_tools,
            Err(_) => Vec::new(),
        };

        let merged = {
            let mut project = self.project.write().await;
            let mut merged = dedupe_preserving_order(
                on_disk.into_iter().chain(project.iter().cloned()).collect(),
            );
            std::mem::swap(&mut *project, &mut merged);
            project.clone()
        };

        let file = GrantFile {
            allowed_tools: merged,
        };
        let raw = serde_json::to_string_pretty(&file)?;
        fs::write(path, raw).await?;
        Ok(())
    }
}

fn dedupe_preserving_order(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// Grant key for a tool invocation: the shell tool is keyed by its literal
/// command, everything else by canonicalized input JSON.
pub fn permission_key(tool_name: &str, input: &Value) -> String {
    if tool_name == crate::permissions::SHELL_TOOL_NAME {
        let command = input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim();
        return shell_exact_key(command);
    }
    format!("{}({})", tool_name, canonical_json(input))
}

pub fn shell_exact_key(command: &str) -> String {
    format!("Bash({})", command.trim())
}

/// Prefix grants carry a `:*` marker so a prefix never collides with an
/// exact grant for the same literal string.
pub fn shell_prefix_key(prefix: &str) -> String {
    format!("Bash({}:*)", prefix.trim())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k.as_str()])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{inner}}}")
        }
        Value::Array(items) => {
            let inner = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{inner}]")
        }
        other => other.to_string(),
    }
}
