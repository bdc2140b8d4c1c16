use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use relay_types::CommandPrefixResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSplit {
    pub commands: Vec<String>,
    /// True when the command contains an operator other than a glob or a
    /// list separator (pipes, redirections, substitution, background
    /// `&`). Multi-command "don't ask again" grants must not be offered
    /// for these; only exact-match grants apply.
    pub is_unsafe: bool,
}

/// Split a command string on `&&`, `||`, `;` and `;;`, preserving quoting,
/// and drop the benign "cd to the already-current directory" artifact
/// some models prepend.
pub fn split_command(command: &str, cwd: Option<&Path>) -> CommandSplit {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut is_unsafe = false;

    let bytes: Vec<char> = command.chars().collect();
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;

    while i < bytes.len() {
        let ch = bytes[i];

        if in_single {
            current.push(ch);
            if ch == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            if ch == '\\' && i + 1 < bytes.len() {
                current.push(ch);
                current.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            // The shell still substitutes inside double quotes; only
            // single quotes keep text literal.
            if ch == '`' || (ch == '$' && i + 1 < bytes.len() && bytes[i + 1] == '(') {
                is_unsafe = true;
            }
            current.push(ch);
            if ch == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }

        match ch {
            '\'' => {
                in_single = true;
                current.push(ch);
                i += 1;
            }
            '"' => {
                in_double = true;
                current.push(ch);
                i += 1;
            }
            '\\' if i + 1 < bytes.len() => {
                current.push(ch);
                current.push(bytes[i + 1]);
                i += 2;
            }
            '&' if i + 1 < bytes.len() && bytes[i + 1] == '&' => {
                push_command(&mut commands, &mut current);
                i += 2;
            }
            '|' if i + 1 < bytes.len() && bytes[i + 1] == '|' => {
                push_command(&mut commands, &mut current);
                i += 2;
            }
            ';' => {
                // `;;` splits the same way `;` does.
                push_command(&mut commands, &mut current);
                i += if i + 1 < bytes.len() && bytes[i + 1] == ';' {
                    2
                } else {
                    1
                };
            }
            '|' | '&' | '>' | '<' | '`' => {
                is_unsafe = true;
                current.push(ch);
                i += 1;
            }
            '$' if i + 1 < bytes.len() && bytes[i + 1] == '(' => {
                is_unsafe = true;
                current.push(ch);
                i += 1;
            }
            '\n' => {
                push_command(&mut commands, &mut current);
                i += 1;
            }
            _ => {
                current.push(ch);
                i += 1;
            }
        }
    }
    push_command(&mut commands, &mut current);

    if let Some(cwd) = cwd {
        let redundant_cd = format!("cd {}", cwd.display());
        commands.retain(|c| c != &redundant_cd && c != "cd .");
    }

    CommandSplit {
        commands,
        is_unsafe,
    }
}

fn push_command(commands: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        commands.push(trimmed.to_string());
    }
    current.clear();
}

/// Whether the string contains any control operator at all (used to tell
/// compound commands from simple ones when offering grants).
pub fn is_compound_command(command: &str) -> bool {
    split_command(command, None).commands.len() > 1
}

/// External prefix classifier: language-model backed in production,
/// mocked in tests. Returns the safe-to-prefix-match leading portion of a
/// command, no prefix, or an injection-detected flag.
#[async_trait]
pub trait PrefixClassifier: Send + Sync {
    async fn classify(&self, command: &str) -> anyhow::Result<CommandPrefixResult>;
}

/// Outcome of a memoized prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixLookup {
    /// The shared abort signal fired before the classifier answered.
    Cancelled,
    /// The classifier failed (network error and the like). Treated as
    /// "insufficient information": ask the user, never silently allow or
    /// silently deny on a different basis.
    Unavailable,
    Known(CommandPrefixResult),
}

/// Decomposes shell commands and classifies safe prefixes, memoizing
/// classifier answers per literal command string for the process
/// lifetime. The cache is owned here so tests control invalidation.
#[derive(Clone)]
pub struct CommandSafetyAnalyzer {
    classifier: Arc<dyn PrefixClassifier>,
    cache: Arc<RwLock<HashMap<String, CommandPrefixResult>>>,
}

impl CommandSafetyAnalyzer {
    pub fn new(classifier: Arc<dyn PrefixClassifier>) -> Self {
        Self {
            classifier,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Prefix classification for one literal command string. Keyed
    /// independently of any surrounding sub-command context.
    pub async fn prefix_for(&self, command: &str, cancel: &CancellationToken) -> PrefixLookup {
        if cancel.is_cancelled() {
            return PrefixLookup::Cancelled;
        }
        if let Some(hit) = self.cache.read().await.get(command) {
            return PrefixLookup::Known(hit.clone());
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return PrefixLookup::Cancelled,
            outcome = self.classifier.classify(command) => outcome,
        };

        let result = match outcome {
            Ok(result) => downgrade_overbroad_prefix(result),
            Err(err) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Agent,
                    ObservabilityEvent {
                        event: "safety.classifier.failed",
                        component: "safety.analyzer",
                        query_id: None,
                        tool: Some("bash"),
                        tool_use_id: None,
                        status: Some("degraded"),
                        error_code: Some("CLASSIFIER_UNAVAILABLE"),
                        detail: Some(&err.to_string()),
                    },
                );
                return PrefixLookup::Unavailable;
            }
        };

        self.cache
            .write()
            .await
            .insert(command.to_string(), result.clone());
        PrefixLookup::Known(result)
    }

    #[cfg(test)]
    pub async fn cached(&self, command: &str) -> Option<CommandPrefixResult> {
        self.cache.read().await.get(command).cloned()
    }
}

/// The bare token `git` authorizes far too much; downgrade it to "no safe
/// prefix" so only exact grants apply.
fn downgrade_overbroad_prefix(result: CommandPrefixResult) -> CommandPrefixResult {
    match result {
        CommandPrefixResult::Prefix {
            prefix: Some(prefix),
        } if prefix.trim() == "git" => CommandPrefixResult::none(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier {
        result: CommandPrefixResult,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn new(result: CommandPrefixResult) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PrefixClassifier for FixedClassifier {
        async fn classify(&self, _command: &str) -> anyhow::Result<CommandPrefixResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl PrefixClassifier for FailingClassifier {
        async fn classify(&self, _command: &str) -> anyhow::Result<CommandPrefixResult> {
            Err(anyhow::anyhow!("connection reset"))
        }
    }

    #[test]
    fn splits_on_list_separators() {
        let split = split_command("git status && rm -rf /", None);
        assert_eq!(split.commands, vec!["git status", "rm -rf /"]);
        assert!(!split.is_unsafe);
    }

    #[test]
    fn ampersands_inside_quotes_do_not_split() {
        let split = split_command("echo 'a && b' ; ls", None);
        assert_eq!(split.commands, vec!["echo 'a && b'", "ls"]);
    }

    #[test]
    fn pipes_and_substitution_mark_the_split_unsafe() {
        assert!(split_command("cat foo | sh", None).is_unsafe);
        assert!(split_command("echo $(whoami)", None).is_unsafe);
        assert!(split_command("sleep 5 & ls", None).is_unsafe);
        assert!(!split_command("ls *.rs ; pwd", None).is_unsafe);
    }

    #[test]
    fn substitution_inside_double_quotes_is_unsafe() {
        assert!(split_command(r#"git status "$(rm -rf /)""#, None).is_unsafe);
        assert!(split_command(r#"echo "`whoami`""#, None).is_unsafe);
        // Single quotes and escaped dollars stay literal.
        assert!(!split_command(r#"echo '$(not expanded)'"#, None).is_unsafe);
        assert!(!split_command(r#"echo "\$(literal)""#, None).is_unsafe);
    }

    #[test]
    fn redundant_cd_to_current_directory_is_dropped() {
        let cwd = PathBuf::from("/work/project");
        let split = split_command("cd /work/project && cargo test", Some(&cwd));
        assert_eq!(split.commands, vec!["cargo test"]);
    }

    #[tokio::test]
    async fn classifier_result_is_memoized_per_literal_command() {
        let classifier = Arc::new(FixedClassifier::new(CommandPrefixResult::prefix("npm test")));
        let analyzer = CommandSafetyAnalyzer::new(classifier.clone());
        let cancel = CancellationToken::new();

        let first = analyzer.prefix_for("npm test --watch", &cancel).await;
        let second = analyzer.prefix_for("npm test --watch", &cancel).await;
        assert_eq!(first, second);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(analyzer.cached("npm test --watch").await.is_some());
    }

    #[tokio::test]
    async fn bare_git_prefix_is_downgraded_to_none() {
        let analyzer = CommandSafetyAnalyzer::new(Arc::new(FixedClassifier::new(
            CommandPrefixResult::prefix("git"),
        )));
        let cancel = CancellationToken::new();
        let lookup = analyzer.prefix_for("git push origin main", &cancel).await;
        assert_eq!(lookup, PrefixLookup::Known(CommandPrefixResult::none()));
    }

    #[tokio::test]
    async fn classifier_failure_is_reported_as_unavailable_and_not_cached() {
        let analyzer = CommandSafetyAnalyzer::new(Arc::new(FailingClassifier));
        let cancel = CancellationToken::new();
        let lookup = analyzer.prefix_for("npm install", &cancel).await;
        assert_eq!(lookup, PrefixLookup::Unavailable);
        assert!(analyzer.cached("npm install").await.is_none());
    }

    #[tokio::test]
    async fn fired_abort_short_circuits_before_classification() {
        let classifier = Arc::new(FixedClassifier::new(CommandPrefixResult::none()));
        let analyzer = CommandSafetyAnalyzer::new(classifier.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let lookup = analyzer.prefix_for("npm install", &cancel).await;
        assert_eq!(lookup, PrefixLookup::Cancelled);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }
}
