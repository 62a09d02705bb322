//! Describes the workspace the agent runs in: directory, git branch,
//! package manager and top-level entries. Detected once at construction.

use agentloop_core::backend::Backend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AgentMiddleware, ModelContext, ModelDirective};

pub const MAX_LISTED_ENTRIES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalContext {
    pub working_dir: Option<String>,
    pub git_branch: Option<String>,
    pub package_manager: Option<String>,
    pub entries: Vec<String>,
    /// Set when the listing was cut at [`MAX_LISTED_ENTRIES`].
    pub more_entries: usize,
}

impl LocalContext {
    /// Probe the backend root. Failures degrade to missing fields.
    pub async fn detect(backend: &dyn Backend) -> Self {
        let listing = match backend.list("/").await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(backend = backend.id(), error = %err, "local context listing failed");
                Vec::new()
            }
        };
        let names: Vec<String> = listing
            .iter()
            .map(|e| e.path.trim_start_matches('/').to_string())
            .collect();

        let git_branch = detect_git_branch(backend, &names).await;
        let package_manager = detect_package_manager(&names).map(str::to_string);
        let more_entries = names.len().saturating_sub(MAX_LISTED_ENTRIES);
        let entries = names.into_iter().take(MAX_LISTED_ENTRIES).collect();

        Self {
            working_dir: None,
            git_branch,
            package_manager,
            entries,
            more_entries,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn render(&self) -> String {
        let mut lines = vec!["## Local Context".to_string(), String::new()];
        if let Some(dir) = &self.working_dir {
            lines.push(format!("**Current Directory**: `{dir}`"));
        }
        match &self.git_branch {
            Some(branch) => lines.push(format!("**Git**: current branch `{branch}`")),
            None => lines.push("**Git**: not a git repository".to_string()),
        }
        if let Some(pm) = &self.package_manager {
            lines.push(format!("**Package Manager**: {pm}"));
        }
        if !self.entries.is_empty() {
            lines.push(String::new());
            lines.push("**Files**:".to_string());
            lines.extend(self.entries.iter().map(|e| format!("- {e}")));
            if self.more_entries > 0 {
                lines.push(format!("- ... ({} more)", self.more_entries));
            }
        }
        lines.join("\n")
    }
}

async fn detect_git_branch(backend: &dyn Backend, names: &[String]) -> Option<String> {
    if !names.iter().any(|n| n == ".git/") {
        return None;
    }
    if let Ok(head) = backend.read_to_string("/.git/HEAD").await {
        return match head.trim().strip_prefix("ref: refs/heads/") {
            Some(branch) => Some(branch.to_string()),
            None => Some("detached HEAD".to_string()),
        };
    }
    if backend.supports_execution() {
        if let Ok(response) = backend.execute("git rev-parse --abbrev-ref HEAD").await {
            if response.succeeded() {
                return Some(response.output.trim().to_string());
            }
        }
    }
    None
}

fn detect_package_manager(names: &[String]) -> Option<&'static str> {
    let has = |file: &str| names.iter().any(|n| n == file);
    if has("Cargo.toml") {
        Some("cargo")
    } else if has("pnpm-lock.yaml") {
        Some("pnpm")
    } else if has("yarn.lock") {
        Some("yarn")
    } else if has("package.json") {
        Some("npm")
    } else if has("uv.lock") {
        Some("uv")
    } else if has("pyproject.toml") || has("requirements.txt") {
        Some("pip")
    } else if has("go.mod") {
        Some("go")
    } else {
        None
    }
}

pub struct LocalContextMiddleware {
    context: LocalContext,
    rendered: String,
}

impl LocalContextMiddleware {
    pub fn new(context: LocalContext) -> Self {
        let rendered = context.render();
        Self { context, rendered }
    }

    pub fn context(&self) -> &LocalContext {
        &self.context
    }
}

#[async_trait]
impl AgentMiddleware for LocalContextMiddleware {
    fn id(&self) -> &str {
        "local-context"
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        ctx.request.append_prompt(&self.rendered);
        Ok(ModelDirective::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_toolkit::StateBackend;

    #[tokio::test]
    async fn detects_cargo_project_and_branch() {
        let backend = StateBackend::with_files([
            ("/Cargo.toml", "[package]"),
            ("/src/main.rs", "fn main() {}"),
            ("/.git/HEAD", "ref: refs/heads/feature/approvals\n"),
        ])
        .unwrap();

        let context = LocalContext::detect(&backend).await.with_working_dir("/work/app");
        assert_eq!(context.package_manager.as_deref(), Some("cargo"));
        assert_eq!(context.git_branch.as_deref(), Some("feature/approvals"));
        assert_eq!(context.entries, vec![".git/", "Cargo.toml", "src/"]);

        let rendered = context.render();
        assert!(rendered.contains("**Current Directory**: `/work/app`"));
        assert!(rendered.contains("**Git**: current branch `feature/approvals`"));
        assert!(rendered.contains("- src/"));
    }

    #[tokio::test]
    async fn empty_workspace_has_no_git_or_package_manager() {
        let context = LocalContext::detect(&StateBackend::new()).await;
        assert_eq!(context, LocalContext::default());
        assert!(context.render().contains("not a git repository"));
    }

    #[tokio::test]
    async fn long_listings_are_capped() {
        let files: Vec<(String, &str)> = (0..25).map(|i| (format!("/f{i:02}.txt"), "x")).collect();
        let context = LocalContext::detect(&StateBackend::with_files(files).unwrap()).await;
        assert_eq!(context.entries.len(), MAX_LISTED_ENTRIES);
        assert_eq!(context.more_entries, 5);
        assert!(context.render().ends_with("- ... (5 more)"));
    }
}
