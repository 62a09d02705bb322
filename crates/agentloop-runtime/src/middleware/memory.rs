//! Injects the contents of memory files (AGENTS.md) into every model call.

use std::sync::Arc;

use agentloop_core::backend::Backend;
use async_trait::async_trait;

use super::{AgentMiddleware, ModelContext, ModelDirective};
use crate::prompts::{MEMORY_SYSTEM_PROMPT, NO_MEMORY_LOADED};

/// Reads each source through the backend on every turn so edits made by the
/// agent show up on the next model call. Missing files are skipped.
pub struct MemoryMiddleware {
    backend: Arc<dyn Backend>,
    sources: Vec<String>,
}

impl MemoryMiddleware {
    pub fn new(backend: Arc<dyn Backend>, sources: Vec<String>) -> Self {
        Self { backend, sources }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    async fn load(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut loaded = Vec::new();
        for source in &self.sources {
            match self.backend.read_to_string(source).await {
                Ok(content) if content.trim().is_empty() => {}
                Ok(content) => loaded.push((source.clone(), content)),
                Err(err) if err.is_not_found() => {
                    tracing::debug!(path = %source, "memory file not found, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(loaded)
    }
}

/// `<agent_memory>` block for the loaded sources.
pub fn render_memory(loaded: &[(String, String)]) -> String {
    let body = if loaded.is_empty() {
        NO_MEMORY_LOADED.to_string()
    } else {
        loaded
            .iter()
            .map(|(path, content)| format!("{path}\n{}", content.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!("<agent_memory>\n{body}\n</agent_memory>")
}

#[async_trait]
impl AgentMiddleware for MemoryMiddleware {
    fn id(&self) -> &str {
        "memory"
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        let loaded = self.load().await?;
        ctx.request.append_prompt(MEMORY_SYSTEM_PROMPT);
        ctx.request.append_prompt(&render_memory(&loaded));
        Ok(ModelDirective::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::ModelRequest;
    use agentloop_core::state::AgentState;
    use agentloop_toolkit::StateBackend;

    async fn prompt_for(middleware: &MemoryMiddleware) -> String {
        let mut request = ModelRequest::new(vec![], vec![]);
        let state = AgentState::new("t1");
        let mut ctx = ModelContext {
            request: &mut request,
            state: &state,
        };
        middleware.before_model(&mut ctx).await.unwrap();
        request.system_prompt
    }

    #[tokio::test]
    async fn loads_existing_sources_and_skips_missing_ones() {
        let backend = Arc::new(
            StateBackend::with_files([("/project/AGENTS.md", "Use cargo nextest.\n")]).unwrap(),
        );
        let middleware = MemoryMiddleware::new(
            backend,
            vec!["/home/AGENTS.md".into(), "/project/AGENTS.md".into()],
        );
        let prompt = prompt_for(&middleware).await;
        assert!(prompt.contains(
            "<agent_memory>\n/project/AGENTS.md\nUse cargo nextest.\n</agent_memory>"
        ));
        assert!(!prompt.contains("/home/AGENTS.md"));
    }

    #[tokio::test]
    async fn reports_when_nothing_is_loaded() {
        let middleware =
            MemoryMiddleware::new(Arc::new(StateBackend::new()), vec!["/AGENTS.md".into()]);
        let prompt = prompt_for(&middleware).await;
        assert!(prompt.ends_with("<agent_memory>\n(No memory loaded)\n</agent_memory>"));
    }

    #[tokio::test]
    async fn invalid_source_path_is_an_error() {
        let middleware =
            MemoryMiddleware::new(Arc::new(StateBackend::new()), vec!["relative.md".into()]);
        let mut request = ModelRequest::new(vec![], vec![]);
        let state = AgentState::new("t1");
        let mut ctx = ModelContext {
            request: &mut request,
            state: &state,
        };
        assert!(middleware.before_model(&mut ctx).await.is_err());
    }
}
