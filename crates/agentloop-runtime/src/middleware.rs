//! Ordered interceptors around model calls and tool calls.
//!
//! A [`MiddlewarePipeline`] is a fixed list of [`Middleware`] stages built
//! once from configuration. Stages run in list order at two extension
//! points: before every model call and around every tool call. A stage that
//! returns a terminal directive stops the stages after it for that event.

use std::sync::Arc;

use agentloop_core::command::StateDiff;
use agentloop_core::error::AgentError;
use agentloop_core::hitl::ApprovalPolicy;
use agentloop_core::llm::LlmRequest;
use agentloop_core::messaging::{Message, ToolCall, ToolResult};
use agentloop_core::state::AgentState;
use agentloop_core::tools::{ToolBox, ToolSchema};
use agentloop_toolkit::builtin::{create_filesystem_tools, create_todos_tools, render_todos};
use async_trait::async_trait;
use serde_json::Value;

use crate::prompts::{
    BASE_AGENT_PROMPT, EXECUTE_SYSTEM_PROMPT, FILESYSTEM_SYSTEM_PROMPT,
    WRITE_TODOS_SYSTEM_PROMPT,
};
use crate::skills::SkillsMiddleware;
use crate::subagent::SubAgentMiddleware;

pub mod hitl;
pub mod local_context;
pub mod memory;

pub use hitl::HumanInLoopMiddleware;
pub use local_context::{LocalContext, LocalContextMiddleware};
pub use memory::MemoryMiddleware;

/// Request sent to the model. Stages can extend the system prompt or adjust
/// the message list before the call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>, tools: Vec<ToolSchema>) -> Self {
        Self {
            system_prompt: String::new(),
            messages,
            tools,
        }
    }

    pub fn append_prompt(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if !self.system_prompt.is_empty() {
            self.system_prompt.push_str("\n\n");
        }
        self.system_prompt.push_str(fragment);
    }

    pub fn into_llm_request(self) -> LlmRequest {
        LlmRequest {
            system_prompt: self.system_prompt,
            messages: self.messages,
            tools: self.tools,
        }
    }
}

pub struct ModelContext<'a> {
    pub request: &'a mut ModelRequest,
    pub state: &'a AgentState,
}

/// A single tool call seen by the around-tool hooks, with the rest of the
/// batch the model requested in the same turn.
pub struct ToolCallContext<'a> {
    pub call: &'a ToolCall,
    pub turn_calls: &'a [ToolCall],
    pub state: &'a AgentState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelDirective {
    Continue,
    /// End the turn without calling the model.
    Halt { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolDirective {
    Continue,
    /// Suspend the call until a human decides.
    RequestApproval(ApprovalPolicy),
    /// Skip the handler and record this result instead.
    Respond(ToolResult),
}

/// Extension points a stage participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageHooks {
    pub before_model: bool,
    pub around_tool: bool,
}

impl StageHooks {
    pub const MODEL: Self = Self {
        before_model: true,
        around_tool: false,
    };
    pub const ALL: Self = Self {
        before_model: true,
        around_tool: true,
    };
}

#[async_trait]
pub trait AgentMiddleware: Send + Sync {
    fn id(&self) -> &str;

    fn hooks(&self) -> StageHooks {
        StageHooks::MODEL
    }

    /// Tools this stage contributes to the agent's registry.
    fn tools(&self) -> Vec<ToolBox> {
        Vec::new()
    }

    async fn before_model(&self, _ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        Ok(ModelDirective::Continue)
    }

    async fn before_tool(&self, _ctx: &ToolCallContext<'_>) -> anyhow::Result<ToolDirective> {
        Ok(ToolDirective::Continue)
    }

    async fn after_tool(
        &self,
        _ctx: &ToolCallContext<'_>,
        _result: &mut ToolResult,
    ) -> anyhow::Result<Option<StateDiff>> {
        Ok(None)
    }
}

/// Appends the agent's instructions and the base prompt.
pub struct BasePromptMiddleware {
    instructions: String,
    system_prompt_override: Option<String>,
}

impl BasePromptMiddleware {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            system_prompt_override: None,
        }
    }

    /// Use `prompt` verbatim instead of instructions plus the base prompt.
    pub fn with_override(mut self, prompt: Option<String>) -> Self {
        self.system_prompt_override = prompt;
        self
    }
}

#[async_trait]
impl AgentMiddleware for BasePromptMiddleware {
    fn id(&self) -> &str {
        "base-prompt"
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        match &self.system_prompt_override {
            Some(prompt) => ctx.request.append_prompt(prompt),
            None => {
                ctx.request.append_prompt(&self.instructions);
                ctx.request.append_prompt(BASE_AGENT_PROMPT);
            }
        }
        Ok(ModelDirective::Continue)
    }
}

pub struct PlanningMiddleware {
    tools: Vec<ToolBox>,
}

impl PlanningMiddleware {
    pub fn new() -> Self {
        Self {
            tools: create_todos_tools(),
        }
    }
}

impl Default for PlanningMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentMiddleware for PlanningMiddleware {
    fn id(&self) -> &str {
        "planning"
    }

    fn hooks(&self) -> StageHooks {
        StageHooks::ALL
    }

    fn tools(&self) -> Vec<ToolBox> {
        self.tools.clone()
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        ctx.request.append_prompt(WRITE_TODOS_SYSTEM_PROMPT);
        if !ctx.state.todos().is_empty() {
            ctx.request.append_prompt(&format!(
                "Current todo list:\n{}",
                render_todos(ctx.state.todos())
            ));
        }
        Ok(ModelDirective::Continue)
    }

    async fn before_tool(&self, ctx: &ToolCallContext<'_>) -> anyhow::Result<ToolDirective> {
        if ctx.call.name != "write_todos" {
            return Ok(ToolDirective::Continue);
        }
        let writes = ctx
            .turn_calls
            .iter()
            .filter(|c| c.name == "write_todos")
            .count();
        if writes > 1 {
            return Ok(ToolDirective::Respond(ToolResult::failure(
                ctx.call.id.clone(),
                "Error: The `write_todos` tool should never be called multiple times in parallel. \
                 Please call it only once per model invocation to update the todo list.",
            )));
        }
        Ok(ToolDirective::Continue)
    }
}

/// Metadata key holding the sorted list of paths written or edited in the thread.
pub const FILES_TOUCHED_KEY: &str = "files_touched";

pub struct FilesystemMiddleware {
    include_execute: bool,
    tools: Vec<ToolBox>,
}

impl FilesystemMiddleware {
    pub fn new(include_execute: bool) -> Self {
        Self {
            include_execute,
            tools: create_filesystem_tools(include_execute),
        }
    }
}

#[async_trait]
impl AgentMiddleware for FilesystemMiddleware {
    fn id(&self) -> &str {
        "filesystem"
    }

    fn hooks(&self) -> StageHooks {
        StageHooks::ALL
    }

    fn tools(&self) -> Vec<ToolBox> {
        self.tools.clone()
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        ctx.request.append_prompt(FILESYSTEM_SYSTEM_PROMPT);
        if self.include_execute {
            ctx.request.append_prompt(EXECUTE_SYSTEM_PROMPT);
        }
        Ok(ModelDirective::Continue)
    }

    async fn after_tool(
        &self,
        ctx: &ToolCallContext<'_>,
        result: &mut ToolResult,
    ) -> anyhow::Result<Option<StateDiff>> {
        if result.is_error() || !matches!(ctx.call.name.as_str(), "write_file" | "edit_file") {
            return Ok(None);
        }
        let Some(path) = ctx.call.arguments.get("file_path").and_then(Value::as_str) else {
            return Ok(None);
        };

        let mut touched: Vec<String> = ctx
            .state
            .metadata()
            .get(FILES_TOUCHED_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if touched.iter().any(|p| p == path) {
            return Ok(None);
        }
        touched.push(path.to_string());
        touched.sort();
        Ok(Some(StateDiff::metadata(
            FILES_TOUCHED_KEY,
            serde_json::to_value(touched)?,
        )))
    }
}

/// One pipeline stage.
pub enum Middleware {
    BasePrompt(BasePromptMiddleware),
    Memory(MemoryMiddleware),
    Skills(SkillsMiddleware),
    LocalContext(LocalContextMiddleware),
    Planning(PlanningMiddleware),
    Filesystem(FilesystemMiddleware),
    SubAgents(SubAgentMiddleware),
    HumanInLoop(HumanInLoopMiddleware),
    Custom(Arc<dyn AgentMiddleware>),
}

impl Middleware {
    pub fn stage(&self) -> &dyn AgentMiddleware {
        match self {
            Middleware::BasePrompt(m) => m as &dyn AgentMiddleware,
            Middleware::Memory(m) => m,
            Middleware::Skills(m) => m,
            Middleware::LocalContext(m) => m,
            Middleware::Planning(m) => m,
            Middleware::Filesystem(m) => m,
            Middleware::SubAgents(m) => m,
            Middleware::HumanInLoop(m) => m,
            Middleware::Custom(m) => m.as_ref(),
        }
    }

    pub fn id(&self) -> &str {
        self.stage().id()
    }
}

/// Immutable, ordered list of stages.
pub struct MiddlewarePipeline {
    stages: Vec<Middleware>,
}

impl MiddlewarePipeline {
    pub fn new(stages: Vec<Middleware>) -> Self {
        Self { stages }
    }

    pub fn ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Tools contributed by every stage, in stage order.
    pub fn tools(&self) -> Vec<ToolBox> {
        self.stages.iter().flat_map(|s| s.stage().tools()).collect()
    }

    /// Run the before-model hooks. An error from any stage fails the turn.
    pub async fn before_model(
        &self,
        request: &mut ModelRequest,
        state: &AgentState,
    ) -> Result<ModelDirective, AgentError> {
        for middleware in &self.stages {
            let stage = middleware.stage();
            if !stage.hooks().before_model {
                continue;
            }
            let mut ctx = ModelContext {
                request: &mut *request,
                state,
            };
            let directive = stage
                .before_model(&mut ctx)
                .await
                .map_err(|source| AgentError::Middleware {
                    stage: stage.id().to_string(),
                    source,
                })?;
            if let ModelDirective::Halt { reason } = directive {
                tracing::info!(stage = stage.id(), %reason, "middleware halted the turn");
                return Ok(ModelDirective::Halt { reason });
            }
        }
        Ok(ModelDirective::Continue)
    }

    /// First non-`Continue` directive from the around-tool stages at or after
    /// `from`, with the index of the stage that produced it.
    ///
    /// After an approval the caller resumes at `index + 1` so later stages
    /// see the approved (possibly edited) call.
    pub async fn next_tool_directive(
        &self,
        ctx: &ToolCallContext<'_>,
        from: usize,
    ) -> Result<Option<(usize, ToolDirective)>, AgentError> {
        for (index, middleware) in self.stages.iter().enumerate().skip(from) {
            let stage = middleware.stage();
            if !stage.hooks().around_tool {
                continue;
            }
            let directive = stage
                .before_tool(ctx)
                .await
                .map_err(|source| AgentError::Middleware {
                    stage: stage.id().to_string(),
                    source,
                })?;
            if directive != ToolDirective::Continue {
                tracing::debug!(
                    stage = stage.id(),
                    tool_name = %ctx.call.name,
                    tool_call_id = %ctx.call.id,
                    "tool call intercepted"
                );
                return Ok(Some((index, directive)));
            }
        }
        Ok(None)
    }

    /// Run the after-tool hooks in order. A failing stage turns the result
    /// into an error result and stops the remaining stages.
    pub async fn after_tool(
        &self,
        ctx: &ToolCallContext<'_>,
        result: &mut ToolResult,
    ) -> Option<StateDiff> {
        let mut combined: Option<StateDiff> = None;
        for middleware in &self.stages {
            let stage = middleware.stage();
            if !stage.hooks().around_tool {
                continue;
            }
            match stage.after_tool(ctx, result).await {
                Ok(Some(diff)) => match combined.as_mut() {
                    Some(existing) => existing.merge(diff),
                    None => combined = Some(diff),
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        stage = stage.id(),
                        tool_call_id = %ctx.call.id,
                        error = %err,
                        "after_tool hook failed"
                    );
                    *result = ToolResult::failure(
                        ctx.call.id.clone(),
                        AgentError::Middleware {
                            stage: stage.id().to_string(),
                            source: err,
                        }
                        .to_string(),
                    );
                    break;
                }
            }
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_core::state::TodoItem;
    use serde_json::json;

    struct Halter;

    #[async_trait]
    impl AgentMiddleware for Halter {
        fn id(&self) -> &str {
            "halter"
        }

        async fn before_model(&self, _ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
            Ok(ModelDirective::Halt {
                reason: "budget exhausted".into(),
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentMiddleware for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        async fn before_model(&self, _ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
            anyhow::bail!("memory store offline")
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    #[tokio::test]
    async fn stages_append_prompts_in_order() {
        let pipeline = MiddlewarePipeline::new(vec![
            Middleware::BasePrompt(BasePromptMiddleware::new("You review code.")),
            Middleware::Planning(PlanningMiddleware::new()),
        ]);
        let mut state = AgentState::new("t1");
        state.set_todos(vec![TodoItem::pending("Read the diff")]);
        let mut request = ModelRequest::new(vec![], vec![]);

        let directive = pipeline.before_model(&mut request, &state).await.unwrap();
        assert_eq!(directive, ModelDirective::Continue);
        assert!(request.system_prompt.starts_with("You review code."));
        let base = request.system_prompt.find(BASE_AGENT_PROMPT).unwrap();
        let todos = request.system_prompt.find("## Todo list").unwrap();
        assert!(base < todos);
        assert!(request.system_prompt.ends_with("1. [ ] Read the diff"));
        assert_eq!(pipeline.ids(), vec!["base-prompt", "planning"]);
    }

    #[tokio::test]
    async fn halt_short_circuits_later_stages() {
        let pipeline = MiddlewarePipeline::new(vec![
            Middleware::Custom(Arc::new(Halter)),
            Middleware::BasePrompt(BasePromptMiddleware::new("never appended")),
        ]);
        let mut request = ModelRequest::new(vec![], vec![]);
        let directive = pipeline
            .before_model(&mut request, &AgentState::new("t1"))
            .await
            .unwrap();
        assert!(matches!(directive, ModelDirective::Halt { .. }));
        assert!(request.system_prompt.is_empty());
    }

    #[tokio::test]
    async fn before_model_error_names_the_stage() {
        let pipeline = MiddlewarePipeline::new(vec![Middleware::Custom(Arc::new(Failing))]);
        let mut request = ModelRequest::new(vec![], vec![]);
        let err = pipeline
            .before_model(&mut request, &AgentState::new("t1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Middleware 'failing' failed: memory store offline"
        );
    }

    #[tokio::test]
    async fn parallel_write_todos_are_rejected() {
        let pipeline = MiddlewarePipeline::new(vec![Middleware::Planning(PlanningMiddleware::new())]);
        let state = AgentState::new("t1");
        let calls = vec![
            call("a", "write_todos", json!({"todos": []})),
            call("b", "write_todos", json!({"todos": []})),
        ];
        for c in &calls {
            let ctx = ToolCallContext {
                call: c,
                turn_calls: &calls,
                state: &state,
            };
            let (_, directive) = pipeline.next_tool_directive(&ctx, 0).await.unwrap().unwrap();
            match directive {
                ToolDirective::Respond(result) => {
                    assert!(result.is_error());
                    assert_eq!(result.tool_call_id, c.id);
                }
                other => panic!("unexpected directive {other:?}"),
            }
        }

        let single = vec![call("c", "write_todos", json!({"todos": []}))];
        let ctx = ToolCallContext {
            call: &single[0],
            turn_calls: &single,
            state: &state,
        };
        assert!(pipeline.next_tool_directive(&ctx, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filesystem_stage_tracks_touched_paths() {
        let stage = FilesystemMiddleware::new(false);
        let mut state = AgentState::new("t1");
        state.set_metadata(FILES_TOUCHED_KEY, json!(["/b.md"]));
        let write = call("w", "write_file", json!({"file_path": "/a.md", "content": "x"}));
        let calls = vec![write.clone()];
        let ctx = ToolCallContext {
            call: &write,
            turn_calls: &calls,
            state: &state,
        };

        let mut ok = ToolResult::success("w", "Updated file /a.md");
        let diff = stage.after_tool(&ctx, &mut ok).await.unwrap().unwrap();
        assert_eq!(diff.metadata[FILES_TOUCHED_KEY], json!(["/a.md", "/b.md"]));

        let mut failed = ToolResult::failure("w", "already exists");
        assert!(stage.after_tool(&ctx, &mut failed).await.unwrap().is_none());
    }

    #[test]
    fn filesystem_tools_follow_execute_support() {
        let names: Vec<String> = FilesystemMiddleware::new(true)
            .tools()
            .iter()
            .map(|t| t.schema().name)
            .collect();
        assert!(names.contains(&"execute".to_string()));
        assert_eq!(FilesystemMiddleware::new(false).tools().len(), 4);
    }
}
