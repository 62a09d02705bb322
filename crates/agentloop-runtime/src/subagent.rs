//! Delegation to isolated child agents through the `task` tool.
//!
//! A subagent starts from a fresh state seeded only with the task input and
//! hands a single result back to the parent. Declarative subagents are child
//! [`DeepAgent`]s built from a [`SubAgentSpec`]; prebuilt ones are any
//! [`SubAgentExecutor`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentloop_core::error::AgentError;
use agentloop_core::events::{
    AgentEvent, EventDispatcher, EventMetadata, SubAgentCompletedEvent, SubAgentStartedEvent,
};
use agentloop_core::llm::LanguageModel;
use agentloop_core::redact::{preview, MAX_PREVIEW_CHARS};
use agentloop_core::state::AgentState;
use agentloop_core::tools::{Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::DeepAgent;
use crate::middleware::{AgentMiddleware, ModelContext, ModelDirective};
use crate::prompts::TASK_SYSTEM_PROMPT;

pub const DEFAULT_SUBAGENT_TIMEOUT: Duration = Duration::from_secs(300);
pub const GENERAL_PURPOSE_SUBAGENT: &str = "general-purpose";

/// Parent-side context handed to a subagent run.
#[derive(Debug, Clone)]
pub struct DelegationContext {
    pub parent_thread_id: String,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

/// What a subagent hands back: the summarized output and, when available,
/// its isolated final state.
#[derive(Debug, Clone)]
pub struct SubagentRun {
    pub output: String,
    pub state: Option<AgentState>,
}

#[async_trait]
pub trait SubAgentExecutor: Send + Sync {
    async fn run(&self, input: &str, ctx: DelegationContext) -> anyhow::Result<SubagentRun>;
}

/// Declarative subagent definition.
#[derive(Clone)]
pub struct SubAgentSpec {
    pub name: String,
    pub description: String,
    pub instructions: String,
    /// Names of parent tools the child may use; `None` gives it all of them.
    pub tools: Option<Vec<String>>,
    /// Model override; the parent's model is used otherwise.
    pub model: Option<Arc<dyn LanguageModel>>,
    /// Whether the parent's gated-tool policies apply inside the child.
    pub inherit_approvals: bool,
}

impl SubAgentSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: instructions.into(),
            tools: None,
            model: None,
            inherit_approvals: true,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn without_approvals(mut self) -> Self {
        self.inherit_approvals = false;
        self
    }
}

pub enum SubAgentUnit {
    Declarative {
        spec: SubAgentSpec,
        agent: Arc<DeepAgent>,
    },
    Prebuilt {
        name: String,
        description: String,
        executor: Arc<dyn SubAgentExecutor>,
    },
}

impl SubAgentUnit {
    pub fn name(&self) -> &str {
        match self {
            SubAgentUnit::Declarative { spec, .. } => &spec.name,
            SubAgentUnit::Prebuilt { name, .. } => name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            SubAgentUnit::Declarative { spec, .. } => &spec.description,
            SubAgentUnit::Prebuilt { description, .. } => description,
        }
    }

    pub fn executor(&self) -> Arc<dyn SubAgentExecutor> {
        match self {
            SubAgentUnit::Declarative { agent, .. } => agent.clone() as Arc<dyn SubAgentExecutor>,
            SubAgentUnit::Prebuilt { executor, .. } => executor.clone(),
        }
    }
}

/// A finished delegation. `isolated_state` never flows back into the parent;
/// only `result` does.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub name: String,
    pub description: String,
    pub input: String,
    pub isolated_state: Option<AgentState>,
    pub result: Result<String, String>,
}

pub struct SubAgentDispatcher {
    units: BTreeMap<String, SubAgentUnit>,
    timeout: Duration,
    events: Option<Arc<EventDispatcher>>,
}

impl SubAgentDispatcher {
    pub fn new(units: Vec<SubAgentUnit>, timeout: Duration) -> Self {
        Self {
            units: units
                .into_iter()
                .map(|u| (u.name().to_string(), u))
                .collect(),
            timeout,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<Arc<EventDispatcher>>) -> Self {
        self.events = events;
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SubAgentUnit> {
        self.units.get(name)
    }

    /// Run `input` on the named subagent. Failures, timeouts and unknown
    /// names are reported in `result` and never panic the parent.
    pub async fn dispatch(&self, name: &str, input: &str, ctx: DelegationContext) -> SubagentTask {
        let Some(unit) = self.units.get(name) else {
            return SubagentTask {
                name: name.to_string(),
                description: String::new(),
                input: input.to_string(),
                isolated_state: None,
                result: Err(format!(
                    "Unknown subagent '{name}'. Available: {:?}",
                    self.names()
                )),
            };
        };

        let parent_thread = ctx.parent_thread_id.clone();
        let timeout = match ctx.deadline {
            Some(deadline) => self
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.timeout,
        };
        tracing::info!(
            thread_id = %parent_thread,
            subagent = name,
            timeout = ?timeout,
            "dispatching subagent"
        );
        self.emit(AgentEvent::SubAgentStarted(SubAgentStartedEvent {
            metadata: EventMetadata::new(&parent_thread, name),
            agent_name: name.to_string(),
            instruction_summary: preview(input, MAX_PREVIEW_CHARS),
        }));

        let started = std::time::Instant::now();
        let executor = unit.executor();
        let (result, isolated_state) =
            match tokio::time::timeout(timeout, executor.run(input, ctx)).await {
                Ok(Ok(run)) => (Ok(run.output), run.state),
                Ok(Err(err)) => {
                    let err = AgentError::SubagentFailure {
                        name: name.to_string(),
                        message: format!("{err:#}"),
                    };
                    tracing::warn!(subagent = name, error = %err, "subagent failed");
                    (Err(err.to_string()), None)
                }
                Err(_) => {
                    let err = AgentError::SubagentFailure {
                        name: name.to_string(),
                        message: format!("timed out after {}s", timeout.as_secs()),
                    };
                    tracing::warn!(subagent = name, "subagent timed out");
                    (Err(err.to_string()), None)
                }
            };

        self.emit(AgentEvent::SubAgentCompleted(SubAgentCompletedEvent {
            metadata: EventMetadata::new(&parent_thread, name),
            agent_name: name.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
            result_summary: match &result {
                Ok(output) => preview(output, MAX_PREVIEW_CHARS),
                Err(err) => preview(err, MAX_PREVIEW_CHARS),
            },
        }));

        SubagentTask {
            name: name.to_string(),
            description: unit.description().to_string(),
            input: input.to_string(),
            isolated_state,
            result,
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.dispatch(event);
        }
    }
}

/// The `task` tool.
pub struct TaskTool {
    dispatcher: Arc<SubAgentDispatcher>,
}

impl TaskTool {
    pub fn new(dispatcher: Arc<SubAgentDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[derive(Deserialize)]
struct TaskArgs {
    description: String,
    subagent_type: String,
}

#[async_trait]
impl Tool for TaskTool {
    fn schema(&self) -> ToolSchema {
        let names: Vec<Value> = self
            .dispatcher
            .names()
            .into_iter()
            .map(Value::String)
            .collect();
        ToolSchema::new(
            "task",
            "Launch a subagent with an isolated context to complete a self-contained task",
            ToolParameterSchema::object(
                "task parameters",
                BTreeMap::from([
                    (
                        "description".to_string(),
                        ToolParameterSchema::string(
                            "Complete, self-contained instructions for the subagent",
                        ),
                    ),
                    (
                        "subagent_type".to_string(),
                        ToolParameterSchema::string("Which subagent to use").with_enum(names),
                    ),
                ]),
                vec!["description".to_string(), "subagent_type".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: TaskArgs = serde_json::from_value(args)?;
        let task = self
            .dispatcher
            .dispatch(
                &args.subagent_type,
                &args.description,
                DelegationContext {
                    parent_thread_id: ctx.thread_id.clone(),
                    cancel: ctx.cancel.clone(),
                    deadline: ctx.deadline,
                },
            )
            .await;
        task.result
            .map(ToolOutput::Text)
            .map_err(|message| anyhow::anyhow!(message))
    }
}

/// Registers `task` and lists the available subagents in the prompt.
pub struct SubAgentMiddleware {
    dispatcher: Arc<SubAgentDispatcher>,
    tool: ToolBox,
}

impl SubAgentMiddleware {
    pub fn new(dispatcher: Arc<SubAgentDispatcher>) -> Self {
        let tool: ToolBox = Arc::new(TaskTool::new(dispatcher.clone()));
        Self { dispatcher, tool }
    }

    pub fn dispatcher(&self) -> &Arc<SubAgentDispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl AgentMiddleware for SubAgentMiddleware {
    fn id(&self) -> &str {
        "subagents"
    }

    fn tools(&self) -> Vec<ToolBox> {
        vec![self.tool.clone()]
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        let listing = self
            .dispatcher
            .units
            .values()
            .map(|u| format!("- {}: {}", u.name(), u.description()))
            .collect::<Vec<_>>()
            .join("\n");
        ctx.request.append_prompt(TASK_SYSTEM_PROMPT);
        ctx.request
            .append_prompt(&format!("Available subagent types:\n{listing}"));
        Ok(ModelDirective::Continue)
    }
}
