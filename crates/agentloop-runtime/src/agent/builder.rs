//! Fluent builder for [`DeepAgent`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agentloop_core::agent::AgentDescriptor;
use agentloop_core::backend::Backend;
use agentloop_core::events::EventDispatcher;
use agentloop_core::hitl::{ApprovalPolicy, RiskClass};
use agentloop_core::llm::LanguageModel;
use agentloop_core::persistence::SessionStore;
use agentloop_core::tools::{ToolBox, ToolRegistry};
use agentloop_core::transport::{AgentTransport, NullTransport};
use agentloop_toolkit::StateBackend;

use super::config::{DeepAgentConfig, PrebuiltSubAgent, RetryPolicy, RuntimeSettings};
use super::runtime::DeepAgent;
use crate::approval::ApprovalGate;
use crate::middleware::{
    AgentMiddleware, BasePromptMiddleware, FilesystemMiddleware, HumanInLoopMiddleware,
    LocalContext, LocalContextMiddleware, MemoryMiddleware, Middleware, MiddlewarePipeline,
    PlanningMiddleware,
};
use crate::prompts::GENERAL_PURPOSE_DESCRIPTION;
use crate::skills::{SkillIndex, SkillsMiddleware};
use crate::subagent::{
    SubAgentDispatcher, SubAgentExecutor, SubAgentMiddleware, SubAgentSpec, SubAgentUnit,
    GENERAL_PURPOSE_SUBAGENT,
};

/// Tools contributed by the planning and filesystem stages. `builtin_tools`
/// filters only these.
pub const BUILTIN_TOOL_NAMES: [&str; 7] = [
    "ls",
    "read_file",
    "write_file",
    "edit_file",
    "execute",
    "write_todos",
    "read_todos",
];

/// Builder for a deep agent with optional memory, skills, local context,
/// subagents and approval gates.
pub struct ConfigurableAgentBuilder {
    name: String,
    instructions: String,
    system_prompt_override: Option<String>,
    model: Option<Arc<dyn LanguageModel>>,
    backend: Option<Arc<dyn Backend>>,
    tools: Vec<ToolBox>,
    subagents: Vec<SubAgentSpec>,
    prebuilt_subagents: Vec<PrebuiltSubAgent>,
    auto_general_purpose: bool,
    tool_interrupts: BTreeMap<String, ApprovalPolicy>,
    builtin_tools: Option<HashSet<String>>,
    memory_sources: Vec<String>,
    skills: Option<(Arc<SkillIndex>, Option<Arc<dyn Backend>>)>,
    local_context: Option<LocalContext>,
    custom_middleware: Vec<Arc<dyn AgentMiddleware>>,
    session_store: Option<Arc<dyn SessionStore>>,
    transport: Option<Arc<dyn AgentTransport>>,
    events: Option<Arc<EventDispatcher>>,
    settings: RuntimeSettings,
}

impl ConfigurableAgentBuilder {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            name: "agent".to_string(),
            instructions: instructions.into(),
            system_prompt_override: None,
            model: None,
            backend: None,
            tools: Vec::new(),
            subagents: Vec::new(),
            prebuilt_subagents: Vec::new(),
            auto_general_purpose: true,
            tool_interrupts: BTreeMap::new(),
            builtin_tools: None,
            memory_sources: Vec::new(),
            skills: None,
            local_context: None,
            custom_middleware: Vec::new(),
            session_store: None,
            transport: None,
            events: None,
            settings: RuntimeSettings::default(),
        }
    }

    /// Name recorded with persisted sessions and used in subagent thread ids.
    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the instructions and base prompt with `prompt`. The other
    /// stages still append their fragments.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Defaults to an in-memory [`StateBackend`].
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_tool(mut self, tool: ToolBox) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = ToolBox>,
    {
        self.tools.extend(tools);
        self
    }

    /// Limit the built-in tools to `names`. Tools not in
    /// [`BUILTIN_TOOL_NAMES`] are unaffected.
    pub fn with_builtin_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builtin_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_subagent(mut self, spec: SubAgentSpec) -> Self {
        self.subagents.push(spec);
        self
    }

    pub fn with_prebuilt_subagent(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        executor: Arc<dyn SubAgentExecutor>,
    ) -> Self {
        self.prebuilt_subagents.push(PrebuiltSubAgent {
            name: name.into(),
            description: description.into(),
            executor,
        });
        self
    }

    /// Enabled by default. A subagent named `general-purpose` replaces it.
    pub fn with_auto_general_purpose(mut self, enabled: bool) -> Self {
        self.auto_general_purpose = enabled;
        self
    }

    /// Gate `tool_name` with `policy`, overriding the settings' gated set.
    pub fn with_tool_interrupt(mut self, tool_name: impl Into<String>, policy: ApprovalPolicy) -> Self {
        self.tool_interrupts.insert(tool_name.into(), policy);
        self
    }

    /// Replace the gated-tool set.
    pub fn with_gated_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = (S, RiskClass)>,
        S: Into<String>,
    {
        self.settings.gated_tools = tools.into_iter().map(|(t, r)| (t.into(), r)).collect();
        self
    }

    /// No tool requires approval.
    pub fn without_approvals(mut self) -> Self {
        self.settings.gated_tools.clear();
        self.tool_interrupts.clear();
        self
    }

    pub fn with_auto_approve(mut self, enabled: bool) -> Self {
        self.settings.auto_approve = enabled;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.settings.approval_timeout_secs = timeout.as_secs();
        self
    }

    /// Memory files (e.g. `/AGENTS.md`) read through the backend each turn.
    pub fn with_memory_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Skills read through the agent's backend.
    pub fn with_skills(mut self, index: SkillIndex) -> Self {
        self.skills = Some((Arc::new(index), None));
        self
    }

    /// Skills read through a dedicated backend, e.g. a user-level directory.
    pub fn with_skills_backend(mut self, index: SkillIndex, backend: Arc<dyn Backend>) -> Self {
        self.skills = Some((Arc::new(index), Some(backend)));
        self
    }

    /// Use [`LocalContext::detect`] to build `context`.
    pub fn with_local_context(mut self, context: LocalContext) -> Self {
        self.local_context = Some(context);
        self
    }

    /// Custom stages run after the built-in ones and before approval gating.
    pub fn with_middleware(mut self, middleware: Arc<dyn AgentMiddleware>) -> Self {
        self.custom_middleware.push(middleware);
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Defaults to [`NullTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_event_dispatcher(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.settings.max_iterations = max;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry = policy;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.settings.turn_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_subagent_timeout(mut self, timeout: Duration) -> Self {
        self.settings.subagent_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.settings.parallel_tool_calls = enabled;
        self
    }

    /// Replace all runtime settings. Later `with_*` calls still apply on top.
    pub fn with_settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> anyhow::Result<DeepAgent> {
        let model = self
            .model
            .ok_or_else(|| anyhow::anyhow!("a model is required; call with_model()"))?;
        let backend: Arc<dyn Backend> = self
            .backend
            .unwrap_or_else(|| Arc::new(StateBackend::new()));
        let skills = self.skills.map(|(index, skills_backend)| {
            let skills_backend = skills_backend.unwrap_or_else(|| backend.clone());
            (index, skills_backend)
        });

        create_deep_agent_from_config(DeepAgentConfig {
            name: self.name,
            instructions: self.instructions,
            system_prompt_override: self.system_prompt_override,
            model,
            backend,
            tools: self.tools,
            subagents: self.subagents,
            prebuilt_subagents: self.prebuilt_subagents,
            auto_general_purpose: self.auto_general_purpose,
            tool_interrupts: self.tool_interrupts,
            builtin_tools: self.builtin_tools,
            memory_sources: self.memory_sources,
            skills,
            local_context: self.local_context,
            custom_middleware: self.custom_middleware,
            session_store: self.session_store,
            transport: self.transport.unwrap_or_else(|| Arc::new(NullTransport)),
            events: self.events,
            settings: self.settings,
        })
    }
}

/// Assemble an agent, its subagents and their shared approval gate.
pub fn create_deep_agent_from_config(config: DeepAgentConfig) -> anyhow::Result<DeepAgent> {
    let gate = Arc::new(
        ApprovalGate::new(config.settings.approval_timeout(), config.settings.auto_approve)
            .with_events(config.events.clone()),
    );
    assemble(config, gate)
}

fn assemble(config: DeepAgentConfig, gate: Arc<ApprovalGate>) -> anyhow::Result<DeepAgent> {
    if config.settings.max_iterations == 0 {
        anyhow::bail!("max_iterations must be at least 1");
    }
    let policies = config.approval_policies();
    let units = build_subagents(&config, &policies, &gate)?;

    let include_builtin = |name: &str| {
        config
            .builtin_tools
            .as_ref()
            .map_or(true, |allowed| allowed.contains(name))
    };

    let mut stages = vec![Middleware::BasePrompt(
        BasePromptMiddleware::new(config.instructions.clone())
            .with_override(config.system_prompt_override.clone()),
    )];
    if !config.memory_sources.is_empty() {
        stages.push(Middleware::Memory(MemoryMiddleware::new(
            config.backend.clone(),
            config.memory_sources.clone(),
        )));
    }
    if let Some((index, skills_backend)) = &config.skills {
        stages.push(Middleware::Skills(SkillsMiddleware::new(
            index.clone(),
            skills_backend.clone(),
        )));
    }
    if let Some(context) = &config.local_context {
        stages.push(Middleware::LocalContext(LocalContextMiddleware::new(
            context.clone(),
        )));
    }
    if include_builtin("write_todos") || include_builtin("read_todos") {
        stages.push(Middleware::Planning(PlanningMiddleware::new()));
    }
    if ["ls", "read_file", "write_file", "edit_file", "execute"]
        .iter()
        .any(|name| include_builtin(name))
    {
        stages.push(Middleware::Filesystem(FilesystemMiddleware::new(
            config.backend.supports_execution(),
        )));
    }
    if !units.is_empty() {
        let dispatcher = SubAgentDispatcher::new(units, config.settings.subagent_timeout())
            .with_events(config.events.clone());
        stages.push(Middleware::SubAgents(SubAgentMiddleware::new(Arc::new(
            dispatcher,
        ))));
    }
    stages.extend(config.custom_middleware.iter().cloned().map(Middleware::Custom));
    if !policies.is_empty() {
        stages.push(Middleware::HumanInLoop(HumanInLoopMiddleware::new(policies)));
    }
    let pipeline = MiddlewarePipeline::new(stages);

    let mut registry = ToolRegistry::new();
    for tool in pipeline.tools() {
        let name = tool.schema().name;
        if BUILTIN_TOOL_NAMES.contains(&name.as_str()) && !include_builtin(&name) {
            continue;
        }
        registry.register(tool);
    }
    registry.register_all(config.tools.iter().cloned());

    tracing::debug!(
        agent = %config.name,
        stages = ?pipeline.ids(),
        tools = ?registry.names(),
        "assembled agent"
    );

    Ok(DeepAgent::from_parts(
        AgentDescriptor::new(config.name),
        config.model,
        pipeline,
        registry,
        gate,
        config.backend,
        config.session_store,
        config.transport,
        config.events,
        config.settings,
    ))
}

fn build_subagents(
    config: &DeepAgentConfig,
    policies: &BTreeMap<String, ApprovalPolicy>,
    gate: &Arc<ApprovalGate>,
) -> anyhow::Result<Vec<SubAgentUnit>> {
    let mut specs = config.subagents.clone();
    let general_purpose_taken = specs.iter().any(|s| s.name == GENERAL_PURPOSE_SUBAGENT)
        || config
            .prebuilt_subagents
            .iter()
            .any(|p| p.name == GENERAL_PURPOSE_SUBAGENT);
    if config.auto_general_purpose && !general_purpose_taken {
        specs.push(SubAgentSpec::new(
            GENERAL_PURPOSE_SUBAGENT,
            GENERAL_PURPOSE_DESCRIPTION,
            config.instructions.clone(),
        ));
    }

    let mut units = Vec::with_capacity(specs.len() + config.prebuilt_subagents.len());
    for spec in specs {
        let tools = match &spec.tools {
            Some(names) => config
                .tools
                .iter()
                .filter(|t| names.contains(&t.schema().name))
                .cloned()
                .collect(),
            None => config.tools.clone(),
        };
        let builtin_tools = match &spec.tools {
            Some(names) => Some(names.iter().cloned().collect()),
            None => config.builtin_tools.clone(),
        };
        let child = DeepAgentConfig {
            name: spec.name.clone(),
            instructions: spec.instructions.clone(),
            system_prompt_override: None,
            model: spec.model.clone().unwrap_or_else(|| config.model.clone()),
            backend: config.backend.clone(),
            tools,
            subagents: Vec::new(),
            prebuilt_subagents: Vec::new(),
            auto_general_purpose: false,
            tool_interrupts: if spec.inherit_approvals {
                policies.clone()
            } else {
                BTreeMap::new()
            },
            builtin_tools,
            memory_sources: Vec::new(),
            skills: None,
            local_context: None,
            custom_middleware: Vec::new(),
            session_store: None,
            transport: config.transport.clone(),
            events: config.events.clone(),
            settings: RuntimeSettings {
                gated_tools: BTreeMap::new(),
                ..config.settings.clone()
            },
        };
        let agent = Arc::new(assemble(child, gate.clone())?);
        units.push(SubAgentUnit::Declarative { spec, agent });
    }
    for prebuilt in &config.prebuilt_subagents {
        units.push(SubAgentUnit::Prebuilt {
            name: prebuilt.name.clone(),
            description: prebuilt.description.clone(),
            executor: prebuilt.executor.clone(),
        });
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;

    fn model() -> Arc<dyn LanguageModel> {
        Arc::new(ScriptedModel::new(vec![]))
    }

    #[test]
    fn build_requires_a_model() {
        let err = ConfigurableAgentBuilder::new("x")
            .build()
            .err()
            .expect("building without a model fails");
        assert!(err.to_string().contains("with_model"));
    }

    #[test]
    fn default_stage_order_and_tools() {
        let agent = ConfigurableAgentBuilder::new("You help with Rust.")
            .with_model(model())
            .with_memory_sources(["/AGENTS.md"])
            .with_skills(SkillIndex::new())
            .with_local_context(LocalContext::default())
            .build()
            .unwrap();

        assert_eq!(
            agent.middleware_ids(),
            vec![
                "base-prompt",
                "memory",
                "skills",
                "local-context",
                "planning",
                "filesystem",
                "subagents",
                "human-in-loop"
            ]
        );
        assert_eq!(
            agent.tool_names(),
            vec![
                "edit_file",
                "ls",
                "read_file",
                "read_skill",
                "read_todos",
                "task",
                "write_file",
                "write_todos"
            ]
        );
    }

    #[test]
    fn builtin_filter_and_no_subagents() {
        let agent = ConfigurableAgentBuilder::new("Read only.")
            .with_model(model())
            .with_builtin_tools(["read_file", "ls"])
            .with_auto_general_purpose(false)
            .without_approvals()
            .build()
            .unwrap();
        assert_eq!(agent.tool_names(), vec!["ls", "read_file"]);
        assert_eq!(agent.middleware_ids(), vec!["base-prompt", "filesystem"]);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let err = ConfigurableAgentBuilder::new("x")
            .with_model(model())
            .with_max_iterations(0)
            .build()
            .err()
            .expect("zero iterations fails");
        assert!(err.to_string().contains("max_iterations"));
    }
}
