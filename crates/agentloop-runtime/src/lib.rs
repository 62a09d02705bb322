//! Tokio-powered execution loop for agentloop agents.
//!
//! A [`DeepAgent`] runs turns through an ordered middleware pipeline, gates
//! risky tool calls behind human approval, delegates work to isolated
//! subagents and appends every change to a session store.

pub mod agent;
pub mod approval;
pub mod middleware;
pub mod prompts;
pub mod skills;
pub mod subagent;

#[cfg(test)]
mod test_support;

pub use agent::{
    create_deep_agent_from_config, ConfigurableAgentBuilder, DeepAgent, DeepAgentConfig,
    PrebuiltSubAgent, RetryPolicy, RuntimeSettings, TurnOutcome, TurnStatus,
};
pub use approval::{describe_tool_call, ApprovalGate, ApprovalOutcome, DEFAULT_APPROVAL_TIMEOUT};
pub use middleware::{
    AgentMiddleware, HumanInLoopMiddleware, LocalContext, LocalContextMiddleware,
    MemoryMiddleware, Middleware, MiddlewarePipeline, ModelContext, ModelDirective, ModelRequest,
    StageHooks, ToolCallContext, ToolDirective,
};
pub use skills::{SkillIndex, SkillMetadata, SkillScope, SkillSource, SkillsMiddleware};
pub use subagent::{
    DelegationContext, SubAgentDispatcher, SubAgentExecutor, SubAgentSpec, SubAgentUnit,
    SubagentRun, SubagentTask, DEFAULT_SUBAGENT_TIMEOUT, GENERAL_PURPOSE_SUBAGENT,
};
