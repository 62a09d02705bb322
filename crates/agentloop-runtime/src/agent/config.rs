//! Configuration consumed by the builder and the execution loop.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agentloop_core::backend::Backend;
use agentloop_core::events::EventDispatcher;
use agentloop_core::hitl::{ApprovalPolicy, RiskClass};
use agentloop_core::llm::LanguageModel;
use agentloop_core::persistence::SessionStore;
use agentloop_core::tools::ToolBox;
use agentloop_core::transport::AgentTransport;
use serde::{Deserialize, Serialize};

use crate::middleware::hitl::default_interrupt_policies;
use crate::middleware::{AgentMiddleware, LocalContext};
use crate::skills::SkillIndex;
use crate::subagent::{SubAgentExecutor, SubAgentSpec};

/// Exponential backoff for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Serializable runtime knobs. Every field has a default, so a partial
/// document deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Model calls allowed per `run`.
    pub max_iterations: usize,
    pub parallel_tool_calls: bool,
    pub retry: RetryPolicy,
    pub approval_timeout_secs: u64,
    pub auto_approve: bool,
    pub subagent_timeout_secs: u64,
    /// Wall-clock bound for a whole `run`, shared by model calls, approvals
    /// and subagents.
    pub turn_timeout_secs: Option<u64>,
    /// Gated tools and their risk class.
    pub gated_tools: BTreeMap<String, RiskClass>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            parallel_tool_calls: true,
            retry: RetryPolicy::default(),
            approval_timeout_secs: 600,
            auto_approve: false,
            subagent_timeout_secs: 300,
            turn_timeout_secs: None,
            gated_tools: default_interrupt_policies()
                .into_iter()
                .map(|(tool, policy)| (tool, policy.risk_class))
                .collect(),
        }
    }
}

impl RuntimeSettings {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn subagent_timeout(&self) -> Duration {
        Duration::from_secs(self.subagent_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs.map(Duration::from_secs)
    }
}

/// A prebuilt subagent registered by name.
#[derive(Clone)]
pub struct PrebuiltSubAgent {
    pub name: String,
    pub description: String,
    pub executor: Arc<dyn SubAgentExecutor>,
}

/// Everything needed to assemble a [`DeepAgent`](super::DeepAgent).
pub struct DeepAgentConfig {
    pub name: String,
    pub instructions: String,
    pub system_prompt_override: Option<String>,
    pub model: Arc<dyn LanguageModel>,
    pub backend: Arc<dyn Backend>,
    pub tools: Vec<ToolBox>,
    pub subagents: Vec<SubAgentSpec>,
    pub prebuilt_subagents: Vec<PrebuiltSubAgent>,
    pub auto_general_purpose: bool,
    /// Policies layered over `settings.gated_tools`; an entry here wins.
    pub tool_interrupts: BTreeMap<String, ApprovalPolicy>,
    /// Restricts built-in tools to these names when set.
    pub builtin_tools: Option<HashSet<String>>,
    pub memory_sources: Vec<String>,
    pub skills: Option<(Arc<SkillIndex>, Arc<dyn Backend>)>,
    pub local_context: Option<LocalContext>,
    pub custom_middleware: Vec<Arc<dyn AgentMiddleware>>,
    pub session_store: Option<Arc<dyn SessionStore>>,
    pub transport: Arc<dyn AgentTransport>,
    pub events: Option<Arc<EventDispatcher>>,
    pub settings: RuntimeSettings,
}

impl DeepAgentConfig {
    /// Effective approval policy per gated tool.
    pub fn approval_policies(&self) -> BTreeMap<String, ApprovalPolicy> {
        let mut policies: BTreeMap<String, ApprovalPolicy> = self
            .settings
            .gated_tools
            .iter()
            .map(|(tool, risk)| (tool.clone(), ApprovalPolicy::new(*risk)))
            .collect();
        policies.extend(self.tool_interrupts.clone());
        policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(8_000));
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: RuntimeSettings =
            serde_json::from_str(r#"{"max_iterations": 5, "retry": {"max_retries": 1}}"#).unwrap();
        assert_eq!(settings.max_iterations, 5);
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.retry.initial_backoff_ms, 500);
        assert!(settings.parallel_tool_calls);
        assert_eq!(settings.gated_tools.get("execute"), Some(&RiskClass::High));
        assert_eq!(settings.approval_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn settings_load_from_yaml() {
        let settings: RuntimeSettings = serde_yaml::from_str(
            "auto_approve: true\nturn_timeout_secs: 120\ngated_tools:\n  execute: high\n",
        )
        .unwrap();
        assert!(settings.auto_approve);
        assert_eq!(settings.turn_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(settings.gated_tools.len(), 1);
    }
}
