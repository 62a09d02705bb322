use std::collections::BTreeMap;

use agentloop_core::hitl::{ApprovalPolicy, RiskClass};
use async_trait::async_trait;

use super::{AgentMiddleware, ModelContext, ModelDirective, StageHooks, ToolCallContext, ToolDirective};
use crate::prompts::APPROVAL_SYSTEM_PROMPT;

/// Tools gated when no explicit policy set is configured.
pub fn default_interrupt_policies() -> BTreeMap<String, ApprovalPolicy> {
    [
        ("execute", RiskClass::High),
        ("write_file", RiskClass::Medium),
        ("edit_file", RiskClass::Medium),
        ("task", RiskClass::Medium),
    ]
    .into_iter()
    .map(|(tool, risk)| (tool.to_string(), ApprovalPolicy::new(risk)))
    .collect()
}

/// Requests human approval for every call to a gated tool.
pub struct HumanInLoopMiddleware {
    policies: BTreeMap<String, ApprovalPolicy>,
}

impl HumanInLoopMiddleware {
    pub fn new(policies: BTreeMap<String, ApprovalPolicy>) -> Self {
        Self { policies }
    }

    pub fn policy(&self, tool_name: &str) -> Option<&ApprovalPolicy> {
        self.policies.get(tool_name)
    }

    fn prompt_fragment(&self) -> String {
        let mut lines = vec![APPROVAL_SYSTEM_PROMPT.to_string()];
        for (tool, policy) in &self.policies {
            let risk = match policy.risk_class {
                RiskClass::Low => "low",
                RiskClass::Medium => "medium",
                RiskClass::High => "high",
            };
            match &policy.description {
                Some(description) => lines.push(format!("- {tool} ({risk} risk): {description}")),
                None => lines.push(format!("- {tool} ({risk} risk)")),
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl AgentMiddleware for HumanInLoopMiddleware {
    fn id(&self) -> &str {
        "human-in-loop"
    }

    fn hooks(&self) -> StageHooks {
        StageHooks::ALL
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        if !self.policies.is_empty() {
            ctx.request.append_prompt(&self.prompt_fragment());
        }
        Ok(ModelDirective::Continue)
    }

    async fn before_tool(&self, ctx: &ToolCallContext<'_>) -> anyhow::Result<ToolDirective> {
        Ok(match self.policies.get(&ctx.call.name) {
            Some(policy) => ToolDirective::RequestApproval(policy.clone()),
            None => ToolDirective::Continue,
        })
    }
}
