//! Human-in-the-loop approval types shared by the runtime and transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::ToolCall;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

/// What a human decided about a gated tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Run the call with `arguments` in place of the model's arguments.
    Edit { arguments: Value },
}

impl ApprovalDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: Some(reason.into()),
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::Approve => DecisionKind::Approve,
            Self::Reject { .. } => DecisionKind::Reject,
            Self::Edit { .. } => DecisionKind::Edit,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
    Edit,
}

impl DecisionKind {
    pub fn all() -> Vec<DecisionKind> {
        vec![Self::Approve, Self::Reject, Self::Edit]
    }
}

/// Lifecycle position of an [`ApprovalRequest`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Edited,
}

/// Per-tool gating policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalPolicy {
    pub risk_class: RiskClass,
    #[serde(default = "DecisionKind::all")]
    pub allowed_decisions: Vec<DecisionKind>,
    /// Extra text shown to the reviewer before the generated summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ApprovalPolicy {
    pub fn new(risk_class: RiskClass) -> Self {
        Self {
            risk_class,
            allowed_decisions: DecisionKind::all(),
            description: None,
        }
    }

    pub fn with_allowed_decisions(mut self, decisions: Vec<DecisionKind>) -> Self {
        self.allowed_decisions = decisions;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A gated tool call waiting for (or resolved by) a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub thread_id: String,
    pub tool_call: ToolCall,
    pub risk_class: RiskClass,
    pub description: String,
    pub allowed_decisions: Vec<DecisionKind>,
    pub decision: ApprovalStatus,
    /// Arguments supplied by an `edit` decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn allows(&self, decision: &ApprovalDecision) -> bool {
        self.allowed_decisions.contains(&decision.kind())
    }
}

/// Audit entry written once per resolved approval request.
///
/// `original_arguments` is always what the model asked for; an edit shows up
/// only in `executed_arguments`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRecord {
    pub request_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub original_arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_arguments: Option<Value>,
    pub decision: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}
