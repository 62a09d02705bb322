//! Lifecycle events for observers of the execution loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hitl::{ApprovalStatus, RiskClass};
use crate::state::{TodoItem, TodoStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted(TurnStartedEvent),
    TurnCompleted(TurnCompletedEvent),
    TurnFailed(TurnFailedEvent),
    ToolStarted(ToolStartedEvent),
    ToolCompleted(ToolCompletedEvent),
    ToolFailed(ToolFailedEvent),
    ApprovalRequested(ApprovalRequestedEvent),
    ApprovalResolved(ApprovalResolvedEvent),
    SubAgentStarted(SubAgentStartedEvent),
    SubAgentCompleted(SubAgentCompletedEvent),
    TodosUpdated(TodosUpdatedEvent),
}

impl AgentEvent {
    pub fn event_type_name(&self) -> &'static str {
        match self {
            AgentEvent::TurnStarted(_) => "turn_started",
            AgentEvent::TurnCompleted(_) => "turn_completed",
            AgentEvent::TurnFailed(_) => "turn_failed",
            AgentEvent::ToolStarted(_) => "tool_started",
            AgentEvent::ToolCompleted(_) => "tool_completed",
            AgentEvent::ToolFailed(_) => "tool_failed",
            AgentEvent::ApprovalRequested(_) => "approval_requested",
            AgentEvent::ApprovalResolved(_) => "approval_resolved",
            AgentEvent::SubAgentStarted(_) => "sub_agent_started",
            AgentEvent::SubAgentCompleted(_) => "sub_agent_completed",
            AgentEvent::TodosUpdated(_) => "todos_updated",
        }
    }

    pub fn metadata(&self) -> &EventMetadata {
        match self {
            AgentEvent::TurnStarted(e) => &e.metadata,
            AgentEvent::TurnCompleted(e) => &e.metadata,
            AgentEvent::TurnFailed(e) => &e.metadata,
            AgentEvent::ToolStarted(e) => &e.metadata,
            AgentEvent::ToolCompleted(e) => &e.metadata,
            AgentEvent::ToolFailed(e) => &e.metadata,
            AgentEvent::ApprovalRequested(e) => &e.metadata,
            AgentEvent::ApprovalResolved(e) => &e.metadata,
            AgentEvent::SubAgentStarted(e) => &e.metadata,
            AgentEvent::SubAgentCompleted(e) => &e.metadata,
            AgentEvent::TodosUpdated(e) => &e.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub thread_id: String,
    /// Tool call id, approval id or turn id the event belongs to.
    pub correlation_id: String,
    pub timestamp: String,
}

impl EventMetadata {
    pub fn new(thread_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            correlation_id: correlation_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartedEvent {
    pub metadata: EventMetadata,
    pub agent_name: String,
    pub input_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompletedEvent {
    pub metadata: EventMetadata,
    pub agent_name: String,
    pub status: String,
    pub iterations: usize,
    pub duration_ms: u64,
    pub response_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnFailedEvent {
    pub metadata: EventMetadata,
    pub agent_name: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStartedEvent {
    pub metadata: EventMetadata,
    pub tool_name: String,
    pub input_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCompletedEvent {
    pub metadata: EventMetadata,
    pub tool_name: String,
    pub duration_ms: u64,
    pub result_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFailedEvent {
    pub metadata: EventMetadata,
    pub tool_name: String,
    pub duration_ms: u64,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestedEvent {
    pub metadata: EventMetadata,
    pub request_id: String,
    pub tool_name: String,
    pub risk_class: RiskClass,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResolvedEvent {
    pub metadata: EventMetadata,
    pub request_id: String,
    pub tool_name: String,
    pub decision: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentStartedEvent {
    pub metadata: EventMetadata,
    pub agent_name: String,
    pub instruction_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentCompletedEvent {
    pub metadata: EventMetadata,
    pub agent_name: String,
    pub duration_ms: u64,
    pub success: bool,
    pub result_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodosUpdatedEvent {
    pub metadata: EventMetadata,
    pub todos: Vec<TodoItem>,
    pub pending_count: usize,
    pub in_progress_count: usize,
    pub done_count: usize,
}

impl TodosUpdatedEvent {
    pub fn new(metadata: EventMetadata, todos: Vec<TodoItem>) -> Self {
        let count = |status: TodoStatus| todos.iter().filter(|t| t.status == status).count();
        Self {
            pending_count: count(TodoStatus::Pending),
            in_progress_count: count(TodoStatus::InProgress),
            done_count: count(TodoStatus::Done),
            metadata,
            todos,
        }
    }
}

#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    fn id(&self) -> &str;

    async fn broadcast(&self, event: &AgentEvent) -> anyhow::Result<()>;

    fn should_broadcast(&self, _event: &AgentEvent) -> bool {
        true
    }
}

/// Fans events out to broadcasters without blocking the loop. A failing
/// broadcaster is logged and otherwise ignored.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    broadcasters: Vec<Arc<dyn EventBroadcaster>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broadcaster(&mut self, broadcaster: Arc<dyn EventBroadcaster>) {
        self.broadcasters.push(broadcaster);
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        self.add_broadcaster(broadcaster);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasters.is_empty()
    }

    pub fn dispatch(&self, event: AgentEvent) {
        for broadcaster in self.broadcasters.iter().cloned() {
            if !broadcaster.should_broadcast(&event) {
                continue;
            }
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = broadcaster.broadcast(&event).await {
                    tracing::warn!(
                        broadcaster_id = broadcaster.id(),
                        event_type = event.event_type_name(),
                        error = %e,
                        "Failed to broadcast event"
                    );
                }
            });
        }
    }
}
