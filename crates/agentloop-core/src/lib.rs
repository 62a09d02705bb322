//! Core contracts and shared data model for the agentloop runtime.
//! This crate stays free of orchestration logic so backends, stores,
//! transports and model clients can depend on it without pulling in the loop.

pub mod agent;
pub mod backend;
pub mod command;
pub mod error;
pub mod events;
pub mod hitl;
pub mod llm;
pub mod messaging;
pub mod persistence;
pub mod redact;
pub mod state;
pub mod tools;
pub mod transport;

pub use agent::AgentDescriptor;
pub use backend::{Backend, ExecuteResponse, FileEntry};
pub use command::StateDiff;
pub use error::{AgentError, ApprovalError, BackendError};
pub use events::{AgentEvent, EventBroadcaster, EventDispatcher, EventMetadata};
pub use hitl::{
    ApprovalDecision, ApprovalPolicy, ApprovalRecord, ApprovalRequest, ApprovalStatus,
    DecisionKind, RiskClass,
};
pub use llm::{LanguageModel, LlmRequest, LlmResponse};
pub use messaging::{Message, MessageRole, ToolCall, ToolResult};
pub use persistence::{
    generate_thread_id, InMemorySessionStore, Session, SessionEvent, SessionStore,
    SessionSummary, ThreadId,
};
pub use state::{AgentState, TodoItem, TodoStatus};
pub use tools::{
    Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolRegistry, ToolSchema,
};
pub use transport::{AgentTransport, NullTransport};
