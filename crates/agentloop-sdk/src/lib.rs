//! # agentloop
//!
//! Build tool-calling agents whose risky actions wait for human approval,
//! whose heavy lifting can be delegated to isolated subagents, and whose
//! threads survive restarts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agentloop_sdk::prelude::*;
//! use serde_json::Value;
//!
//! # async fn run(model: Arc<dyn LanguageModel>) -> anyhow::Result<()> {
//! let greet = tool_sync(
//!     "greet",
//!     "Greets a person by name",
//!     ToolParameterSchema::empty_object(),
//!     |args: Value, _ctx| {
//!         let name = args.get("name").and_then(Value::as_str).unwrap_or("World");
//!         Ok(ToolOutput::text(format!("Hello, {name}!")))
//!     },
//! );
//!
//! let agent = ConfigurableAgentBuilder::new("You are a helpful assistant.")
//!     .with_model(model)
//!     .with_tool(greet)
//!     .with_session_store(Arc::new(InMemorySessionStore::new()))
//!     .build()?;
//!
//! let outcome = agent.run(&generate_thread_id(), "Please greet Alice").await?;
//! println!("{:?}", outcome.final_text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `toolkit` (default): in-memory and local-directory backends, built-in
//!   filesystem and todo tools, closure tools
//! - `persistence`: JSONL file session store
//! - `redis`: Redis session store (implies `persistence`)
//! - `full`: everything

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Re-export core functionality (always available)
pub use agentloop_core::{
    backend, error, events, hitl, llm, messaging, persistence, redact, state, tools, transport,
};
pub use agentloop_runtime::{
    approval, create_deep_agent_from_config, middleware, skills, subagent,
    ConfigurableAgentBuilder, DeepAgent, DeepAgentConfig, RetryPolicy, RuntimeSettings,
    TurnOutcome, TurnStatus,
};

#[cfg(feature = "toolkit")]
#[cfg_attr(docsrs, doc(cfg(feature = "toolkit")))]
pub use agentloop_toolkit as toolkit;

#[cfg(feature = "persistence")]
#[cfg_attr(docsrs, doc(cfg(feature = "persistence")))]
pub use agentloop_persistence::FileSessionStore;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use agentloop_persistence::{RedisSessionStore, RedisSessionStoreBuilder};

/// Prelude module for common imports
///
/// ```rust
/// use agentloop_sdk::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use agentloop_core::backend::Backend;
    pub use agentloop_core::error::{AgentError, ApprovalError, BackendError};
    pub use agentloop_core::events::{AgentEvent, EventBroadcaster, EventDispatcher};
    pub use agentloop_core::hitl::{ApprovalDecision, ApprovalPolicy, ApprovalRequest, RiskClass};
    pub use agentloop_core::llm::{LanguageModel, LlmRequest, LlmResponse};
    pub use agentloop_core::messaging::{Message, MessageRole, ToolCall, ToolResult};
    pub use agentloop_core::persistence::{
        generate_thread_id, InMemorySessionStore, SessionStore, ThreadId,
    };
    pub use agentloop_core::state::{AgentState, TodoItem, TodoStatus};
    pub use agentloop_core::tools::{
        Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema,
    };
    pub use agentloop_core::transport::{AgentTransport, NullTransport};

    // Runtime essentials
    pub use agentloop_runtime::{
        AgentMiddleware, ConfigurableAgentBuilder, DeepAgent, SkillIndex, SubAgentExecutor,
        SubAgentSpec, TurnOutcome, TurnStatus,
    };

    // Toolkit utilities (when available)
    #[cfg(feature = "toolkit")]
    pub use agentloop_toolkit::{tool, tool_sync, FilesystemBackend, StateBackend};

    #[cfg(feature = "persistence")]
    pub use agentloop_persistence::FileSessionStore;
}
