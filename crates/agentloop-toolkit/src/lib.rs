//! Backends and built-in tools for the agentloop runtime.
//!
//! - [`backends`]: in-memory and local-directory implementations of
//!   [`Backend`](agentloop_core::backend::Backend)
//! - [`builtin`]: filesystem, shell and todo tools that go through the backend
//! - [`builder`]: turn closures into tools

pub mod backends;
pub mod builder;
pub mod builtin;

pub use agentloop_core::tools::{
    Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolRegistry, ToolSchema,
};

pub use backends::{FilesystemBackend, PathLocks, StateBackend};
pub use builder::{tool, tool_sync, ToolBuilder};
pub use builtin::{
    create_filesystem_tools, create_todos_tools, EditFileTool, ExecuteTool, LsTool,
    ReadFileTool, ReadTodosTool, WriteFileTool, WriteTodosTool,
};
