//! Built-in tools for common agent operations

pub mod filesystem;
pub mod todos;

pub use filesystem::{
    create_filesystem_tools, EditFileTool, ExecuteTool, LsTool, ReadFileTool, WriteFileTool,
};
pub use todos::{create_todos_tools, render_todos, ReadTodosTool, WriteTodosTool};
