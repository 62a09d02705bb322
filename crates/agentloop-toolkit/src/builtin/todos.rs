//! Todo list tools. The list lives in `AgentState::todos` and only changes
//! through the diff returned by `write_todos`.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentloop_core::command::StateDiff;
use agentloop_core::state::{TodoItem, TodoStatus};
use agentloop_core::tools::{Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct WriteTodosTool;

#[derive(Deserialize)]
struct WriteTodosArgs {
    todos: Vec<TodoItem>,
}

#[async_trait]
impl Tool for WriteTodosTool {
    fn schema(&self) -> ToolSchema {
        let item = ToolParameterSchema::object(
            "A single todo item",
            BTreeMap::from([
                (
                    "content".to_string(),
                    ToolParameterSchema::string("What needs to be done"),
                ),
                (
                    "status".to_string(),
                    ToolParameterSchema::string("pending, in_progress or done").with_enum(vec![
                        json!("pending"),
                        json!("in_progress"),
                        json!("done"),
                    ]),
                ),
            ]),
            vec!["content".to_string(), "status".to_string()],
        );

        ToolSchema::new(
            "write_todos",
            "Replace the todo list used to plan and track multi-step work",
            ToolParameterSchema::object(
                "write_todos parameters",
                BTreeMap::from([(
                    "todos".to_string(),
                    ToolParameterSchema::array("The complete, updated todo list", item),
                )]),
                vec!["todos".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, _ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: WriteTodosArgs = serde_json::from_value(args)?;
        let message = format!("Updated todo list with {} items", args.todos.len());
        Ok(ToolOutput::with_state(message, StateDiff::todos(args.todos)))
    }
}

pub struct ReadTodosTool;

#[async_trait]
impl Tool for ReadTodosTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::no_params("read_todos", "Show the current todo list and each item's status")
    }

    async fn execute(&self, _args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let todos = ctx.state.todos();
        if todos.is_empty() {
            return Ok(ToolOutput::text("No todos found."));
        }
        Ok(ToolOutput::text(format!(
            "Current TODO list ({} items):\n{}",
            todos.len(),
            render_todos(todos)
        )))
    }
}

/// Numbered, one-line-per-item rendering used by tools and prompts.
pub fn render_todos(todos: &[TodoItem]) -> String {
    todos
        .iter()
        .enumerate()
        .map(|(i, todo)| {
            let status = match todo.status {
                TodoStatus::Pending => "[ ]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Done => "[x]",
            };
            format!("{}. {} {}", i + 1, status, todo.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn create_todos_tools() -> Vec<ToolBox> {
    vec![Arc::new(WriteTodosTool), Arc::new(ReadTodosTool)]
}
