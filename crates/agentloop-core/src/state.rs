use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::StateDiff;
use crate::hitl::ApprovalRecord;
use crate::messaging::{Message, MessageRole, ToolCall};
use crate::persistence::SessionEvent;

/// Conversation state for one thread.
///
/// The message log only grows. Everything else changes through
/// [`SessionEvent`]s so that folding a persisted log reproduces the state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub thread_id: String,
    messages: Vec<Message>,
    #[serde(default)]
    todos: Vec<TodoItem>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    approvals: Vec<ApprovalRecord>,
}

impl AgentState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Self::default()
        }
    }

    /// Rebuild a state by folding an event log.
    pub fn replay<'a>(
        thread_id: impl Into<String>,
        events: impl IntoIterator<Item = &'a SessionEvent>,
    ) -> Self {
        let mut state = Self::new(thread_id);
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Message(message) => self.messages.push(message.clone()),
            SessionEvent::Todos(todos) => self.todos = todos.clone(),
            SessionEvent::Metadata { key, value } => {
                self.metadata.insert(key.clone(), value.clone());
            }
            SessionEvent::Approval(record) => self.approvals.push(record.clone()),
        }
    }

    /// Append a message and return the event describing the change.
    pub fn append(&mut self, message: Message) -> SessionEvent {
        let event = SessionEvent::Message(message);
        self.apply(&event);
        event
    }

    /// Replace the todo list.
    pub fn set_todos(&mut self, todos: Vec<TodoItem>) -> SessionEvent {
        let event = SessionEvent::Todos(todos);
        self.apply(&event);
        event
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) -> SessionEvent {
        let event = SessionEvent::Metadata {
            key: key.into(),
            value,
        };
        self.apply(&event);
        event
    }

    pub fn record_approval(&mut self, record: ApprovalRecord) -> SessionEvent {
        let event = SessionEvent::Approval(record);
        self.apply(&event);
        event
    }

    /// Apply a tool-produced diff, returning one event per changed field.
    pub fn apply_diff(&mut self, diff: StateDiff) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if let Some(todos) = diff.todos {
            events.push(SessionEvent::Todos(todos));
        }
        for (key, value) in diff.metadata {
            events.push(SessionEvent::Metadata { key, value });
        }
        for event in &events {
            self.apply(event);
        }
        events
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn approvals(&self) -> &[ApprovalRecord] {
        &self.approvals
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
    }

    /// Assistant tool calls that have no matching tool message yet, in log
    /// order. A thread interrupted mid-turn leaves these behind.
    pub fn dangling_tool_calls(&self) -> Vec<ToolCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    #[serde(alias = "completed")]
    Done,
}

impl TodoItem {
    pub fn pending(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: TodoStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ToolResult;
    use serde_json::json;

    #[test]
    fn dangling_calls_ignore_answered_ones() {
        let mut state = AgentState::new("t1");
        state.append(Message::user("go"));
        state.append(Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCall::new("a", "ls", json!({})),
                ToolCall::new("b", "read_file", json!({"file_path": "/x"})),
            ],
        ));
        state.append(ToolResult::success("a", "x").to_message("ls"));

        let dangling = state.dangling_tool_calls();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].id, "b");
    }

    #[test]
    fn replay_reproduces_state() {
        let mut state = AgentState::new("t1");
        let mut log = vec![state.append(Message::user("hi"))];
        log.extend(state.apply_diff(StateDiff {
            todos: Some(vec![TodoItem::pending("write docs")]),
            metadata: [("k".to_string(), json!(1))].into_iter().collect(),
        }));
        log.push(state.append(Message::assistant("done")));

        assert_eq!(AgentState::replay("t1", &log), state);
    }

    #[test]
    fn setters_emit_events_that_replay_to_the_same_state() {
        let mut state = AgentState::new("t1");
        let log = vec![
            state.set_todos(vec![TodoItem::pending("ship")]),
            state.set_metadata("branch", json!("main")),
            state.set_todos(Vec::new()),
        ];

        let replayed = AgentState::replay("t1", &log);
        assert!(replayed.todos().is_empty());
        assert_eq!(replayed.metadata()["branch"], json!("main"));
        assert_eq!(replayed, state);
    }

    #[test]
    fn completed_status_is_accepted_as_done() {
        let item: TodoItem =
            serde_json::from_value(json!({"content": "x", "status": "completed"})).unwrap();
        assert_eq!(item.status, TodoStatus::Done);
        assert_eq!(serde_json::to_value(item.status).unwrap(), json!("done"));
    }
}
