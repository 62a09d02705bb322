use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::TodoItem;

/// A state delta emitted by a tool or a middleware stage. The execution loop
/// applies diffs in tool-call order after the turn's results are recorded.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDiff {
    /// Replaces the whole todo list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    /// Keys are upserted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StateDiff {
    pub fn todos(todos: Vec<TodoItem>) -> Self {
        Self {
            todos: Some(todos),
            ..Self::default()
        }
    }

    pub fn metadata(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(key.into(), value);
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_none() && self.metadata.is_empty()
    }

    /// Fold `other` into `self`; later values win.
    pub fn merge(&mut self, other: StateDiff) {
        if other.todos.is_some() {
            self.todos = other.todos;
        }
        self.metadata.extend(other.metadata);
    }
}
