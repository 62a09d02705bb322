//! Schema-driven tool contract and the name → handler registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::command::StateDiff;
use crate::state::AgentState;

/// JSON Schema fragment describing tool parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameterSchema {
    #[serde(rename = "type")]
    pub schema_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, ToolParameterSchema>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolParameterSchema>>,

    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParameterSchema {
    fn of_type(schema_type: &str, description: Option<String>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            description,
            properties: None,
            required: None,
            items: None,
            enum_values: None,
            default: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::of_type("string", Some(description.into()))
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::of_type("integer", Some(description.into()))
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::of_type("number", Some(description.into()))
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::of_type("boolean", Some(description.into()))
    }

    pub fn array(description: impl Into<String>, items: ToolParameterSchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of_type("array", Some(description.into()))
        }
    }

    pub fn object(
        description: impl Into<String>,
        properties: BTreeMap<String, ToolParameterSchema>,
        required: Vec<String>,
    ) -> Self {
        Self {
            properties: Some(properties),
            required: Some(required),
            ..Self::of_type("object", Some(description.into()))
        }
    }

    /// An object schema with no properties.
    pub fn empty_object() -> Self {
        Self {
            properties: Some(BTreeMap::new()),
            required: Some(Vec::new()),
            ..Self::of_type("object", None)
        }
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Name, description and parameters advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameterSchema,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn no_params(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, ToolParameterSchema::empty_object())
    }
}

/// Everything a tool handler may touch while it runs.
///
/// `state` is a snapshot taken when the batch of calls started; tools change
/// state only by returning a [`StateDiff`].
#[derive(Clone)]
pub struct ToolContext {
    pub thread_id: String,
    pub tool_call_id: String,
    pub state: Arc<AgentState>,
    pub backend: Arc<dyn Backend>,
    pub cancel: CancellationToken,
    /// Turn deadline, if the caller configured one.
    pub deadline: Option<Instant>,
}

impl ToolContext {
    pub fn new(state: Arc<AgentState>, backend: Arc<dyn Backend>) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            tool_call_id: String::new(),
            state,
            backend,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_call_id(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = tool_call_id.into();
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// What a tool handler hands back to the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
    WithState { output: String, diff: StateDiff },
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn with_state(output: impl Into<String>, diff: StateDiff) -> Self {
        Self::WithState {
            output: output.into(),
            diff,
        }
    }

    /// Split into the text recorded in history and an optional diff.
    pub fn into_parts(self) -> (String, Option<StateDiff>) {
        match self {
            Self::Text(text) => (text, None),
            Self::Json(value) => (
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                None,
            ),
            Self::WithState { output, diff } => (output, Some(diff)),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput>;
}

pub type ToolBox = Arc<dyn Tool>;

/// Maps tool names to handlers. Iteration order is by name so the schema
/// list sent to the model is stable across runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolBox>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: ToolBox) -> &mut Self {
        let name = tool.schema().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool_name = %name, "replaced previously registered tool");
        }
        self
    }

    pub fn register_all<I>(&mut self, tools: I) -> &mut Self
    where
        I: IntoIterator<Item = ToolBox>,
    {
        for tool in tools {
            self.register(tool);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolBox> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<ToolBox> {
        self.tools.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
