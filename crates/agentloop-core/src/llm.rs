use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::messaging::Message;
use crate::tools::ToolSchema;

/// Everything a model client needs for one completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    /// Assistant message; `tool_calls` is populated when the model wants
    /// tools run.
    pub message: Message,
}

/// Model client contract. Provider selection, auth and wire formats live in
/// implementations outside the runtime.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse>;
}
