//! Deterministic collaborators for unit and scenario tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentloop_core::hitl::{ApprovalDecision, ApprovalRequest};
use agentloop_core::llm::{LanguageModel, LlmRequest, LlmResponse};
use agentloop_core::messaging::{Message, ToolCall};
use agentloop_core::transport::AgentTransport;
use async_trait::async_trait;
use serde_json::Value;

type Responder = dyn Fn(&LlmRequest) -> anyhow::Result<Message> + Send + Sync;

/// Replays canned responses in order, or answers through a closure.
pub struct ScriptedModel {
    script: Mutex<VecDeque<anyhow::Result<Message>>>,
    responder: Option<Box<Responder>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<anyhow::Result<Message>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            responder: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(Ok).collect())
    }

    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> anyhow::Result<Message> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let message = match &self.responder {
            Some(responder) => responder(&request),
            None => self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted"))),
        }?;
        Ok(LlmResponse { message })
    }
}

/// Assistant message requesting the given `(id, tool, arguments)` calls.
pub fn calls(calls: Vec<(&str, &str, Value)>) -> Message {
    Message::assistant_with_tool_calls(
        "",
        calls
            .into_iter()
            .map(|(id, name, args)| ToolCall::new(id, name, args))
            .collect(),
    )
}

/// Records everything the loop shows the user; optionally answers
/// approvals inline.
#[derive(Default)]
pub struct RecordingTransport {
    answer: Option<ApprovalDecision>,
    mounted: Mutex<Vec<Message>>,
    approvals: Mutex<Vec<ApprovalRequest>>,
    statuses: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn answering(decision: ApprovalDecision) -> Self {
        Self {
            answer: Some(decision),
            ..Self::default()
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn mounted(&self) -> Vec<Message> {
        self.mounted.lock().unwrap().clone()
    }

    pub fn approval_requests(&self) -> Vec<ApprovalRequest> {
        self.approvals.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentTransport for RecordingTransport {
    async fn mount_message(&self, message: &Message) {
        self.mounted.lock().unwrap().push(message.clone());
    }

    async fn request_approval(
        &self,
        request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalDecision>> {
        self.approvals.lock().unwrap().push(request.clone());
        Ok(self.answer.clone())
    }

    async fn update_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }
}
