//! Contract for whatever presents the agent to a person (CLI, TUI, chat bot).

use async_trait::async_trait;

use crate::hitl::{ApprovalDecision, ApprovalRequest};
use crate::messaging::Message;

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn mount_message(&self, message: &Message);

    /// Present a gated tool call to the user.
    ///
    /// A transport that can answer inline returns `Some(decision)`. One that
    /// answers later returns `None` and calls
    /// `ApprovalGate::resolve(request.id, decision)` when the user responds.
    async fn request_approval(
        &self,
        request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalDecision>>;

    async fn update_status(&self, status: &str);
}

/// Transport for headless runs: renders nothing and defers every approval to
/// out-of-band resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl AgentTransport for NullTransport {
    async fn mount_message(&self, _message: &Message) {}

    async fn request_approval(
        &self,
        _request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalDecision>> {
        Ok(None)
    }

    async fn update_status(&self, _status: &str) {}
}
