//! Human approval for gated tool calls.
//!
//! [`ApprovalGate::request`] suspends a call until a decision arrives from the
//! transport (inline), from [`ApprovalGate::resolve`] (out of band), or until
//! the timeout, turn deadline or cancellation ends the wait. Every outcome
//! produces an [`ApprovalRecord`] for the thread's audit log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentloop_core::error::{AgentError, ApprovalError};
use agentloop_core::events::{
    AgentEvent, ApprovalRequestedEvent, ApprovalResolvedEvent, EventDispatcher, EventMetadata,
};
use agentloop_core::hitl::{
    ApprovalDecision, ApprovalPolicy, ApprovalRecord, ApprovalRequest, ApprovalStatus,
};
use agentloop_core::messaging::{ToolCall, ToolResult};
use agentloop_core::transport::AgentTransport;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of gating one tool call.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// The call to execute; carries edited arguments after an edit decision.
    pub call: ToolCall,
    pub record: ApprovalRecord,
}

impl ApprovalOutcome {
    pub fn status(&self) -> ApprovalStatus {
        self.record.decision
    }

    pub fn is_rejected(&self) -> bool {
        self.record.decision == ApprovalStatus::Rejected
    }

    /// Error result recorded in place of a rejected call.
    pub fn rejection_result(&self) -> Option<ToolResult> {
        if !self.is_rejected() {
            return None;
        }
        let reason = self.record.reason.as_deref().unwrap_or("Rejected by user");
        Some(ToolResult::failure(
            self.call.id.clone(),
            format!("Tool call '{}' was rejected: {reason}", self.call.name),
        ))
    }
}

enum Resolution {
    Decided(ApprovalDecision),
    Refused(String),
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

type PendingMap = Mutex<HashMap<String, PendingApproval>>;

/// Removes the pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Suspend/resume state machine for approval requests, keyed by request id.
/// Shared by a parent agent and its subagents.
pub struct ApprovalGate {
    timeout: Duration,
    auto_approve: bool,
    pending: PendingMap,
    events: Option<Arc<EventDispatcher>>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration, auto_approve: bool) -> Self {
        Self {
            timeout,
            auto_approve,
            pending: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<Arc<EventDispatcher>>) -> Self {
        self.events = events;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// Open requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Deliver a decision for a pending request. A decision kind the request
    /// does not allow is refused and the request stays pending.
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> Result<(), ApprovalError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pending
            .get(request_id)
            .ok_or_else(|| ApprovalError::UnknownRequest(request_id.to_string()))?;
        if !entry.request.allows(&decision) {
            return Err(ApprovalError::DecisionNotAllowed {
                request_id: request_id.to_string(),
                decision: format!("{:?}", decision.kind()).to_lowercase(),
            });
        }
        if let Some(entry) = pending.remove(request_id) {
            // The waiter may have just timed out; the decision is then moot.
            let _ = entry.responder.send(decision);
        }
        tracing::info!(request_id, "approval resolved");
        Ok(())
    }

    /// Gate `call` and wait for a decision.
    pub async fn request(
        &self,
        thread_id: &str,
        call: &ToolCall,
        policy: &ApprovalPolicy,
        transport: &dyn AgentTransport,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let request = ApprovalRequest {
            id: format!("approval-{}", uuid::Uuid::new_v4()),
            thread_id: thread_id.to_string(),
            tool_call: call.clone(),
            risk_class: policy.risk_class,
            description: describe_tool_call(call, policy),
            allowed_decisions: policy.allowed_decisions.clone(),
            decision: ApprovalStatus::Pending,
            resolved_value: None,
            created_at: Utc::now(),
        };

        if self.auto_approve {
            tracing::debug!(tool_name = %call.name, tool_call_id = %call.id, "auto-approved");
            let outcome = build_outcome(&request, Resolution::Decided(ApprovalDecision::Approve));
            self.emit_resolved(&request, &outcome);
            return Ok(outcome);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let duplicate = pending.values().any(|p| {
                p.request.thread_id == request.thread_id && p.request.tool_call.id == call.id
            });
            if duplicate {
                return Err(ApprovalError::AlreadyPending(call.id.clone()));
            }
            pending.insert(
                request.id.clone(),
                PendingApproval {
                    request: request.clone(),
                    responder: tx,
                },
            );
        }
        let guard = PendingGuard {
            pending: &self.pending,
            id: request.id.clone(),
        };

        tracing::info!(
            thread_id,
            request_id = %request.id,
            tool_name = %call.name,
            tool_call_id = %call.id,
            risk = ?request.risk_class,
            "approval requested"
        );
        self.emit(AgentEvent::ApprovalRequested(ApprovalRequestedEvent {
            metadata: EventMetadata::new(thread_id, &request.id),
            request_id: request.id.clone(),
            tool_name: call.name.clone(),
            risk_class: request.risk_class,
            description: request.description.clone(),
        }));

        let resolution = match transport.request_approval(&request).await {
            Ok(Some(decision)) if request.allows(&decision) => Resolution::Decided(decision),
            Ok(Some(decision)) => Resolution::Refused(format!(
                "decision '{}' is not allowed for this tool",
                format!("{:?}", decision.kind()).to_lowercase()
            )),
            Ok(None) => self.wait(rx, call, cancel, deadline).await,
            Err(err) => {
                tracing::warn!(request_id = %request.id, error = %err, "transport failed to request approval");
                Resolution::Refused(format!("approval transport failed: {err:#}"))
            }
        };
        drop(guard);

        let outcome = build_outcome(&request, resolution);
        tracing::info!(
            request_id = %request.id,
            decision = ?outcome.status(),
            "approval finished"
        );
        self.emit_resolved(&request, &outcome);
        Ok(outcome)
    }

    async fn wait(
        &self,
        rx: oneshot::Receiver<ApprovalDecision>,
        call: &ToolCall,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Resolution {
        let window = match deadline {
            Some(deadline) => self
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.timeout,
        };
        tokio::select! {
            decision = rx => match decision {
                Ok(decision) => Resolution::Decided(decision),
                Err(_) => Resolution::Refused("approval request was dropped".to_string()),
            },
            _ = tokio::time::sleep(window) => {
                let err = AgentError::ApprovalTimeout {
                    tool_call_id: call.id.clone(),
                    timeout: window,
                };
                tracing::warn!(tool_call_id = %call.id, timeout = ?window, "approval timed out");
                Resolution::Refused(err.to_string())
            }
            _ = cancel.cancelled() => {
                Resolution::Refused("turn was cancelled before a decision was made".to_string())
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.dispatch(event);
        }
    }

    fn emit_resolved(&self, request: &ApprovalRequest, outcome: &ApprovalOutcome) {
        self.emit(AgentEvent::ApprovalResolved(ApprovalResolvedEvent {
            metadata: EventMetadata::new(&request.thread_id, &request.id),
            request_id: request.id.clone(),
            tool_name: request.tool_call.name.clone(),
            decision: outcome.status(),
            reason: outcome.record.reason.clone(),
        }));
    }
}

fn build_outcome(request: &ApprovalRequest, resolution: Resolution) -> ApprovalOutcome {
    let original = &request.tool_call;
    let (call, decision, executed, reason) = match resolution {
        Resolution::Decided(ApprovalDecision::Approve) => (
            original.clone(),
            ApprovalStatus::Approved,
            Some(original.arguments.clone()),
            None,
        ),
        Resolution::Decided(ApprovalDecision::Edit { arguments }) => {
            let mut edited = original.clone();
            edited.arguments = arguments.clone();
            (edited, ApprovalStatus::Edited, Some(arguments), None)
        }
        Resolution::Decided(ApprovalDecision::Reject { reason }) => (
            original.clone(),
            ApprovalStatus::Rejected,
            None,
            Some(reason.unwrap_or_else(|| "Rejected by user".to_string())),
        ),
        Resolution::Refused(reason) => {
            (original.clone(), ApprovalStatus::Rejected, None, Some(reason))
        }
    };

    ApprovalOutcome {
        call,
        record: ApprovalRecord {
            request_id: request.id.clone(),
            tool_call_id: original.id.clone(),
            tool_name: original.name.clone(),
            original_arguments: original.arguments.clone(),
            executed_arguments: executed,
            decision,
            reason,
            decided_at: Utc::now(),
        },
    }
}

/// Human-readable summary of a gated call shown with the approval prompt.
pub fn describe_tool_call(call: &ToolCall, policy: &ApprovalPolicy) -> String {
    let arg = |key: &str| call.arguments.get(key).and_then(Value::as_str).unwrap_or("");
    let summary = match call.name.as_str() {
        "write_file" => format!(
            "File: {}\nAction: Create file\nLines: {}",
            arg("file_path"),
            arg("content").lines().count()
        ),
        "edit_file" => {
            let all = call
                .arguments
                .get("replace_all")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!(
                "File: {}\nAction: Replace text{}\nOld: {}\nNew: {}",
                arg("file_path"),
                if all { " (all occurrences)" } else { "" },
                agentloop_core::redact::preview(arg("old_string"), 200),
                agentloop_core::redact::preview(arg("new_string"), 200),
            )
        }
        "execute" => format!("Command: {}", arg("command")),
        "task" => format!(
            "Subagent: {}\nTask: {}",
            arg("subagent_type"),
            agentloop_core::redact::preview(arg("description"), 500)
        ),
        _ => format!(
            "Tool: {}\nArguments:\n{}",
            call.name,
            serde_json::to_string_pretty(&call.arguments).unwrap_or_else(|_| call.arguments.to_string())
        ),
    };
    match &policy.description {
        Some(description) => format!("{description}\n\n{summary}"),
        None => summary,
    }
}
