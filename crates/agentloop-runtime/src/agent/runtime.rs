//! The execution loop.
//!
//! A turn appends the user input, then alternates model calls and tool
//! batches until the model answers without tool calls, the run is
//! cancelled, a stage halts it or the iteration limit is reached. Every
//! change to a thread is applied in memory first and then appended to the
//! session store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentloop_core::agent::AgentDescriptor;
use agentloop_core::backend::Backend;
use agentloop_core::command::StateDiff;
use agentloop_core::error::{AgentError, ApprovalError};
use agentloop_core::events::{
    AgentEvent, EventDispatcher, EventMetadata, ToolCompletedEvent, ToolFailedEvent,
    ToolStartedEvent, TodosUpdatedEvent, TurnCompletedEvent, TurnFailedEvent, TurnStartedEvent,
};
use agentloop_core::hitl::{ApprovalDecision, ApprovalRecord, ApprovalRequest};
use agentloop_core::llm::LanguageModel;
use agentloop_core::messaging::{Message, MessageRole, ToolCall, ToolResult};
use agentloop_core::persistence::{generate_thread_id, SessionEvent, SessionStore, SessionSummary};
use agentloop_core::redact::{preview, summarize_arguments, summarize_output, MAX_PREVIEW_CHARS};
use agentloop_core::state::AgentState;
use agentloop_core::tools::{ToolContext, ToolRegistry};
use agentloop_core::transport::AgentTransport;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::RuntimeSettings;
use crate::approval::ApprovalGate;
use crate::middleware::{ModelDirective, ModelRequest, MiddlewarePipeline, ToolCallContext, ToolDirective};
use crate::subagent::{DelegationContext, SubAgentExecutor, SubagentRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The model answered without tool calls.
    Completed,
    Cancelled,
    /// A middleware stage stopped the turn.
    Halted,
    IterationLimit,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Halted => "halted",
            Self::IterationLimit => "iteration_limit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub status: TurnStatus,
    pub final_message: Option<Message>,
    /// Model calls made during the run.
    pub iterations: usize,
    pub halt_reason: Option<String>,
}

impl TurnOutcome {
    pub fn final_text(&self) -> Option<&str> {
        self.final_message.as_ref().map(|m| m.content.as_str())
    }
}

/// Loop position, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    AwaitingModel,
    ProcessingToolCalls,
    Terminal,
}

struct ThreadSlot {
    state: AgentState,
    loaded: bool,
    /// Set under the slot lock when the thread leaves the cache. A waiter
    /// that acquires a retired slot goes back to the map for a fresh one.
    retired: bool,
}

type ThreadHandle = Arc<tokio::sync::Mutex<ThreadSlot>>;

/// What the around-tool stages decided for one call.
enum Prepared {
    Execute(ToolCall),
    Done(ToolResult),
}

/// A configured agent. Cheap to share behind an `Arc`; every thread is
/// serialized independently, so distinct threads run concurrently.
pub struct DeepAgent {
    descriptor: AgentDescriptor,
    model: Arc<dyn LanguageModel>,
    pipeline: MiddlewarePipeline,
    tools: ToolRegistry,
    gate: Arc<ApprovalGate>,
    backend: Arc<dyn Backend>,
    sessions: Option<Arc<dyn SessionStore>>,
    transport: Arc<dyn AgentTransport>,
    events: Option<Arc<EventDispatcher>>,
    settings: RuntimeSettings,
    threads: Mutex<HashMap<String, ThreadHandle>>,
}

impl DeepAgent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        descriptor: AgentDescriptor,
        model: Arc<dyn LanguageModel>,
        pipeline: MiddlewarePipeline,
        tools: ToolRegistry,
        gate: Arc<ApprovalGate>,
        backend: Arc<dyn Backend>,
        sessions: Option<Arc<dyn SessionStore>>,
        transport: Arc<dyn AgentTransport>,
        events: Option<Arc<EventDispatcher>>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            descriptor,
            model,
            pipeline,
            tools,
            gate,
            backend,
            sessions,
            transport,
            events,
            settings,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.names()
    }

    pub fn middleware_ids(&self) -> Vec<String> {
        self.pipeline.ids()
    }

    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        self.gate.clone()
    }

    /// Run one user turn on `thread_id`.
    pub async fn run(&self, thread_id: &str, input: &str) -> Result<TurnOutcome, AgentError> {
        self.run_with_cancel(thread_id, input, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run); cancelling `cancel` stops the turn at its next
    /// suspension point with every issued tool call answered.
    pub async fn run_with_cancel(
        &self,
        thread_id: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.run_with_options(thread_id, input, cancel, None).await
    }

    #[tracing::instrument(skip_all, fields(agent = %self.descriptor.name, thread_id = %thread_id))]
    pub async fn run_with_options(
        &self,
        thread_id: &str,
        input: &str,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<TurnOutcome, AgentError> {
        let started = Instant::now();
        let deadline = match (deadline, self.settings.turn_timeout()) {
            (Some(d), Some(t)) => Some(d.min(started + t)),
            (Some(d), None) => Some(d),
            (None, Some(t)) => Some(started + t),
            (None, None) => None,
        };

        let mut slot = self.lock_thread(thread_id).await;
        self.ensure_loaded(thread_id, &mut slot).await?;
        let state = &mut slot.state;

        let event = state.append(Message::user(input));
        self.persist(thread_id, vec![event]).await?;
        tracing::info!("turn started");
        self.emit(AgentEvent::TurnStarted(TurnStartedEvent {
            metadata: EventMetadata::new(thread_id, thread_id),
            agent_name: self.descriptor.name.clone(),
            input_preview: preview(input, MAX_PREVIEW_CHARS),
        }));

        let result = self.drive(thread_id, state, &cancel, deadline).await;

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    status = ?outcome.status,
                    iterations = outcome.iterations,
                    phase = ?LoopPhase::Terminal,
                    "turn finished"
                );
                self.emit(AgentEvent::TurnCompleted(TurnCompletedEvent {
                    metadata: EventMetadata::new(thread_id, thread_id),
                    agent_name: self.descriptor.name.clone(),
                    status: outcome.status.as_str().to_string(),
                    iterations: outcome.iterations,
                    duration_ms: started.elapsed().as_millis() as u64,
                    response_preview: preview(outcome.final_text().unwrap_or(""), MAX_PREVIEW_CHARS),
                }));
            }
            Err(err) => {
                tracing::error!(error = %err, "turn failed");
                self.emit(AgentEvent::TurnFailed(TurnFailedEvent {
                    metadata: EventMetadata::new(thread_id, thread_id),
                    agent_name: self.descriptor.name.clone(),
                    error_message: err.to_string(),
                }));
            }
        }
        self.transport.update_status("Idle").await;
        result
    }

    async fn drive(
        &self,
        thread_id: &str,
        state: &mut AgentState,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<TurnOutcome, AgentError> {
        let mut iterations = 0;
        let outcome = |status: TurnStatus,
                       final_message: Option<Message>,
                       iterations: usize,
                       halt_reason: Option<String>| TurnOutcome {
            thread_id: thread_id.to_string(),
            status,
            final_message,
            iterations,
            halt_reason,
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(outcome(TurnStatus::Cancelled, None, iterations, None));
            }
            if iterations >= self.settings.max_iterations {
                tracing::warn!(iterations, "iteration limit reached");
                return Ok(outcome(TurnStatus::IterationLimit, None, iterations, None));
            }

            let mut request = ModelRequest::new(state.messages().to_vec(), self.tools.schemas());
            if let ModelDirective::Halt { reason } =
                self.pipeline.before_model(&mut request, &*state).await?
            {
                tracing::info!(%reason, "turn halted by middleware");
                return Ok(outcome(TurnStatus::Halted, None, iterations, Some(reason)));
            }

            iterations += 1;
            tracing::debug!(phase = ?LoopPhase::AwaitingModel, iteration = iterations);
            self.transport.update_status("Thinking").await;

            let Some(message) = self.call_model(request, cancel, deadline).await? else {
                return Ok(outcome(TurnStatus::Cancelled, None, iterations, None));
            };
            let message = normalize_assistant_message(message);
            let event = state.append(message.clone());
            self.persist(thread_id, vec![event]).await?;
            self.transport.mount_message(&message).await;

            if !message.has_tool_calls() {
                return Ok(outcome(TurnStatus::Completed, Some(message), iterations, None));
            }

            tracing::debug!(
                phase = ?LoopPhase::ProcessingToolCalls,
                calls = message.tool_calls.len()
            );
            self.process_tool_calls(thread_id, state, &message.tool_calls, cancel, deadline)
                .await?;
        }
    }

    async fn call_model(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Option<Message>, AgentError> {
        let policy = &self.settings.retry;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(AgentError::ModelCall {
                    attempts: attempt - 1,
                    source: anyhow::anyhow!("turn deadline exceeded"),
                });
            }

            let call = self.model.complete(request.clone().into_llm_request());
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = async move {
                    match remaining {
                        Some(limit) => tokio::time::timeout(limit, call)
                            .await
                            .unwrap_or_else(|_| Err(anyhow::anyhow!("model call exceeded the turn deadline"))),
                        None => call.await,
                    }
                } => result,
            };

            match result {
                Ok(response) => return Ok(Some(response.message)),
                Err(err) if attempt <= policy.max_retries => {
                    let backoff = policy.backoff(attempt);
                    tracing::warn!(attempt, backoff = ?backoff, error = %err, "model call failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    return Err(AgentError::ModelCall {
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }

    /// Gate, execute and record one batch of tool calls.
    ///
    /// Approvals are requested one at a time in call order. Approved calls
    /// then run concurrently against a snapshot of the state, and results and
    /// diffs are applied in call order so the log does not depend on which
    /// call finished first.
    async fn process_tool_calls(
        &self,
        thread_id: &str,
        state: &mut AgentState,
        calls: &[ToolCall],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), AgentError> {
        let mut events = Vec::new();
        let mut prepared = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                prepared.push(Prepared::Done(cancelled_result(call)));
                continue;
            }
            let (decision, records) = self
                .prepare_call(thread_id, state, call, calls, cancel, deadline)
                .await;
            for record in records {
                events.push(state.record_approval(record));
            }
            prepared.push(decision);
        }

        let snapshot = Arc::new(state.clone());
        let runs = prepared.iter().enumerate().filter_map(|(index, p)| match p {
            Prepared::Execute(call) => {
                let snapshot = snapshot.clone();
                Some(async move {
                    (index, self.execute_tool(thread_id, call, snapshot, cancel, deadline).await)
                })
            }
            Prepared::Done(_) => None,
        });
        let executed: Vec<(usize, (ToolResult, Option<StateDiff>))> =
            if self.settings.parallel_tool_calls {
                join_all(runs).await
            } else {
                let mut executed = Vec::new();
                for run in runs {
                    executed.push(run.await);
                }
                executed
            };
        let mut executed: HashMap<usize, (ToolResult, Option<StateDiff>)> =
            executed.into_iter().collect();

        for (index, (call, prepared)) in calls.iter().zip(prepared).enumerate() {
            let (result, tool_diff) = match prepared {
                Prepared::Done(result) => (result, None),
                Prepared::Execute(effective) => {
                    let (mut result, tool_diff) = executed
                        .remove(&index)
                        .unwrap_or_else(|| (cancelled_result(call), None));
                    let ctx = ToolCallContext {
                        call: &effective,
                        turn_calls: calls,
                        state: &*state,
                    };
                    let stage_diff = self.pipeline.after_tool(&ctx, &mut result).await;
                    let diff = match (tool_diff, stage_diff) {
                        (Some(mut a), Some(b)) => {
                            a.merge(b);
                            Some(a)
                        }
                        (a, b) => a.or(b),
                    };
                    (result, diff)
                }
            };

            let message = result.to_message(call.name.clone());
            events.push(state.append(message.clone()));
            self.transport.mount_message(&message).await;

            if let Some(diff) = tool_diff.filter(|d| !d.is_empty()) {
                let todos_changed = diff.todos.is_some();
                events.extend(state.apply_diff(diff));
                if todos_changed {
                    self.emit(AgentEvent::TodosUpdated(TodosUpdatedEvent::new(
                        EventMetadata::new(thread_id, &call.id),
                        state.todos().to_vec(),
                    )));
                }
            }
        }

        self.persist(thread_id, events).await
    }

    /// Run the around-tool stages for one call, resolving approvals inline.
    async fn prepare_call(
        &self,
        thread_id: &str,
        state: &AgentState,
        original: &ToolCall,
        turn_calls: &[ToolCall],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> (Prepared, Vec<ApprovalRecord>) {
        let mut call = original.clone();
        let mut records = Vec::new();
        let mut from = 0;
        loop {
            let ctx = ToolCallContext {
                call: &call,
                turn_calls,
                state,
            };
            let directive = match self.pipeline.next_tool_directive(&ctx, from).await {
                Ok(directive) => directive,
                Err(err) => {
                    tracing::warn!(tool_call_id = %call.id, error = %err, "before_tool hook failed");
                    return (Prepared::Done(ToolResult::failure(call.id.clone(), err.to_string())), records);
                }
            };
            match directive {
                None => return (Prepared::Execute(call), records),
                Some((_, ToolDirective::Respond(mut result))) => {
                    result.tool_call_id = call.id.clone();
                    return (Prepared::Done(result), records);
                }
                Some((index, ToolDirective::Continue)) => from = index + 1,
                Some((index, ToolDirective::RequestApproval(policy))) => {
                    self.transport
                        .update_status(&format!("Awaiting approval for {}", call.name))
                        .await;
                    let outcome = match self
                        .gate
                        .request(thread_id, &call, &policy, self.transport.as_ref(), cancel, deadline)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            return (
                                Prepared::Done(ToolResult::failure(call.id.clone(), err.to_string())),
                                records,
                            )
                        }
                    };
                    records.push(outcome.record.clone());
                    if let Some(rejection) = outcome.rejection_result() {
                        return (Prepared::Done(rejection), records);
                    }
                    call = outcome.call;
                    from = index + 1;
                }
            }
        }
    }

    async fn execute_tool(
        &self,
        thread_id: &str,
        call: &ToolCall,
        state: Arc<AgentState>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> (ToolResult, Option<StateDiff>) {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool_name = %call.name, "model requested an unknown tool");
            return (
                ToolResult::failure(
                    call.id.clone(),
                    format!(
                        "Error: Tool '{}' not found. Available tools: {}",
                        call.name,
                        self.tools.names().join(", ")
                    ),
                ),
                None,
            );
        };

        self.emit(AgentEvent::ToolStarted(ToolStartedEvent {
            metadata: EventMetadata::new(thread_id, &call.id),
            tool_name: call.name.clone(),
            input_summary: summarize_arguments(&call.arguments),
        }));
        self.transport
            .update_status(&format!("Running {}", call.name))
            .await;

        let ctx = ToolContext {
            thread_id: thread_id.to_string(),
            tool_call_id: call.id.clone(),
            state,
            backend: self.backend.clone(),
            cancel: cancel.clone(),
            deadline,
        };
        let started = Instant::now();
        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => {
                let (text, diff) = output.into_parts();
                tracing::debug!(tool_name = %call.name, tool_call_id = %call.id, "tool completed");
                self.emit(AgentEvent::ToolCompleted(ToolCompletedEvent {
                    metadata: EventMetadata::new(thread_id, &call.id),
                    tool_name: call.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    result_summary: summarize_output(&text),
                }));
                (ToolResult::success(call.id.clone(), text), diff)
            }
            Err(err) => {
                let failure = AgentError::ToolExecution {
                    tool: call.name.clone(),
                    message: format!("{err:#}"),
                };
                tracing::warn!(tool_call_id = %call.id, error = %failure, "tool failed");
                self.emit(AgentEvent::ToolFailed(ToolFailedEvent {
                    metadata: EventMetadata::new(thread_id, &call.id),
                    tool_name: call.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error_message: failure.to_string(),
                }));
                (ToolResult::failure(call.id.clone(), format!("{err:#}")), None)
            }
        }
    }

    fn thread_handle(&self, thread_id: &str) -> ThreadHandle {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(ThreadSlot {
                    state: AgentState::new(thread_id),
                    loaded: false,
                    retired: false,
                }))
            })
            .clone()
    }

    fn cached_handle(&self, thread_id: &str) -> Option<ThreadHandle> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned()
    }

    /// Exclusive access to a live slot for `thread_id`, creating it if needed.
    async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<ThreadSlot> {
        loop {
            let handle = self.thread_handle(thread_id);
            let slot = handle.clone().lock_owned().await;
            if !slot.retired {
                return slot;
            }
            self.remove_if_current(thread_id, &handle);
        }
    }

    /// Lock the cached slot, mark it retired and drop it from the map. The
    /// returned guard keeps later turns on the thread waiting until released.
    async fn retire(&self, thread_id: &str) -> Option<OwnedMutexGuard<ThreadSlot>> {
        loop {
            let handle = self.cached_handle(thread_id)?;
            let mut slot = handle.clone().lock_owned().await;
            let was_retired = slot.retired;
            slot.retired = true;
            self.remove_if_current(thread_id, &handle);
            if !was_retired {
                return Some(slot);
            }
        }
    }

    fn remove_if_current(&self, thread_id: &str, handle: &ThreadHandle) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if threads
            .get(thread_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            threads.remove(thread_id);
        }
    }

    /// Replay the thread from the store on first touch and answer any tool
    /// calls an interrupted turn left without results.
    async fn ensure_loaded(&self, thread_id: &str, slot: &mut ThreadSlot) -> Result<(), AgentError> {
        if slot.loaded {
            return Ok(());
        }
        if let Some(store) = &self.sessions {
            let loaded = store
                .load(thread_id)
                .await
                .map_err(|source| AgentError::Session {
                    thread_id: thread_id.to_string(),
                    source,
                })?;
            if let Some(state) = loaded {
                tracing::debug!(messages = state.messages().len(), "thread replayed from store");
                slot.state = state;
            }
        }

        let dangling = slot.state.dangling_tool_calls();
        if !dangling.is_empty() {
            tracing::info!(count = dangling.len(), "repairing dangling tool calls");
            let events: Vec<SessionEvent> = dangling
                .iter()
                .map(|call| slot.state.append(cancelled_result(call).to_message(call.name.clone())))
                .collect();
            self.persist(thread_id, events).await?;
        }
        slot.loaded = true;
        Ok(())
    }

    async fn persist(&self, thread_id: &str, events: Vec<SessionEvent>) -> Result<(), AgentError> {
        let Some(store) = &self.sessions else {
            return Ok(());
        };
        if events.is_empty() {
            return Ok(());
        }
        store
            .append(thread_id, &self.descriptor.name, &events)
            .await
            .map_err(|source| AgentError::Session {
                thread_id: thread_id.to_string(),
                source,
            })
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.dispatch(event);
        }
    }

    /// Load a thread without running a turn.
    pub async fn resume(&self, thread_id: &str) -> Result<AgentState, AgentError> {
        let mut slot = self.lock_thread(thread_id).await;
        self.ensure_loaded(thread_id, &mut slot).await?;
        Ok(slot.state.clone())
    }

    /// In-memory state of a cached thread. Waits for an in-flight turn.
    pub async fn state(&self, thread_id: &str) -> Option<AgentState> {
        let handle = self.cached_handle(thread_id)?;
        let slot = handle.lock().await;
        (!slot.retired).then(|| slot.state.clone())
    }

    /// Drop a thread from the cache once any in-flight turn has finished.
    /// The next run reloads it from the store.
    pub async fn evict(&self, thread_id: &str) -> Option<AgentState> {
        let slot = self.retire(thread_id).await?;
        Some(slot.state.clone())
    }

    /// Synchronous eviction for drop guards. Only safe for threads no other
    /// caller can address.
    fn forget(&self, thread_id: &str) {
        let Some(handle) = self.cached_handle(thread_id) else {
            return;
        };
        if let Ok(mut slot) = handle.try_lock() {
            slot.retired = true;
        }
        self.remove_if_current(thread_id, &handle);
    }

    pub fn resolve_approval(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        self.gate.resolve(request_id, decision)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.pending()
    }

    /// Threads persisted by this agent, newest first.
    pub async fn list_threads(&self) -> Result<Vec<SessionSummary>, AgentError> {
        let Some(store) = &self.sessions else {
            return Ok(Vec::new());
        };
        store
            .list_threads(Some(&self.descriptor.name))
            .await
            .map_err(|source| AgentError::Session {
                thread_id: String::new(),
                source,
            })
    }

    /// Remove a thread from the cache and the store. Waits for an in-flight
    /// turn; turns queued behind it start from the deleted state.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<bool, AgentError> {
        let slot = self.retire(thread_id).await;
        let Some(store) = &self.sessions else {
            return Ok(slot.is_some());
        };
        store
            .delete(thread_id)
            .await
            .map_err(|source| AgentError::Session {
                thread_id: thread_id.to_string(),
                source,
            })
    }
}

/// Drops the child thread from the cache even if the run is abandoned.
struct EvictOnDrop<'a> {
    agent: &'a DeepAgent,
    thread_id: String,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        self.agent.forget(&self.thread_id);
    }
}

#[async_trait]
impl SubAgentExecutor for DeepAgent {
    async fn run(&self, input: &str, ctx: DelegationContext) -> anyhow::Result<SubagentRun> {
        let thread_id = format!(
            "{}/{}-{}",
            ctx.parent_thread_id,
            self.descriptor.name,
            generate_thread_id()
        );
        let guard = EvictOnDrop {
            agent: self,
            thread_id: thread_id.clone(),
        };
        let outcome = self
            .run_with_options(&thread_id, input, ctx.cancel, ctx.deadline)
            .await?;
        let state = self.evict(&thread_id).await;
        drop(guard);

        match outcome.status {
            TurnStatus::Completed => Ok(SubagentRun {
                output: outcome.final_text().unwrap_or_default().to_string(),
                state,
            }),
            TurnStatus::Cancelled => anyhow::bail!("cancelled before finishing"),
            TurnStatus::Halted => anyhow::bail!(
                "halted: {}",
                outcome.halt_reason.unwrap_or_default()
            ),
            TurnStatus::IterationLimit => anyhow::bail!(
                "stopped after {} model calls without a final answer",
                outcome.iterations
            ),
        }
    }
}

fn cancelled_result(call: &ToolCall) -> ToolResult {
    ToolResult::failure(
        call.id.clone(),
        format!(
            "Tool call {} with id {} was cancelled - another message came in before it could be completed.",
            call.name, call.id
        ),
    )
}

/// Force the assistant role and give every tool call a unique, non-empty id.
fn normalize_assistant_message(mut message: Message) -> Message {
    message.role = MessageRole::Assistant;
    let mut seen = HashSet::new();
    for call in &mut message.tool_calls {
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            let replacement = format!("call_{}", uuid::Uuid::new_v4().simple());
            tracing::debug!(original = %call.id, %replacement, "replaced tool call id");
            call.id = replacement.clone();
            seen.insert(replacement);
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_and_empty_ids_are_replaced() {
        let message = Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCall::new("a", "ls", json!({})),
                ToolCall::new("a", "ls", json!({})),
                ToolCall::new("", "ls", json!({})),
            ],
        );
        let normalized = normalize_assistant_message(message);
        let ids: Vec<&str> = normalized.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids[0], "a");
        assert!(ids[1].starts_with("call_"));
        assert!(ids[2].starts_with("call_"));
        assert_ne!(ids[1], ids[2]);
    }
}
