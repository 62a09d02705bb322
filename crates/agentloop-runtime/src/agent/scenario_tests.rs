use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentloop_core::backend::Backend;
use agentloop_core::error::AgentError;
use agentloop_core::events::{AgentEvent, EventBroadcaster, EventDispatcher};
use agentloop_core::hitl::{ApprovalDecision, ApprovalRequest, ApprovalStatus};
use agentloop_core::llm::{LanguageModel, LlmRequest, LlmResponse};
use agentloop_core::messaging::{Message, MessageRole};
use agentloop_core::persistence::{InMemorySessionStore, SessionEvent, SessionStore};
use agentloop_core::state::TodoStatus;
use agentloop_toolkit::{FilesystemBackend, StateBackend};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Barrier};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConfigurableAgentBuilder, DeepAgent, RetryPolicy, TurnStatus};
use crate::middleware::{AgentMiddleware, ModelContext, ModelDirective, FILES_TOUCHED_KEY};
use crate::subagent::{DelegationContext, SubAgentExecutor, SubAgentSpec, SubagentRun};
use crate::test_support::{calls, RecordingTransport, ScriptedModel};

fn builder(model: Arc<ScriptedModel>) -> ConfigurableAgentBuilder {
    ConfigurableAgentBuilder::new("You maintain a small repository.")
        .with_model(model)
        .with_retry_policy(RetryPolicy::none())
}

async fn wait_for_approval(agent: &DeepAgent) -> ApprovalRequest {
    loop {
        if let Some(request) = agent.pending_approvals().into_iter().next() {
            return request;
        }
        tokio::task::yield_now().await;
    }
}

fn tool_messages(messages: &[Message]) -> Vec<&Message> {
    messages.iter().filter(|m| m.role == MessageRole::Tool).collect()
}

#[tokio::test]
async fn listing_then_gated_write_resolved_out_of_band() {
    let backend = Arc::new(StateBackend::with_files([("/README.md", "hello")]).unwrap());
    let store = Arc::new(InMemorySessionStore::new());
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![("c1", "ls", json!({"path": "/"}))]),
        calls(vec![(
            "c2",
            "write_file",
            json!({"file_path": "/notes.md", "content": "a\nb"}),
        )]),
        Message::assistant("Wrote the notes."),
    ]));
    let agent = Arc::new(
        builder(model.clone())
            .with_backend(backend.clone())
            .with_session_store(store.clone())
            .build()
            .unwrap(),
    );

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run("t1", "Take notes").await })
    };

    let request = wait_for_approval(&agent).await;
    assert_eq!(request.thread_id, "t1");
    assert_eq!(request.tool_call.name, "write_file");
    assert_eq!(request.description, "File: /notes.md\nAction: Create file\nLines: 2");
    assert!(!backend.exists("/notes.md").await.unwrap());
    agent
        .resolve_approval(&request.id, ApprovalDecision::Approve)
        .unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.final_text(), Some("Wrote the notes."));
    assert_eq!(outcome.iterations, 3);
    assert_eq!(backend.read_to_string("/notes.md").await.unwrap(), "a\nb");

    let state = agent.state("t1").await.unwrap();
    assert_eq!(state.messages().len(), 6);
    let tools = tool_messages(state.messages());
    assert!(tools[0].content.contains("/README.md"));
    assert_eq!(tools[1].content, "Updated file /notes.md");
    assert_eq!(state.approvals().len(), 1);
    assert_eq!(state.approvals()[0].decision, ApprovalStatus::Approved);
    assert_eq!(state.metadata().get(FILES_TOUCHED_KEY), Some(&json!(["/notes.md"])));

    let persisted = store.load("t1").await.unwrap().unwrap();
    assert_eq!(persisted, state);
}

#[tokio::test]
async fn edited_approval_runs_edited_arguments_and_keeps_audit() {
    let backend = Arc::new(StateBackend::new());
    let edited = json!({"file_path": "/notes.md", "content": "reviewed"});
    let transport = RecordingTransport::answering(ApprovalDecision::Edit {
        arguments: edited.clone(),
    })
    .shared();
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![(
            "c1",
            "write_file",
            json!({"file_path": "/notes.md", "content": "draft"}),
        )]),
        Message::assistant("ok"),
    ]));
    let agent = builder(model)
        .with_backend(backend.clone())
        .with_transport(transport.clone())
        .build()
        .unwrap();

    let outcome = agent.run("t1", "write it").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(backend.read_to_string("/notes.md").await.unwrap(), "reviewed");

    let state = agent.state("t1").await.unwrap();
    let record = &state.approvals()[0];
    assert_eq!(record.decision, ApprovalStatus::Edited);
    assert_eq!(record.original_arguments["content"], "draft");
    assert_eq!(record.executed_arguments, Some(edited));

    assert_eq!(transport.approval_requests().len(), 1);
    let mounted = transport.mounted();
    assert_eq!(mounted.len(), 3);
    assert_eq!(mounted[1].content, "Updated file /notes.md");
}

#[tokio::test]
async fn inline_rejection_skips_the_handler() {
    let backend = Arc::new(StateBackend::new());
    let transport = RecordingTransport::answering(ApprovalDecision::reject("not in main")).shared();
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![("c1", "write_file", json!({"file_path": "/x.md", "content": "x"}))]),
        Message::assistant("Understood."),
    ]));
    let agent = builder(model)
        .with_backend(backend.clone())
        .with_transport(transport)
        .build()
        .unwrap();

    agent.run("t1", "write").await.unwrap();
    assert!(!backend.exists("/x.md").await.unwrap());
    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error);
    assert_eq!(
        tools[0].content,
        "Tool call 'write_file' was rejected: not in main"
    );
    assert_eq!(state.approvals()[0].executed_arguments, None);
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_is_recorded_as_rejection() {
    let backend = Arc::new(StateBackend::new());
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![("c1", "execute", json!({"command": "rm -rf target"}))]),
        Message::assistant("Skipped."),
    ]));
    let agent = builder(model)
        .with_backend(backend)
        .with_approval_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let outcome = agent.run("t1", "clean up").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);

    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error);
    assert!(tools[0].content.contains("timed out"));
    assert_eq!(state.approvals()[0].decision, ApprovalStatus::Rejected);
    assert!(agent.pending_approvals().is_empty());
}

#[tokio::test]
async fn auto_approve_executes_against_a_real_directory() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FilesystemBackend::new(dir.path()));
    let transport = RecordingTransport::default().shared();
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![("c1", "write_file", json!({"file_path": "/out.txt", "content": "done"}))]),
        Message::assistant("ok"),
    ]));
    let agent = builder(model)
        .with_backend(backend)
        .with_transport(transport.clone())
        .with_auto_approve(true)
        .build()
        .unwrap();

    agent.run("t1", "write").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "done"
    );
    assert!(transport.approval_requests().is_empty());
    let state = agent.state("t1").await.unwrap();
    assert_eq!(state.approvals()[0].decision, ApprovalStatus::Approved);
}

struct Rendezvous(Arc<Barrier>);

#[async_trait]
impl SubAgentExecutor for Rendezvous {
    async fn run(&self, input: &str, _ctx: DelegationContext) -> anyhow::Result<SubagentRun> {
        self.0.wait().await;
        Ok(SubagentRun {
            output: format!("{input}: done"),
            state: None,
        })
    }
}

struct Failing;

#[async_trait]
impl SubAgentExecutor for Failing {
    async fn run(&self, _input: &str, _ctx: DelegationContext) -> anyhow::Result<SubagentRun> {
        anyhow::bail!("index corrupted")
    }
}

#[tokio::test]
async fn parallel_subagents_run_concurrently_and_fail_in_isolation() {
    let barrier = Arc::new(Barrier::new(2));
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![
            ("a", "task", json!({"description": "lint", "subagent_type": "worker-a"})),
            ("b", "task", json!({"description": "test", "subagent_type": "worker-b"})),
            ("c", "task", json!({"description": "index", "subagent_type": "indexer"})),
        ]),
        Message::assistant("All reported."),
    ]));
    let agent = builder(model)
        .with_prebuilt_subagent("worker-a", "Lints", Arc::new(Rendezvous(barrier.clone())))
        .with_prebuilt_subagent("worker-b", "Tests", Arc::new(Rendezvous(barrier)))
        .with_prebuilt_subagent("indexer", "Indexes", Arc::new(Failing))
        .without_approvals()
        .build()
        .unwrap();

    let outcome = agent.run("t1", "check everything").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);

    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    let ids: Vec<&str> = tools.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(tools[0].content, "lint: done");
    assert_eq!(tools[1].content, "test: done");
    assert!(tools[2].is_error);
    assert_eq!(tools[2].content, "Subagent 'indexer' failed: index corrupted");
}

#[tokio::test]
async fn declarative_subagent_sees_only_the_delegated_input() {
    let child_model = Arc::new(ScriptedModel::replying(vec![Message::assistant(
        "X was added in 1.2",
    )]));
    let parent_model = Arc::new(ScriptedModel::replying(vec![
        Message::assistant("Let me check."),
        calls(vec![(
            "t",
            "task",
            json!({"description": "research X", "subagent_type": "researcher"}),
        )]),
        Message::assistant("X landed in 1.2."),
    ]));
    let agent = builder(parent_model)
        .with_subagent(
            SubAgentSpec::new("researcher", "Looks things up", "Research carefully.")
                .with_model(child_model.clone()),
        )
        .without_approvals()
        .build()
        .unwrap();

    agent.run("t1", "hello").await.unwrap();
    agent.run("t1", "when did X land?").await.unwrap();

    let child_requests = child_model.requests();
    assert_eq!(child_requests.len(), 1);
    let seen = &child_requests[0].messages;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].role, MessageRole::User);
    assert_eq!(seen[0].content, "research X");

    let parent = agent.state("t1").await.unwrap();
    assert_eq!(parent.messages().len(), 6);
    assert_eq!(tool_messages(parent.messages())[0].content, "X was added in 1.2");
    assert!(parent
        .messages()
        .iter()
        .all(|m| m.content != "research X" || m.role != MessageRole::User));
}

#[tokio::test]
async fn resumed_thread_replays_history_into_the_next_turn() {
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let first = builder(Arc::new(ScriptedModel::replying(vec![Message::assistant(
        "Hi there",
    )])))
    .with_session_store(store.clone())
    .build()
    .unwrap();
    first.run("t1", "hello").await.unwrap();
    drop(first);

    let model = Arc::new(ScriptedModel::replying(vec![Message::assistant("Again")]));
    let second = builder(model.clone())
        .with_session_store(store.clone())
        .build()
        .unwrap();
    let resumed = second.resume("t1").await.unwrap();
    assert_eq!(resumed.messages().len(), 2);

    second.run("t1", "and now?").await.unwrap();
    let request = &model.requests()[0];
    let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "Hi there", "and now?"]);

    let threads = second.list_threads().await.unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].thread_id, "t1");
    assert!(second.delete_thread("t1").await.unwrap());
    assert!(store.load("t1").await.unwrap().is_none());
    assert!(second.state("t1").await.is_none());
}

#[tokio::test]
async fn dangling_tool_calls_are_answered_on_load() {
    let store = Arc::new(InMemorySessionStore::new());
    store
        .append(
            "t1",
            "agent",
            &[
                SessionEvent::Message(Message::user("list files")),
                SessionEvent::Message(calls(vec![("c1", "ls", json!({"path": "/"}))])),
            ],
        )
        .await
        .unwrap();

    let agent = builder(Arc::new(ScriptedModel::new(vec![])))
        .with_session_store(store.clone())
        .build()
        .unwrap();
    let state = agent.resume("t1").await.unwrap();
    let last = state.last_message().unwrap();
    assert!(last.is_error);
    assert_eq!(
        last.content,
        "Tool call ls with id c1 was cancelled - another message came in before it could be completed."
    );
    assert!(state.dangling_tool_calls().is_empty());

    let persisted = store.load("t1").await.unwrap().unwrap();
    assert_eq!(persisted.messages().len(), 3);
}

#[tokio::test]
async fn cancelling_during_approval_leaves_no_dangling_calls() {
    let model = Arc::new(ScriptedModel::replying(vec![calls(vec![
        ("c1", "execute", json!({"command": "make release"})),
        ("c2", "ls", json!({"path": "/"})),
    ])]));
    let agent = Arc::new(builder(model.clone()).build().unwrap());
    let cancel = CancellationToken::new();

    let run = {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run_with_cancel("t1", "release", cancel).await })
    };
    wait_for_approval(&agent).await;
    cancel.cancel();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, TurnStatus::Cancelled);
    assert_eq!(model.calls(), 1);

    let state = agent.state("t1").await.unwrap();
    assert!(state.dangling_tool_calls().is_empty());
    let tools = tool_messages(state.messages());
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().all(|m| m.is_error));
    assert!(tools[1].content.contains("was cancelled"));
    assert!(agent.pending_approvals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_model_failures_are_retried() {
    let model = Arc::new(ScriptedModel::new(vec![
        Err(anyhow::anyhow!("503 overloaded")),
        Ok(Message::assistant("recovered")),
    ]));
    let agent = ConfigurableAgentBuilder::new("x")
        .with_model(model.clone())
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 100,
            ..RetryPolicy::default()
        })
        .build()
        .unwrap();

    let outcome = agent.run("t1", "hi").await.unwrap();
    assert_eq!(outcome.final_text(), Some("recovered"));
    assert_eq!(model.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_turn() {
    let model = Arc::new(ScriptedModel::new(vec![
        Err(anyhow::anyhow!("503")),
        Err(anyhow::anyhow!("503")),
        Err(anyhow::anyhow!("connection reset")),
    ]));
    let agent = ConfigurableAgentBuilder::new("x")
        .with_model(model.clone())
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        })
        .build()
        .unwrap();

    let err = agent.run("t1", "hi").await.unwrap_err();
    match err {
        AgentError::ModelCall { attempts, source } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.to_string(), "connection reset");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(agent.state("t1").await.unwrap().messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn turns_on_one_thread_are_serialized() {
    let model = Arc::new(
        ScriptedModel::from_fn(|request| {
            Ok(Message::assistant(format!("seen {}", request.messages.len())))
        })
        .with_delay(Duration::from_millis(50)),
    );
    let agent = builder(model).build().unwrap();

    let (a, b) = tokio::join!(agent.run("t1", "first"), agent.run("t1", "second"));
    let mut seen = vec![
        a.unwrap().final_text().unwrap().to_string(),
        b.unwrap().final_text().unwrap().to_string(),
    ];
    seen.sort();
    assert_eq!(seen, vec!["seen 1", "seen 3"]);

    let (c, d) = tokio::join!(agent.run("t2", "x"), agent.run("t3", "y"));
    assert_eq!(c.unwrap().final_text(), Some("seen 1"));
    assert_eq!(d.unwrap().final_text(), Some("seen 1"));
}

/// Tracks how many model calls overlap.
#[derive(Default)]
struct OverlapModel {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl OverlapModel {
    async fn first_call_started(&self) {
        while self.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl LanguageModel for OverlapModel {
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(LlmResponse {
            message: Message::assistant(format!("seen {}", request.messages.len())),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn eviction_during_a_turn_keeps_the_thread_serialized() {
    let model = Arc::new(OverlapModel::default());
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let agent = ConfigurableAgentBuilder::new("You maintain a small repository.")
        .with_model(model.clone())
        .with_retry_policy(RetryPolicy::none())
        .with_session_store(store)
        .build()
        .unwrap();

    let (first, evicted, second) = tokio::join!(
        agent.run("t1", "first"),
        async {
            model.first_call_started().await;
            agent.evict("t1").await
        },
        async {
            model.first_call_started().await;
            agent.run("t1", "second").await
        },
    );

    assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap().final_text(), Some("seen 1"));
    assert_eq!(evicted.unwrap().messages().len(), 2);
    // The second turn reloaded the first turn from the store.
    assert_eq!(second.unwrap().final_text(), Some("seen 3"));
}

#[tokio::test(start_paused = true)]
async fn delete_waits_for_the_running_turn() {
    let model = Arc::new(OverlapModel::default());
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let agent = ConfigurableAgentBuilder::new("You maintain a small repository.")
        .with_model(model.clone())
        .with_retry_policy(RetryPolicy::none())
        .with_session_store(store.clone())
        .build()
        .unwrap();

    let (first, deleted, second) = tokio::join!(
        agent.run("t1", "first"),
        async {
            model.first_call_started().await;
            agent.delete_thread("t1").await
        },
        async {
            model.first_call_started().await;
            agent.run("t1", "second").await
        },
    );

    assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap().final_text(), Some("seen 1"));
    assert!(deleted.unwrap());
    assert_eq!(second.unwrap().final_text(), Some("seen 1"));
    assert_eq!(store.load("t1").await.unwrap().unwrap().messages().len(), 2);
}

fn assert_deadline_reached(started: Instant) {
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11), "{elapsed:?}");
}

struct Stalled;

#[async_trait]
impl SubAgentExecutor for Stalled {
    async fn run(&self, _input: &str, _ctx: DelegationContext) -> anyhow::Result<SubagentRun> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(SubagentRun {
            output: "too late".into(),
            state: None,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn turn_deadline_caps_approval_waits() {
    let model = Arc::new(ScriptedModel::replying(vec![calls(vec![(
        "c1",
        "write_file",
        json!({"file_path": "/notes.md", "content": "x"}),
    )])]));
    let agent = builder(model.clone())
        .with_turn_timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = agent.run("t1", "take notes").await.unwrap_err();
    assert_deadline_reached(started);
    match err {
        AgentError::ModelCall { attempts, source } => {
            assert_eq!(attempts, 0);
            assert_eq!(source.to_string(), "turn deadline exceeded");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(model.calls(), 1);

    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error);
    assert!(tools[0].content.contains("timed out after 10s"));
    assert_eq!(state.approvals()[0].decision, ApprovalStatus::Rejected);
    assert!(agent.pending_approvals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn subagent_timeout_is_capped_by_the_turn_deadline() {
    let model = Arc::new(ScriptedModel::replying(vec![calls(vec![(
        "c1",
        "task",
        json!({"description": "reindex", "subagent_type": "indexer"}),
    )])]));
    let agent = builder(model)
        .with_prebuilt_subagent("indexer", "Indexes", Arc::new(Stalled))
        .with_subagent_timeout(Duration::from_secs(300))
        .with_turn_timeout(Duration::from_secs(10))
        .without_approvals()
        .build()
        .unwrap();

    let started = Instant::now();
    let err = agent.run("t1", "reindex").await.unwrap_err();
    assert_deadline_reached(started);
    assert!(matches!(err, AgentError::ModelCall { attempts: 0, .. }));

    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error);
    assert_eq!(tools[0].content, "Subagent 'indexer' failed: timed out after 10s");
}

#[tokio::test(start_paused = true)]
async fn model_call_past_the_caller_deadline_fails_the_turn() {
    let model = Arc::new(
        ScriptedModel::replying(vec![Message::assistant("late")])
            .with_delay(Duration::from_secs(60)),
    );
    let agent = builder(model).build().unwrap();

    let started = Instant::now();
    let err = agent
        .run_with_options(
            "t1",
            "hello",
            CancellationToken::new(),
            Some(started + Duration::from_secs(10)),
        )
        .await
        .unwrap_err();
    assert_deadline_reached(started);
    match err {
        AgentError::ModelCall { attempts, source } => {
            assert_eq!(attempts, 1);
            assert_eq!(source.to_string(), "model call exceeded the turn deadline");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The user message was kept for the next attempt.
    assert_eq!(agent.state("t1").await.unwrap().messages().len(), 1);
}

#[tokio::test]
async fn unknown_tool_becomes_an_error_result() {
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![("c1", "deploy", json!({"env": "prod"}))]),
        Message::assistant("Cannot deploy."),
    ]));
    let agent = builder(model)
        .with_builtin_tools(["ls", "read_file"])
        .with_auto_general_purpose(false)
        .build()
        .unwrap();

    let outcome = agent.run("t1", "deploy").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error);
    assert_eq!(
        tools[0].content,
        "Error: Tool 'deploy' not found. Available tools: ls, read_file"
    );
}

#[tokio::test]
async fn todos_update_and_parallel_writes_are_refused() {
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![
            ("w1", "write_todos", json!({"todos": [{"content": "a", "status": "pending"}]})),
            ("w2", "write_todos", json!({"todos": [{"content": "b", "status": "pending"}]})),
        ]),
        calls(vec![(
            "w3",
            "write_todos",
            json!({"todos": [
                {"content": "plan", "status": "done"},
                {"content": "ship", "status": "in_progress"}
            ]}),
        )]),
        Message::assistant("Planned."),
    ]));
    let agent = builder(model).build().unwrap();

    agent.run("t1", "plan the release").await.unwrap();
    let state = agent.state("t1").await.unwrap();
    let tools = tool_messages(state.messages());
    assert!(tools[0].is_error && tools[1].is_error);
    assert!(tools[0].content.contains("should never be called multiple times in parallel"));
    assert!(!tools[2].is_error);
    assert_eq!(state.todos().len(), 2);
    assert_eq!(state.todos()[1].status, TodoStatus::InProgress);
}

struct BudgetGuard;

#[async_trait]
impl AgentMiddleware for BudgetGuard {
    fn id(&self) -> &str {
        "budget"
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        if ctx.state.messages().len() > 2 {
            return Ok(ModelDirective::Halt {
                reason: "budget exhausted".into(),
            });
        }
        Ok(ModelDirective::Continue)
    }
}

#[tokio::test]
async fn a_stage_can_halt_the_turn() {
    let model = Arc::new(ScriptedModel::replying(vec![calls(vec![(
        "c1",
        "ls",
        json!({"path": "/"}),
    )])]));
    let agent = builder(model.clone())
        .with_middleware(Arc::new(BudgetGuard))
        .build()
        .unwrap();

    let outcome = agent.run("t1", "look around").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Halted);
    assert_eq!(outcome.halt_reason.as_deref(), Some("budget exhausted"));
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn iteration_limit_stops_a_looping_model() {
    let model = Arc::new(ScriptedModel::from_fn(|_| {
        Ok(calls(vec![("", "ls", json!({"path": "/"}))]))
    }));
    let agent = builder(model.clone())
        .with_max_iterations(3)
        .build()
        .unwrap();

    let outcome = agent.run("t1", "loop").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::IterationLimit);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(model.calls(), 3);

    let state = agent.state("t1").await.unwrap();
    let ids: Vec<&str> = tool_messages(state.messages())
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.starts_with("call_")));
}

struct ChannelBroadcaster(mpsc::UnboundedSender<&'static str>);

#[async_trait]
impl EventBroadcaster for ChannelBroadcaster {
    fn id(&self) -> &str {
        "channel"
    }

    async fn broadcast(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.0.send(event.event_type_name())?;
        Ok(())
    }
}

#[tokio::test]
async fn lifecycle_events_reach_broadcasters() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = Arc::new(EventDispatcher::new().with_broadcaster(Arc::new(ChannelBroadcaster(tx))));
    let model = Arc::new(ScriptedModel::replying(vec![
        calls(vec![(
            "c1",
            "write_todos",
            json!({"todos": [{"content": "ship", "status": "pending"}]}),
        )]),
        calls(vec![("c2", "read_file", json!({"file_path": "/missing.md"}))]),
        Message::assistant("done"),
    ]));
    let agent = builder(model)
        .with_event_dispatcher(events)
        .build()
        .unwrap();

    agent.run("t1", "plan").await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 7 {
        let name = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(name);
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            "todos_updated",
            "tool_completed",
            "tool_failed",
            "tool_started",
            "tool_started",
            "turn_completed",
            "turn_started",
        ]
    );
}
