//! Session persistence contract: an append-only event log per thread.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hitl::ApprovalRecord;
use crate::messaging::Message;
use crate::state::{AgentState, TodoItem};

/// Opaque identifier of a conversation thread.
pub type ThreadId = String;

/// Maximum number of threads returned by `list_threads` callers that do not
/// pass their own limit.
pub const DEFAULT_THREAD_LIST_LIMIT: usize = 20;

/// New random thread id: the first eight hex digits of a v4 uuid.
pub fn generate_thread_id() -> ThreadId {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reject ids that cannot be used as a single storage key or file name.
pub fn validate_thread_id(thread_id: &str) -> anyhow::Result<()> {
    if thread_id.trim().is_empty() {
        anyhow::bail!("thread id cannot be empty");
    }
    if thread_id.contains('/') || thread_id.contains('\\') || thread_id.contains("..") {
        anyhow::bail!("thread id '{thread_id}' contains a path separator or '..'");
    }
    if thread_id.chars().any(|c| c.is_control()) {
        anyhow::bail!("thread id '{thread_id}' contains control characters");
    }
    Ok(())
}

/// One durable change to an [`AgentState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Message(Message),
    Todos(Vec<TodoItem>),
    Metadata { key: String, value: serde_json::Value },
    Approval(ApprovalRecord),
}

/// A persisted thread with its replayed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub thread_id: ThreadId,
    pub agent_name: String,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub thread_id: ThreadId,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub event_count: usize,
}

/// Durable storage for thread event logs.
///
/// Implementations only ever append; `load` folds the log back into an
/// [`AgentState`]. Distinct threads never contend with each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append events to a thread's log, creating the session on first use.
    async fn append(
        &self,
        thread_id: &str,
        agent_name: &str,
        events: &[SessionEvent],
    ) -> anyhow::Result<()>;

    async fn load_session(&self, thread_id: &str) -> anyhow::Result<Option<Session>>;

    /// Threads sorted by `updated_at`, newest first, optionally filtered by
    /// agent.
    async fn list_threads(&self, agent_name: Option<&str>) -> anyhow::Result<Vec<SessionSummary>>;

    /// Returns `false` when the thread did not exist.
    async fn delete(&self, thread_id: &str) -> anyhow::Result<bool>;

    async fn load(&self, thread_id: &str) -> anyhow::Result<Option<AgentState>> {
        Ok(self.load_session(thread_id).await?.map(|s| s.state))
    }

    async fn most_recent(&self, agent_name: Option<&str>) -> anyhow::Result<Option<SessionSummary>> {
        Ok(self.list_threads(agent_name).await?.into_iter().next())
    }
}

#[derive(Debug, Clone)]
struct StoredThread {
    agent_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<SessionEvent>,
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    threads: std::sync::RwLock<HashMap<ThreadId, StoredThread>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(
        &self,
        thread_id: &str,
        agent_name: &str,
        events: &[SessionEvent],
    ) -> anyhow::Result<()> {
        let mut threads = self
            .threads
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on in-memory session store"))?;
        let now = Utc::now();
        let thread = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| StoredThread {
                agent_name: agent_name.to_string(),
                created_at: now,
                updated_at: now,
                events: Vec::new(),
            });
        thread.events.extend_from_slice(events);
        thread.updated_at = now;
        tracing::debug!(thread_id = %thread_id, appended = events.len(), "Appended session events to memory");
        Ok(())
    }

    async fn load_session(&self, thread_id: &str) -> anyhow::Result<Option<Session>> {
        let threads = self
            .threads
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on in-memory session store"))?;
        Ok(threads.get(thread_id).map(|thread| Session {
            thread_id: thread_id.to_string(),
            agent_name: thread.agent_name.clone(),
            state: AgentState::replay(thread_id, &thread.events),
            created_at: thread.created_at,
            updated_at: thread.updated_at,
        }))
    }

    async fn list_threads(&self, agent_name: Option<&str>) -> anyhow::Result<Vec<SessionSummary>> {
        let threads = self
            .threads
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on in-memory session store"))?;
        let mut summaries: Vec<SessionSummary> = threads
            .iter()
            .filter(|(_, t)| agent_name.map_or(true, |name| t.agent_name == name))
            .map(|(id, t)| SessionSummary {
                thread_id: id.clone(),
                agent_name: t.agent_name.clone(),
                created_at: t.created_at,
                updated_at: t.updated_at,
                event_count: t.events.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> anyhow::Result<bool> {
        let mut threads = self
            .threads
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on in-memory session store"))?;
        let removed = threads.remove(thread_id).is_some();
        tracing::debug!(thread_id = %thread_id, removed, "Deleted thread from memory");
        Ok(removed)
    }
}
