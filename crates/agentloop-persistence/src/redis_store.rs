//! Redis-backed session store using a connection manager.
//!
//! Layout per namespace:
//! - `{ns}:session:{id}:events`: list of JSON events, appended with `RPUSH`
//! - `{ns}:session:{id}:meta`: hash with agent name, timestamps and count
//! - `{ns}:sessions`: sorted set of thread ids scored by `updated_at` millis
//!
//! Appends run as one `MULTI`/`EXEC` pipeline so the log and meta never
//! diverge.

use std::collections::HashMap;
use std::time::Duration;

use agentloop_core::persistence::{Session, SessionEvent, SessionStore, SessionSummary};
use agentloop_core::state::AgentState;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};

/// Redis session store with namespace and TTL support.
///
/// ```rust,no_run
/// use agentloop_persistence::RedisSessionStore;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = RedisSessionStore::builder()
///         .url("redis://127.0.0.1:6379")
///         .namespace("myapp")
///         .ttl(Duration::from_secs(7 * 86400))
///         .build()
///         .await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RedisSessionStore {
    connection: ConnectionManager,
    namespace: String,
    ttl: Option<Duration>,
}

impl RedisSessionStore {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        Self::builder().url(url).build().await
    }

    pub fn builder() -> RedisSessionStoreBuilder {
        RedisSessionStoreBuilder::default()
    }

    fn events_key(&self, thread_id: &str) -> String {
        format!("{}:session:{}:events", self.namespace, thread_id)
    }

    fn meta_key(&self, thread_id: &str) -> String {
        format!("{}:session:{}:meta", self.namespace, thread_id)
    }

    fn index_key(&self) -> String {
        format!("{}:sessions", self.namespace)
    }

    async fn read_meta(&self, thread_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.meta_key(thread_id))
            .await
            .context("Failed to read session meta from Redis")?;
        if fields.is_empty() {
            return Ok(None);
        }
        summary_from_fields(thread_id, &fields).map(Some)
    }
}

fn parse_timestamp(fields: &HashMap<String, String>, name: &str) -> anyhow::Result<DateTime<Utc>> {
    let raw = fields
        .get(name)
        .with_context(|| format!("Session meta is missing '{name}'"))?;
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid '{name}' timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn summary_from_fields(
    thread_id: &str,
    fields: &HashMap<String, String>,
) -> anyhow::Result<SessionSummary> {
    Ok(SessionSummary {
        thread_id: thread_id.to_string(),
        agent_name: fields.get("agent_name").cloned().unwrap_or_default(),
        created_at: parse_timestamp(fields, "created_at")?,
        updated_at: parse_timestamp(fields, "updated_at")?,
        event_count: fields
            .get("event_count")
            .map(|c| c.parse::<usize>())
            .transpose()
            .context("Invalid event_count in session meta")?
            .unwrap_or(0),
    })
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn append(
        &self,
        thread_id: &str,
        agent_name: &str,
        events: &[SessionEvent],
    ) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let encoded = events
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to serialize session events")?;

        let now = Utc::now();
        let events_key = self.events_key(thread_id);
        let meta_key = self.meta_key(thread_id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(&events_key, encoded)
            .ignore()
            .hset_nx(&meta_key, "agent_name", agent_name)
            .ignore()
            .hset_nx(&meta_key, "created_at", now.to_rfc3339())
            .ignore()
            .hset(&meta_key, "updated_at", now.to_rfc3339())
            .ignore()
            .hincr(&meta_key, "event_count", events.len())
            .ignore()
            .zadd(self.index_key(), thread_id, now.timestamp_millis())
            .ignore();
        if let Some(ttl) = self.ttl {
            let secs = ttl.as_secs() as i64;
            pipe.expire(&events_key, secs)
                .ignore()
                .expire(&meta_key, secs)
                .ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("Failed to append session events to Redis")?;

        tracing::debug!(
            thread_id = %thread_id,
            namespace = %self.namespace,
            appended = events.len(),
            "Appended session events to Redis"
        );
        Ok(())
    }

    async fn load_session(&self, thread_id: &str) -> anyhow::Result<Option<Session>> {
        let Some(meta) = self.read_meta(thread_id).await? else {
            return Ok(None);
        };
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn
            .lrange(self.events_key(thread_id), 0, -1)
            .await
            .context("Failed to load session events from Redis")?;
        let events = raw
            .iter()
            .map(|line| serde_json::from_str::<SessionEvent>(line))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to deserialize session event from Redis")?;

        Ok(Some(Session {
            thread_id: thread_id.to_string(),
            agent_name: meta.agent_name,
            state: AgentState::replay(thread_id, &events),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }))
    }

    async fn list_threads(&self, agent_name: Option<&str>) -> anyhow::Result<Vec<SessionSummary>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrevrange(self.index_key(), 0, -1)
            .await
            .context("Failed to list sessions from Redis")?;

        let mut summaries = Vec::new();
        for id in ids {
            match self.read_meta(&id).await? {
                Some(meta) if agent_name.map_or(true, |name| meta.agent_name == name) => {
                    summaries.push(meta)
                }
                Some(_) => {}
                // Expired through TTL; drop the stale index entry.
                None => {
                    let _: () = conn.zrem(self.index_key(), &id).await?;
                }
            }
        }
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.connection.clone();
        let removed: usize = conn
            .del(vec![self.events_key(thread_id), self.meta_key(thread_id)])
            .await
            .context("Failed to delete session from Redis")?;
        let _: () = conn
            .zrem(self.index_key(), thread_id)
            .await
            .context("Failed to update session index")?;

        tracing::debug!(
            thread_id = %thread_id,
            namespace = %self.namespace,
            removed,
            "Deleted session from Redis"
        );
        Ok(removed > 0)
    }
}

#[derive(Default)]
pub struct RedisSessionStoreBuilder {
    url: Option<String>,
    namespace: Option<String>,
    ttl: Option<Duration>,
}

impl RedisSessionStoreBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Key prefix (default: "agentloop").
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Expire a thread this long after its last append.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub async fn build(self) -> anyhow::Result<RedisSessionStore> {
        let url = self
            .url
            .ok_or_else(|| anyhow::anyhow!("Redis URL is required"))?;
        let client = redis::Client::open(url.as_str()).context("Failed to create Redis client")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection")?;

        Ok(RedisSessionStore {
            connection,
            namespace: self.namespace.unwrap_or_else(|| "agentloop".to_string()),
            ttl: self.ttl,
        })
    }
}
