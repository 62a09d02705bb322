//! Session store backed by a local directory.
//!
//! Each thread owns two files: `<id>.jsonl`, the append-only event log with
//! one JSON event per line, and `<id>.meta.json`, the thread's
//! [`SessionSummary`]. The log is the source of truth; the meta file only
//! speeds up listing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use agentloop_core::persistence::{
    validate_thread_id, Session, SessionEvent, SessionStore, SessionSummary,
};
use agentloop_core::state::AgentState;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

const LOG_SUFFIX: &str = ".jsonl";
const META_SUFFIX: &str = ".meta.json";

/// Durable store writing one event log per thread under `root`.
///
/// ```rust,no_run
/// use agentloop_persistence::FileSessionStore;
///
/// let store = FileSessionStore::new("./.agentloop/sessions");
/// ```
pub struct FileSessionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileSessionStore {
    /// The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, thread_id: &str) -> PathBuf {
        self.root.join(format!("{thread_id}{LOG_SUFFIX}"))
    }

    fn meta_path(&self, thread_id: &str) -> PathBuf {
        self.root.join(format!("{thread_id}{META_SUFFIX}"))
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread_id.to_string())
            .or_default()
            .clone()
    }

    async fn read_meta(&self, thread_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        let path = self.meta_path(thread_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Some(meta))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_meta(&self, meta: &SessionSummary) -> anyhow::Result<()> {
        let path = self.meta_path(&meta.thread_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(meta).context("Failed to serialize session meta")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move session meta into {}", path.display()))
    }

    async fn read_events(&self, thread_id: &str) -> anyhow::Result<Option<Vec<SessionEvent>>> {
        let path = self.log_path(thread_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => events.push(event),
                // A crash mid-append can leave a torn final line.
                Err(err) if index + 1 == lines.len() && !content.ends_with('\n') => {
                    tracing::warn!(
                        thread_id = %thread_id,
                        error = %err,
                        "Ignoring truncated final session event"
                    );
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Corrupt event on line {} of {}", index + 1, path.display())
                    })
                }
            }
        }
        Ok(Some(events))
    }

    /// Cuts a torn final line left by a crash so the next append starts on a
    /// fresh line.
    async fn truncate_torn_tail(&self, thread_id: &str, path: &Path) -> anyhow::Result<()> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }
        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |index| index + 1);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.set_len(keep as u64)
            .await
            .with_context(|| format!("Failed to truncate {}", path.display()))?;
        tracing::warn!(
            thread_id = %thread_id,
            dropped_bytes = content.len() - keep,
            "Truncated torn final session event before append"
        );
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn append(
        &self,
        thread_id: &str,
        agent_name: &str,
        events: &[SessionEvent],
    ) -> anyhow::Result<()> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let mut buffer = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buffer, event).context("Failed to serialize session event")?;
            buffer.push(b'\n');
        }
        let path = self.log_path(thread_id);
        self.truncate_torn_tail(thread_id, &path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&buffer)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.flush().await?;

        let now = Utc::now();
        let meta = match self.read_meta(thread_id).await? {
            Some(mut meta) => {
                meta.updated_at = now;
                meta.event_count += events.len();
                meta
            }
            None => SessionSummary {
                thread_id: thread_id.to_string(),
                agent_name: agent_name.to_string(),
                created_at: now,
                updated_at: now,
                event_count: events.len(),
            },
        };
        self.write_meta(&meta).await?;

        tracing::debug!(
            thread_id = %thread_id,
            appended = events.len(),
            total = meta.event_count,
            "Appended session events to file"
        );
        Ok(())
    }

    async fn load_session(&self, thread_id: &str) -> anyhow::Result<Option<Session>> {
        validate_thread_id(thread_id)?;
        let Some(events) = self.read_events(thread_id).await? else {
            return Ok(None);
        };
        let meta = self
            .read_meta(thread_id)
            .await?
            .with_context(|| format!("Session log for '{thread_id}' has no meta file"))?;

        tracing::debug!(thread_id = %thread_id, events = events.len(), "Loaded session from file");
        Ok(Some(Session {
            thread_id: thread_id.to_string(),
            agent_name: meta.agent_name,
            state: AgentState::replay(thread_id, &events),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }))
    }

    async fn list_threads(&self, agent_name: Option<&str>) -> anyhow::Result<Vec<SessionSummary>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut summaries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(thread_id) = file_name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            match self.read_meta(thread_id).await {
                Ok(Some(meta)) if agent_name.map_or(true, |name| meta.agent_name == name) => {
                    summaries.push(meta)
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(thread_id = %thread_id, error = %err, "Skipping unreadable session meta")
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> anyhow::Result<bool> {
        validate_thread_id(thread_id)?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let mut removed = false;
        for path in [self.log_path(thread_id), self.meta_path(thread_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id);
        tracing::debug!(thread_id = %thread_id, removed, "Deleted session files");
        Ok(removed)
    }
}
